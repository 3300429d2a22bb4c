//! Fixed-size `input_event` records as delivered by the kernel

use super::codes::{EV_ABS, EV_KEY, EV_REL, EV_SYN};
use std::io;
use std::os::unix::io::RawFd;

pub const RECORD_SIZE: usize = std::mem::size_of::<libc::input_event>();

/// Upper bound on records decoded per readiness callback
pub const MAX_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Sync,
    Key,
    Absolute,
    Relative,
    Other(u16),
}

impl EventCategory {
    pub fn from_type(event_type: u16) -> Self {
        match event_type {
            EV_SYN => Self::Sync,
            EV_KEY => Self::Key,
            EV_ABS => Self::Absolute,
            EV_REL => Self::Relative,
            other => Self::Other(other),
        }
    }

    pub fn event_type(self) -> u16 {
        match self {
            Self::Sync => EV_SYN,
            Self::Key => EV_KEY,
            Self::Absolute => EV_ABS,
            Self::Relative => EV_REL,
            Self::Other(t) => t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub category: EventCategory,
    pub code: u16,
    pub value: i32,
}

impl RawEvent {
    pub fn new(category: EventCategory, code: u16, value: i32) -> Self {
        Self {
            category,
            code,
            value,
        }
    }
}

/// Result of one bounded read from a device descriptor
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub events: Vec<RawEvent>,
    /// Bytes of a trailing partial record that were discarded
    pub dropped_bytes: usize,
}

/// Decode whole records; returns the number of trailing bytes that did not form a record
pub fn decode_records(bytes: &[u8]) -> (Vec<RawEvent>, usize) {
    let chunks = bytes.chunks_exact(RECORD_SIZE);
    let remainder = chunks.remainder().len();
    let events = chunks
        .map(|chunk| {
            // SAFETY: chunk is exactly RECORD_SIZE bytes and input_event is plain old data
            let raw: libc::input_event =
                unsafe { std::ptr::read_unaligned(chunk.as_ptr() as *const libc::input_event) };
            RawEvent::new(EventCategory::from_type(raw.type_), raw.code, raw.value)
        })
        .collect();
    (events, remainder)
}

pub fn encode_record(event: RawEvent) -> [u8; RECORD_SIZE] {
    let raw = libc::input_event {
        time: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        type_: event.category.event_type(),
        code: event.code,
        value: event.value,
    };
    let mut bytes = [0u8; RECORD_SIZE];
    // SAFETY: bytes is exactly the size of input_event
    unsafe {
        std::ptr::write_unaligned(bytes.as_mut_ptr() as *mut libc::input_event, raw);
    }
    bytes
}

/// Read at most `MAX_BATCH` records from `fd`.
///
/// End of file is reported as `UnexpectedEof`: an evdev node never returns it while the
/// device is alive.
pub fn read_batch(fd: RawFd) -> io::Result<ReadBatch> {
    let mut buffer = [0u8; RECORD_SIZE * MAX_BATCH];
    loop {
        let result = unsafe {
            libc::read(
                fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
            )
        };

        if result < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(ReadBatch::default()),
                _ => return Err(err),
            }
        }

        if result == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "device stream closed",
            ));
        }

        let (events, dropped_bytes) = decode_records(&buffer[..result as usize]);
        return Ok(ReadBatch {
            events,
            dropped_bytes,
        });
    }
}

/// `read_batch` for a named device; a partial trailing record is logged and dropped
pub fn read_events(fd: RawFd, label: &str) -> io::Result<Vec<RawEvent>> {
    let batch = read_batch(fd)?;
    if batch.dropped_bytes > 0 {
        log::warn!(
            "{}: short read, dropped {} bytes of a partial record",
            label,
            batch.dropped_bytes
        );
    }
    Ok(batch.events)
}

/// Write records to `fd` (used for EV_FF play/gain/autocenter requests)
pub fn write_records(fd: RawFd, events: &[RawEvent]) -> io::Result<()> {
    let mut bytes = Vec::with_capacity(events.len() * RECORD_SIZE);
    for event in events {
        bytes.extend_from_slice(&encode_record(*event));
    }
    let written = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    if written as usize != bytes.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {} of {} bytes", written, bytes.len()),
        ));
    }
    Ok(())
}
