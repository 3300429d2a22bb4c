//! Shared single-threaded reactor and per-device dispatch bindings.
//!
//! One thread waits in `poll(2)` on every registered device descriptor. On readiness it reads
//! a bounded batch of records outside any lock, then applies the whole batch to the device's
//! feature table under one lock acquisition. Dispatch to a source happens while holding the
//! registration lock and only after re-checking that the source is still registered, so once
//! `unregister` returns the source never sees another callback.

use crate::device::record;
use crate::device::RawDeviceHandle;
use crate::feature::{FeatureTable, FeatureUpdate};
use crossbeam_channel::{Receiver, Sender};
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

pub type SourceId = u64;

/// Signals from the reactor thread to the owner of a binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchSignal {
    /// Typed updates decoded from one batch, in delivery order
    Updates(Vec<FeatureUpdate>),
    /// Events were lost in an overrun; key and axis state must be re-read from the device
    Resync,
    /// A frame boundary; one per SYN_REPORT, or one per batch for devices without sync
    Frame,
    /// Reading failed; the binding has been removed and will not be retried
    Disconnected(String),
}

trait ReadySource: Send {
    fn fd(&self) -> RawFd;
    fn on_readable(&mut self) -> io::Result<()>;
    fn on_error(&mut self, err: io::Error);
}

struct Shared {
    sources: Mutex<BTreeMap<SourceId, Box<dyn ReadySource>>>,
    next_id: AtomicU64,
    running: AtomicBool,
    wake_write: OwnedFd,
}

impl Shared {
    fn sources(&self) -> MutexGuard<'_, BTreeMap<SourceId, Box<dyn ReadySource>>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        let byte = 1u8;
        let result = unsafe {
            libc::write(
                self.wake_write.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        if result < 0 {
            let err = io::Error::last_os_error();
            // a full pipe already guarantees a wakeup
            if err.kind() != io::ErrorKind::WouldBlock {
                log::warn!("Failed to wake reactor: {}", err);
            }
        }
    }
}

pub struct Reactor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Reactor {
    pub fn start() -> io::Result<Self> {
        let (wake_read, wake_write) = nonblocking_pipe()?;
        let shared = Arc::new(Shared {
            sources: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
            wake_write,
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("inputhub-reactor".to_string())
            .spawn(move || run(thread_shared, wake_read))?;

        log::debug!("Reactor thread started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    fn register(&self, source: Box<dyn ReadySource>) -> SourceId {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.sources().insert(id, source);
        self.shared.wake();
        id
    }

    pub fn source_count(&self) -> usize {
        self.shared.sources().len()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop the thread; registered sources stay registered but are no longer polled
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.wake();
            if thread.join().is_err() {
                log::error!("Reactor thread panicked");
            }
            log::debug!("Reactor thread stopped");
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn nonblocking_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 succeeded, both descriptors are fresh and owned by nobody else
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn drain_wake_pipe(fd: RawFd) {
    let mut buffer = [0u8; 64];
    loop {
        let result =
            unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
        if result <= 0 {
            break;
        }
    }
}

fn run(shared: Arc<Shared>, wake_read: OwnedFd) {
    let mut pollfds: Vec<libc::pollfd> = Vec::new();
    let mut ids: Vec<SourceId> = Vec::new();

    while shared.running.load(Ordering::SeqCst) {
        pollfds.clear();
        ids.clear();
        pollfds.push(libc::pollfd {
            fd: wake_read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for (id, source) in shared.sources().iter() {
            pollfds.push(libc::pollfd {
                fd: source.fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            ids.push(*id);
        }

        let result = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("Reactor poll failed, stopping: {}", err);
            break;
        }

        if pollfds[0].revents != 0 {
            drain_wake_pipe(wake_read.as_raw_fd());
        }

        for (pollfd, id) in pollfds[1..].iter().zip(&ids) {
            if pollfd.revents == 0 {
                continue;
            }

            let mut sources = shared.sources();
            let Some(source) = sources.get_mut(id) else {
                continue;
            };

            let result = if pollfd.revents & libc::POLLNVAL != 0 {
                Err(io::Error::from_raw_os_error(libc::EBADF))
            } else {
                source.on_readable()
            };

            if let Err(e) = result {
                if let Some(mut source) = sources.remove(id) {
                    source.on_error(e);
                }
            }
        }
    }
}

/// Decodes one device's records into its feature table
struct Decoder {
    fd: RawFd,
    label: String,
    table: Arc<FeatureTable>,
    signals: Sender<DispatchSignal>,
}

impl ReadySource for Decoder {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn on_readable(&mut self) -> io::Result<()> {
        let events = record::read_events(self.fd, &self.label)?;
        if events.is_empty() {
            return Ok(());
        }

        let outcome = self.table.apply(&events);

        // receivers may already be gone during teardown
        if !outcome.updates.is_empty() {
            let _ = self.signals.send(DispatchSignal::Updates(outcome.updates));
        }
        if outcome.needs_resync {
            let _ = self.signals.send(DispatchSignal::Resync);
        }
        let frames = if self.table.has_sync() {
            outcome.frames
        } else {
            1
        };
        for _ in 0..frames {
            let _ = self.signals.send(DispatchSignal::Frame);
        }
        Ok(())
    }

    fn on_error(&mut self, err: io::Error) {
        log::error!("{}: read failed, disabling device: {}", self.label, err);
        let _ = self
            .signals
            .send(DispatchSignal::Disconnected(err.to_string()));
    }
}

/// Registration of one device with the reactor; unregisters on drop
pub struct EventDispatchBinding {
    id: SourceId,
    shared: Arc<Shared>,
    registered: bool,
}

impl EventDispatchBinding {
    /// Start decoding `handle`'s records into `table`.
    ///
    /// The handle must outlive the binding: drop or unregister the binding first.
    pub fn register(
        reactor: &Reactor,
        handle: &RawDeviceHandle,
        table: Arc<FeatureTable>,
    ) -> (Self, Receiver<DispatchSignal>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let decoder = Decoder {
            fd: handle.raw_fd(),
            label: handle.identity().name.clone(),
            table,
            signals: sender,
        };
        let id = reactor.register(Box::new(decoder));
        log::debug!("Registered {} as reactor source {}", handle.identity().name, id);

        let binding = Self {
            id,
            shared: Arc::clone(&reactor.shared),
            registered: true,
        };
        (binding, receiver)
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    /// False once unregistered, or after the reactor dropped the source on a read error
    pub fn is_registered(&self) -> bool {
        self.registered && self.shared.sources().contains_key(&self.id)
    }

    /// Returns once the reactor can no longer dispatch to this source
    pub fn unregister(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        let removed = self.shared.sources().remove(&self.id);
        self.shared.wake();
        // dropped outside the registration lock
        drop(removed);
        log::debug!("Unregistered reactor source {}", self.id);
    }
}

impl Drop for EventDispatchBinding {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::codes::{ABS_X, BTN_TRIGGER, REL_X, SYN_DROPPED, SYN_REPORT};
    use crate::device::testing::SyntheticDevice;
    use crate::device::{AxisConfig, EventCategory, RawEvent};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn setup(
        mut device: SyntheticDevice,
    ) -> (
        Reactor,
        RawDeviceHandle,
        Arc<FeatureTable>,
        crate::device::testing::Feeder,
    ) {
        let feeder = device.feeder();
        let handle = RawDeviceHandle::from_device(Box::new(device));
        let table = Arc::new(FeatureTable::build(handle.device(), handle.capabilities()));
        (Reactor::start().unwrap(), handle, table, feeder)
    }

    fn wait_for_frame(receiver: &Receiver<DispatchSignal>) -> Vec<DispatchSignal> {
        let mut seen = Vec::new();
        loop {
            let signal = receiver.recv_timeout(TIMEOUT).expect("no frame from reactor");
            let done = signal == DispatchSignal::Frame;
            seen.push(signal);
            if done {
                return seen;
            }
        }
    }

    #[test]
    fn test_records_reach_table_through_reactor() {
        let device = SyntheticDevice::named("Stick")
            .with_keys(&[BTN_TRIGGER])
            .with_abs(ABS_X, AxisConfig::new(0, 255, 0));
        let (reactor, handle, table, feeder) = setup(device);
        let (binding, receiver) = EventDispatchBinding::register(&reactor, &handle, Arc::clone(&table));

        feeder.send(&[
            RawEvent::new(EventCategory::Key, BTN_TRIGGER, 1),
            RawEvent::new(EventCategory::Absolute, ABS_X, 77),
            RawEvent::new(EventCategory::Sync, SYN_REPORT, 0),
        ]);

        let seen = wait_for_frame(&receiver);
        assert_eq!(
            seen[0],
            DispatchSignal::Updates(vec![
                FeatureUpdate::Key {
                    index: 0,
                    pressed: true
                },
                FeatureUpdate::Absolute {
                    index: 0,
                    value: 77
                },
            ])
        );
        let values = table.snapshot();
        assert_eq!(values.keys, vec![true]);
        assert_eq!(values.abs_axes, vec![77]);
        assert!(binding.is_registered());
        drop(binding);
        assert_eq!(reactor.source_count(), 0);
    }

    #[test]
    fn test_relative_deltas_accumulate_until_drained() {
        let device = SyntheticDevice::named("Mouse").with_rel(&[REL_X]);
        let (reactor, handle, table, feeder) = setup(device);
        let (_binding, receiver) = EventDispatchBinding::register(&reactor, &handle, Arc::clone(&table));

        for delta in [4, -1, 2] {
            feeder.send(&[
                RawEvent::new(EventCategory::Relative, REL_X, delta),
                RawEvent::new(EventCategory::Sync, SYN_REPORT, 0),
            ]);
            wait_for_frame(&receiver);
        }
        assert_eq!(table.snapshot().rel_accumulators, vec![5]);
    }

    #[test]
    fn test_no_callbacks_after_unregister() {
        let device = SyntheticDevice::named("Stick").with_abs(ABS_X, AxisConfig::new(0, 255, 0));
        let (reactor, handle, table, feeder) = setup(device);
        let (mut binding, receiver) = EventDispatchBinding::register(&reactor, &handle, Arc::clone(&table));

        binding.unregister();
        feeder.send(&[
            RawEvent::new(EventCategory::Absolute, ABS_X, 250),
            RawEvent::new(EventCategory::Sync, SYN_REPORT, 0),
        ]);

        // the decoder (and its sender) is gone, so the channel reports disconnection
        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(table.snapshot().abs_axes, vec![127]);
        assert!(!binding.is_registered());
    }

    #[test]
    fn test_read_error_disconnects_once() {
        let device = SyntheticDevice::named("Flaky").with_abs(ABS_X, AxisConfig::new(0, 255, 0));
        let (reactor, handle, table, feeder) = setup(device);
        let (binding, receiver) = EventDispatchBinding::register(&reactor, &handle, table);

        drop(feeder);

        let signal = receiver.recv_timeout(TIMEOUT).unwrap();
        assert!(matches!(signal, DispatchSignal::Disconnected(_)));
        assert!(!binding.is_registered());
        assert_eq!(reactor.source_count(), 0);
    }

    #[test]
    fn test_partial_record_is_dropped() {
        let device = SyntheticDevice::named("Stick").with_abs(ABS_X, AxisConfig::new(0, 255, 0));
        let (reactor, handle, table, feeder) = setup(device);
        let (_binding, receiver) = EventDispatchBinding::register(&reactor, &handle, Arc::clone(&table));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&record::encode_record(RawEvent::new(
            EventCategory::Absolute,
            ABS_X,
            9,
        )));
        bytes.extend_from_slice(&record::encode_record(RawEvent::new(
            EventCategory::Sync,
            SYN_REPORT,
            0,
        )));
        bytes.extend_from_slice(&[0xff; 5]);
        feeder.send_bytes(&bytes);

        wait_for_frame(&receiver);
        assert_eq!(table.snapshot().abs_axes, vec![9]);
    }

    #[test]
    fn test_device_without_sync_gets_frame_per_batch() {
        let device = SyntheticDevice::named("NoSync")
            .with_abs(ABS_X, AxisConfig::new(0, 255, 0))
            .without_sync();
        let (reactor, handle, table, feeder) = setup(device);
        let (_binding, receiver) = EventDispatchBinding::register(&reactor, &handle, Arc::clone(&table));

        feeder.send(&[RawEvent::new(EventCategory::Absolute, ABS_X, 3)]);
        wait_for_frame(&receiver);
        assert_eq!(table.snapshot().abs_axes, vec![3]);
    }

    #[test]
    fn test_overrun_requests_resync_before_frame() {
        let device = SyntheticDevice::named("Stick").with_abs(ABS_X, AxisConfig::new(0, 255, 0));
        let (reactor, handle, table, feeder) = setup(device);
        let (_binding, receiver) = EventDispatchBinding::register(&reactor, &handle, Arc::clone(&table));

        feeder.send(&[
            RawEvent::new(EventCategory::Sync, SYN_DROPPED, 0),
            RawEvent::new(EventCategory::Absolute, ABS_X, 5),
            RawEvent::new(EventCategory::Sync, SYN_REPORT, 0),
        ]);

        let seen = wait_for_frame(&receiver);
        assert_eq!(seen, vec![DispatchSignal::Resync, DispatchSignal::Frame]);
        assert_eq!(table.snapshot().abs_axes, vec![127]);
    }

    #[test]
    fn test_shutdown_stops_thread() {
        let mut reactor = Reactor::start().unwrap();
        assert!(reactor.is_running());
        reactor.shutdown();
        assert!(!reactor.is_running());
    }
}
