//! Hardware-free devices for tests. Events travel through a real pipe so the reactor
//! sees an ordinary readable descriptor.

use super::codes::{ABS_CNT, EV_ABS, EV_KEY, EV_REL, EV_SYN, FF_RUMBLE, KEY_CNT};
use super::record::{encode_record, RawEvent};
use super::{
    AxisConfig, BitSet, Capabilities, DeviceIdentity, DeviceProvider, DeviceSelector, EffectId,
    RawDevice, RumbleEffect,
};
use crate::error::DeviceError;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FfCall {
    Upload {
        slot: Option<EffectId>,
        effect: RumbleEffect,
    },
    Play(EffectId, i32),
    Stop(EffectId),
    Gain(u16),
    Autocenter(u16),
    Grab,
    Release,
}

pub(crate) struct SyntheticDevice {
    identity: DeviceIdentity,
    capabilities: Capabilities,
    pressed: Arc<Mutex<BitSet>>,
    axes: Vec<(u16, AxisConfig)>,
    reader: OwnedFd,
    writer: Option<OwnedFd>,
    calls: Arc<Mutex<Vec<FfCall>>>,
    live: Option<Arc<AtomicUsize>>,
    next_effect: usize,
    grab_refused: bool,
}

/// Write end of a synthetic device's event stream; dropping it disconnects the device
pub(crate) struct Feeder {
    writer: OwnedFd,
}

impl Feeder {
    pub fn send(&self, events: &[RawEvent]) {
        let mut bytes = Vec::new();
        for event in events {
            bytes.extend_from_slice(&encode_record(*event));
        }
        self.send_bytes(&bytes);
    }

    pub fn send_bytes(&self, bytes: &[u8]) {
        let written = unsafe {
            libc::write(
                self.writer.as_raw_fd(),
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
            )
        };
        assert_eq!(written as usize, bytes.len(), "pipe write failed");
    }
}

impl SyntheticDevice {
    pub fn new(identity: DeviceIdentity) -> Self {
        let mut fds = [0 as libc::c_int; 2];
        let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(result, 0, "pipe2 failed: {}", io::Error::last_os_error());
        let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let mut capabilities = Capabilities::empty();
        capabilities.events.insert(EV_SYN as usize);

        Self {
            identity,
            capabilities,
            pressed: Arc::new(Mutex::new(BitSet::new(KEY_CNT))),
            axes: Vec::new(),
            reader,
            writer: Some(writer),
            calls: Arc::new(Mutex::new(Vec::new())),
            live: None,
            next_effect: 0,
            grab_refused: false,
        }
    }

    pub fn named(name: &str) -> Self {
        Self::new(DeviceIdentity {
            name: name.to_string(),
            ..Default::default()
        })
    }

    pub fn with_keys(mut self, codes: &[u16]) -> Self {
        self.capabilities.events.insert(EV_KEY as usize);
        for &code in codes {
            self.capabilities.keys.insert(code as usize);
        }
        self
    }

    pub fn with_pressed(self, codes: &[u16]) -> Self {
        {
            let mut pressed = self.pressed.lock().unwrap();
            for &code in codes {
                pressed.insert(code as usize);
            }
        }
        self
    }

    /// Current key state as reported by `key_state`; tests may change it after open
    pub fn key_states(&self) -> Arc<Mutex<BitSet>> {
        Arc::clone(&self.pressed)
    }

    pub fn with_abs(mut self, code: u16, config: AxisConfig) -> Self {
        assert!((code as usize) < ABS_CNT);
        self.capabilities.events.insert(EV_ABS as usize);
        self.capabilities.abs_axes.insert(code as usize);
        self.axes.retain(|(c, _)| *c != code);
        self.axes.push((code, config));
        self.axes.sort_by_key(|(c, _)| *c);
        self
    }

    pub fn with_rel(mut self, codes: &[u16]) -> Self {
        self.capabilities.events.insert(EV_REL as usize);
        for &code in codes {
            self.capabilities.rel_axes.insert(code as usize);
        }
        self
    }

    pub fn with_rumble(mut self) -> Self {
        self.capabilities.force_feedback.insert(FF_RUMBLE as usize);
        self
    }

    pub fn without_sync(mut self) -> Self {
        self.capabilities.events = BitSet::new(self.capabilities.events.capacity());
        self
    }

    pub fn with_grab_refused(mut self) -> Self {
        self.grab_refused = true;
        self
    }

    pub fn with_live_counter(mut self, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        self.live = Some(live);
        self
    }

    pub fn feeder(&mut self) -> Feeder {
        Feeder {
            writer: self.writer.take().expect("feeder already taken"),
        }
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<FfCall>>> {
        Arc::clone(&self.calls)
    }

    fn record(&self, call: FfCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl fmt::Debug for SyntheticDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntheticDevice")
            .field("identity", &self.identity)
            .field("capabilities", &self.capabilities)
            .field("reader", &self.reader)
            .finish_non_exhaustive()
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        if let Some(ref live) = self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl RawDevice for SyntheticDevice {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn key_state(&self) -> BitSet {
        self.pressed.lock().unwrap().clone()
    }

    fn axis_configs(&self) -> Vec<(u16, AxisConfig)> {
        self.axes.clone()
    }

    fn raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    fn set_nonblocking(&mut self, _nonblocking: bool) -> io::Result<()> {
        Ok(())
    }

    fn upload_effect(
        &mut self,
        effect: &RumbleEffect,
        slot: Option<EffectId>,
    ) -> io::Result<EffectId> {
        self.record(FfCall::Upload {
            slot,
            effect: *effect,
        });
        Ok(slot.unwrap_or_else(|| {
            self.next_effect += 1;
            EffectId(self.next_effect - 1)
        }))
    }

    fn play_effect(&mut self, id: EffectId, count: i32) -> io::Result<()> {
        self.record(FfCall::Play(id, count));
        Ok(())
    }

    fn stop_effect(&mut self, id: EffectId) -> io::Result<()> {
        self.record(FfCall::Stop(id));
        Ok(())
    }

    fn set_gain(&mut self, gain: u16) -> io::Result<()> {
        self.record(FfCall::Gain(gain));
        Ok(())
    }

    fn set_autocenter(&mut self, strength: u16) -> io::Result<()> {
        self.record(FfCall::Autocenter(strength));
        Ok(())
    }

    fn grab(&mut self) -> io::Result<()> {
        if self.grab_refused {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.record(FfCall::Grab);
        Ok(())
    }

    fn release(&mut self) -> io::Result<()> {
        self.record(FfCall::Release);
        Ok(())
    }
}

/// Hands out pre-built synthetic devices by selector, first match in insertion order
#[derive(Default)]
pub(crate) struct SyntheticProvider {
    devices: Mutex<Vec<Option<SyntheticDevice>>>,
}

impl SyntheticProvider {
    pub fn new(devices: Vec<SyntheticDevice>) -> Self {
        Self {
            devices: Mutex::new(devices.into_iter().map(Some).collect()),
        }
    }
}

impl DeviceProvider for SyntheticProvider {
    fn open(&self, selector: &DeviceSelector) -> Result<Box<dyn RawDevice>, DeviceError> {
        let mut devices = self.devices.lock().unwrap();
        let chosen = devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.as_ref().is_some_and(|d| selector.matches(d.identity())))
            .map(|(i, _)| i)
            .nth(selector.index);
        match chosen.and_then(|i| devices[i].take()) {
            Some(device) => Ok(Box::new(device)),
            None => Err(DeviceError::NotFound(selector.to_string())),
        }
    }
}
