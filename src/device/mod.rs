mod bitset;
pub mod codes;
#[cfg(target_os = "linux")]
mod linux;
pub mod record;
mod selector;
#[cfg(test)]
pub(crate) mod testing;

pub use bitset::BitSet;
#[cfg(target_os = "linux")]
pub use linux::{enumerate_event_nodes, EvdevDevice, EvdevProvider, INPUT_DIR};
pub use record::{EventCategory, RawEvent, ReadBatch};
pub use selector::DeviceSelector;

use crate::error::DeviceError;
use codes::{ABS_CNT, EV_CNT, EV_SYN, FF_CNT, FF_RUMBLE, KEY_CNT, REL_CNT};
use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
    pub name: String,
    pub serial: Option<String>,
    pub path: PathBuf,
}

/// Per-category capability bitmaps, fixed once the device is open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Supported event types; EV_SYN here means the device reports frame boundaries
    pub events: BitSet,
    pub keys: BitSet,
    pub abs_axes: BitSet,
    pub rel_axes: BitSet,
    pub force_feedback: BitSet,
}

impl Capabilities {
    pub fn empty() -> Self {
        Self {
            events: BitSet::new(EV_CNT),
            keys: BitSet::new(KEY_CNT),
            abs_axes: BitSet::new(ABS_CNT),
            rel_axes: BitSet::new(REL_CNT),
            force_feedback: BitSet::new(FF_CNT),
        }
    }

    pub fn has_sync(&self) -> bool {
        self.events.contains(EV_SYN as usize)
    }

    pub fn has_rumble(&self) -> bool {
        self.force_feedback.contains(FF_RUMBLE as usize)
    }
}

/// Absolute axis parameters as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisConfig {
    pub value: i32,
    pub min: i32,
    pub max: i32,
    pub fuzz: i32,
    pub flat: i32,
    pub resolution: i32,
}

impl AxisConfig {
    pub fn new(min: i32, max: i32, flat: i32) -> Self {
        Self {
            value: min + (max - min) / 2,
            min,
            max,
            flat,
            ..Default::default()
        }
    }

    /// Restore min <= max for devices that report an inverted range
    pub fn normalized(mut self) -> Self {
        if self.min > self.max {
            log::warn!(
                "Axis reports inverted range {}..{}, swapping",
                self.min,
                self.max
            );
            std::mem::swap(&mut self.min, &mut self.max);
        }
        self.flat = self.flat.max(0);
        self
    }
}

/// Slot of an uploaded force feedback effect on one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RumbleEffect {
    pub duration_ms: u16,
    pub strong_magnitude: u16,
    pub weak_magnitude: u16,
}

/// One opened physical device.
///
/// Implementations must close the device when dropped.
pub trait RawDevice: Send {
    fn identity(&self) -> &DeviceIdentity;

    /// Categories the OS refuses to report come back empty
    fn capabilities(&self) -> Capabilities;

    /// Bulk snapshot of currently pressed keys
    fn key_state(&self) -> BitSet;

    /// (code, config) for each supported absolute axis, ascending
    fn axis_configs(&self) -> Vec<(u16, AxisConfig)>;

    /// Descriptor delivering fixed-size event records
    fn raw_fd(&self) -> RawFd;

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()>;

    fn feature_name(&self, category: EventCategory, code: u16) -> String {
        match category {
            EventCategory::Key => format!("KEY_{:#x}", code),
            EventCategory::Absolute => format!("ABS_{:#x}", code),
            EventCategory::Relative => format!("REL_{:#x}", code),
            _ => format!("{:?}_{:#x}", category, code),
        }
    }

    /// Upload a new effect, or replace the one in `slot`
    fn upload_effect(&mut self, effect: &RumbleEffect, slot: Option<EffectId>)
        -> io::Result<EffectId>;

    fn play_effect(&mut self, id: EffectId, count: i32) -> io::Result<()>;

    fn stop_effect(&mut self, id: EffectId) -> io::Result<()>;

    fn set_gain(&mut self, gain: u16) -> io::Result<()>;

    fn set_autocenter(&mut self, strength: u16) -> io::Result<()>;

    fn grab(&mut self) -> io::Result<()>;

    fn release(&mut self) -> io::Result<()>;
}

/// Opens raw devices by selector
pub trait DeviceProvider {
    fn open(&self, selector: &DeviceSelector) -> Result<Box<dyn RawDevice>, DeviceError>;
}

/// Owner of one opened device with its capabilities read once at open
pub struct RawDeviceHandle {
    device: Box<dyn RawDevice>,
    capabilities: Capabilities,
    grabbed: bool,
}

impl RawDeviceHandle {
    pub fn open(
        provider: &dyn DeviceProvider,
        selector: &DeviceSelector,
    ) -> Result<Self, DeviceError> {
        let device = provider.open(selector)?;
        Ok(Self::from_device(device))
    }

    pub fn from_device(device: Box<dyn RawDevice>) -> Self {
        let capabilities = device.capabilities();
        log::debug!(
            "{}: {} keys, {} abs axes, {} rel axes, sync: {}, FF types: {}",
            device.identity().name,
            capabilities.keys.count(),
            capabilities.abs_axes.count(),
            capabilities.rel_axes.count(),
            capabilities.has_sync(),
            capabilities.force_feedback.count()
        );
        Self {
            device,
            capabilities,
            grabbed: false,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.device.identity()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn device(&self) -> &dyn RawDevice {
        self.device.as_ref()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.device.raw_fd()
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), DeviceError> {
        Ok(self.device.set_nonblocking(nonblocking)?)
    }

    /// Read and decode one batch of pending records.
    ///
    /// Errors mean the device is gone; the caller must not retry.
    pub fn read_events(&mut self) -> Result<Vec<RawEvent>, DeviceError> {
        Ok(record::read_events(self.device.raw_fd(), &self.identity().name)?)
    }

    pub fn has_force_feedback(&self) -> bool {
        !self.capabilities.force_feedback.is_empty()
    }

    pub fn write_effect(
        &mut self,
        effect: &RumbleEffect,
        slot: Option<EffectId>,
    ) -> Result<EffectId, DeviceError> {
        Ok(self.device.upload_effect(effect, slot)?)
    }

    pub fn play_effect(&mut self, id: EffectId, count: i32) -> Result<(), DeviceError> {
        Ok(self.device.play_effect(id, count)?)
    }

    pub fn stop_effect(&mut self, id: EffectId) -> Result<(), DeviceError> {
        Ok(self.device.stop_effect(id)?)
    }

    pub fn set_gain(&mut self, gain: u16) -> Result<(), DeviceError> {
        Ok(self.device.set_gain(gain)?)
    }

    pub fn set_autocenter(&mut self, strength: u16) -> Result<(), DeviceError> {
        Ok(self.device.set_autocenter(strength)?)
    }

    /// Exclusive access; false when another client already holds the device
    pub fn grab(&mut self) -> bool {
        match self.device.grab() {
            Ok(()) => {
                self.grabbed = true;
                true
            }
            Err(e) => {
                log::debug!("Could not grab {}: {}", self.identity().name, e);
                false
            }
        }
    }

    pub fn release(&mut self) -> bool {
        if !self.grabbed {
            return false;
        }
        match self.device.release() {
            Ok(()) => {
                self.grabbed = false;
                true
            }
            Err(e) => {
                log::debug!("Could not release {}: {}", self.identity().name, e);
                false
            }
        }
    }
}

impl Drop for RawDeviceHandle {
    fn drop(&mut self) {
        if self.grabbed {
            self.release();
        }
        log::debug!("Closing {}", self.identity().name);
    }
}
