use super::codes::{ABS_CNT, EV_CNT, EV_FF, FF_AUTOCENTER, FF_CNT, FF_GAIN, KEY_CNT, REL_CNT};
use super::record::{self, EventCategory, RawEvent};
use super::{
    AxisConfig, BitSet, Capabilities, DeviceIdentity, DeviceProvider, DeviceSelector, EffectId,
    RawDevice, RumbleEffect,
};
use crate::error::DeviceError;
use evdev::{
    AbsoluteAxisCode, Device, FFEffect, FFEffectData, FFEffectKind, FFReplay, FFTrigger, KeyCode,
    RelativeAxisCode,
};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

pub const INPUT_DIR: &str = "/dev/input";

/// `/dev/input/event<N>` nodes ordered by N
pub fn enumerate_event_nodes(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut nodes: Vec<(u32, PathBuf)> = std::fs::read_dir(dir)?
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let number = path
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix("event"))
                .and_then(|s| s.parse::<u32>().ok())?;
            Some((number, path))
        })
        .collect();
    nodes.sort_by_key(|(number, _)| *number);
    Ok(nodes.into_iter().map(|(_, path)| path).collect())
}

/// A category the device does not report (`None`) is an empty set
fn code_bits(len: usize, codes: Option<impl Iterator<Item = u16>>) -> BitSet {
    match codes {
        Some(codes) => BitSet::from_codes(len, codes.map(usize::from)),
        None => BitSet::new(len),
    }
}

pub struct EvdevDevice {
    device: Device,
    identity: DeviceIdentity,
    effects: Vec<Option<FFEffect>>,
}

impl EvdevDevice {
    pub fn open(path: &Path) -> io::Result<Self> {
        let device = Device::open(path)?;
        let input_id = device.input_id();
        let identity = DeviceIdentity {
            vendor: input_id.vendor(),
            product: input_id.product(),
            version: input_id.version(),
            name: device.name().unwrap_or("Unknown").to_string(),
            serial: device
                .unique_name()
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            path: path.to_path_buf(),
        };

        Ok(Self {
            device,
            identity,
            effects: Vec::new(),
        })
    }

    fn rumble_data(effect: &RumbleEffect) -> FFEffectData {
        FFEffectData {
            direction: 0,
            trigger: FFTrigger::default(),
            replay: FFReplay {
                length: effect.duration_ms,
                delay: 0,
            },
            kind: FFEffectKind::Rumble {
                strong_magnitude: effect.strong_magnitude,
                weak_magnitude: effect.weak_magnitude,
            },
        }
    }

    fn effect_mut(&mut self, id: EffectId) -> io::Result<&mut FFEffect> {
        self.effects
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such effect"))
    }

    fn write_ff(&mut self, code: u16, value: u16) -> io::Result<()> {
        let event = RawEvent::new(EventCategory::Other(EV_FF), code, value as i32);
        record::write_records(self.device.as_raw_fd(), &[event])
    }
}

impl RawDevice for EvdevDevice {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn capabilities(&self) -> Capabilities {
        let device = &self.device;
        Capabilities {
            events: code_bits(EV_CNT, Some(device.supported_events().iter().map(|t| t.0))),
            keys: code_bits(KEY_CNT, device.supported_keys().map(|s| s.iter().map(|k| k.0))),
            abs_axes: code_bits(
                ABS_CNT,
                device.supported_absolute_axes().map(|s| s.iter().map(|a| a.0)),
            ),
            rel_axes: code_bits(
                REL_CNT,
                device.supported_relative_axes().map(|s| s.iter().map(|a| a.0)),
            ),
            force_feedback: code_bits(FF_CNT, device.supported_ff().map(|s| s.iter().map(|e| e.0))),
        }
    }

    fn key_state(&self) -> BitSet {
        match self.device.get_key_state() {
            Ok(pressed) => code_bits(KEY_CNT, Some(pressed.iter().map(|k| k.0))),
            Err(e) => {
                log::debug!("{}: key state query refused: {}", self.identity.name, e);
                BitSet::new(KEY_CNT)
            }
        }
    }

    fn axis_configs(&self) -> Vec<(u16, AxisConfig)> {
        let mut configs: Vec<(u16, AxisConfig)> = match self.device.get_absinfo() {
            Ok(info) => info
                .map(|(axis, info)| {
                    (
                        axis.0,
                        AxisConfig {
                            value: info.value(),
                            min: info.minimum(),
                            max: info.maximum(),
                            fuzz: info.fuzz(),
                            flat: info.flat(),
                            resolution: info.resolution(),
                        },
                    )
                })
                .collect(),
            Err(e) => {
                log::warn!("{}: failed to read axis info: {}", self.identity.name, e);
                Vec::new()
            }
        };
        configs.sort_by_key(|(code, _)| *code);
        configs
    }

    fn raw_fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        let fd = self.device.as_raw_fd();
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            let flags = if nonblocking {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            };
            if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn feature_name(&self, category: EventCategory, code: u16) -> String {
        match category {
            EventCategory::Key => format!("{:?}", KeyCode(code)),
            EventCategory::Absolute => format!("{:?}", AbsoluteAxisCode(code)),
            EventCategory::Relative => format!("{:?}", RelativeAxisCode(code)),
            _ => format!("{:?}_{:#x}", category, code),
        }
    }

    fn upload_effect(
        &mut self,
        effect: &RumbleEffect,
        slot: Option<EffectId>,
    ) -> io::Result<EffectId> {
        let data = Self::rumble_data(effect);
        if let Some(id) = slot {
            if let Ok(existing) = self.effect_mut(id) {
                existing.update(data)?;
                return Ok(id);
            }
        }

        let uploaded = self.device.upload_ff_effect(data)?;
        log::debug!(
            "{}: uploaded rumble effect {}",
            self.identity.name,
            uploaded.id()
        );
        let id = match self.effects.iter().position(Option::is_none) {
            Some(free) => {
                self.effects[free] = Some(uploaded);
                free
            }
            None => {
                self.effects.push(Some(uploaded));
                self.effects.len() - 1
            }
        };
        Ok(EffectId(id))
    }

    fn play_effect(&mut self, id: EffectId, count: i32) -> io::Result<()> {
        self.effect_mut(id)?.play(count)
    }

    fn stop_effect(&mut self, id: EffectId) -> io::Result<()> {
        self.effect_mut(id)?.stop()
    }

    fn set_gain(&mut self, gain: u16) -> io::Result<()> {
        self.write_ff(FF_GAIN, gain)
    }

    fn set_autocenter(&mut self, strength: u16) -> io::Result<()> {
        self.write_ff(FF_AUTOCENTER, strength)
    }

    fn grab(&mut self) -> io::Result<()> {
        self.device.grab()
    }

    fn release(&mut self) -> io::Result<()> {
        self.device.ungrab()
    }
}

impl Drop for EvdevDevice {
    fn drop(&mut self) {
        // effects are erased by the kernel when dropped; stop them first
        for effect in self.effects.iter_mut().flatten() {
            if let Err(e) = effect.stop() {
                log::warn!("Failed to stop effect on {}: {}", self.identity.name, e);
            }
        }
        self.effects.clear();
    }
}

/// Opens evdev nodes under a directory in stable numeric order
#[derive(Debug, Clone)]
pub struct EvdevProvider {
    dir: PathBuf,
}

impl EvdevProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn open_matching(&self, selector: &DeviceSelector) -> Result<EvdevDevice, DeviceError> {
        let nodes = enumerate_event_nodes(&self.dir)?;
        selector.select(nodes.into_iter().map(|path| {
            let opened = EvdevDevice::open(&path);
            (path, opened)
        }))
    }
}

impl Default for EvdevProvider {
    fn default() -> Self {
        Self::new(INPUT_DIR)
    }
}

impl DeviceProvider for EvdevProvider {
    fn open(&self, selector: &DeviceSelector) -> Result<Box<dyn RawDevice>, DeviceError> {
        let mut device = self.open_matching(selector)?;
        device.set_nonblocking(true)?;
        Ok(Box::new(device))
    }
}
