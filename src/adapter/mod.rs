//! Translation from physical feature tables into canonical logical devices.
//!
//! Each configured device entry feeds one logical device from one or more opened handles
//! ("parts"), each with its own feature table, ignore lists and reactor binding. Buttons are the
//! unignored keys of each part in turn, in code order within a part. Valuators are the unignored
//! absolute axes of all parts, followed by the unignored relative axes of all parts.

pub mod mapper;

pub use mapper::AxisValueMapper;

use crate::config::{AdapterConfig, DeviceEntryConfig, PhysicalDeviceConfig};
use crate::device::{DeviceProvider, EffectId, EventCategory, RawDeviceHandle};
use crate::dispatch::{DispatchSignal, EventDispatchBinding, Reactor};
use crate::error::{AdapterError, DeviceError};
use crate::feature::{FeatureTable, FeatureUpdate};
use crate::haptic::rumble_for;
use crate::registry::{DeviceId, DeviceSlab, Feature, FeatureKind};
use crossbeam_channel::Receiver;
use std::sync::Arc;

pub type AdapterId = usize;

/// Observer of individual feature changes, called on the thread that drains the adapter
pub type ChangeListener = Box<dyn FnMut(DeviceId, FeatureChange)>;

/// One decoded change, addressed by canonical feature index
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureChange {
    Button { index: usize, pressed: bool },
    /// Mapped absolute axis value
    Valuator { index: usize, value: f64 },
    /// Raw relative delta, before accumulation into the valuator
    RelativeDelta { index: usize, delta: i32 },
}

/// Shape of the logical device one entry feeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryLayout {
    pub name: String,
    pub num_buttons: usize,
    pub num_valuators: usize,
    /// Some part can play rumble effects
    pub haptic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValuatorSource {
    Absolute { part: usize, index: usize },
    Relative { part: usize, index: usize },
}

/// Canonical position of each dense feature of one part, `None` when ignored
#[derive(Debug, Default)]
struct FeatureRoutes {
    keys: Vec<Option<usize>>,
    abs_axes: Vec<Option<(usize, AxisValueMapper)>>,
    rel_axes: Vec<Option<usize>>,
}

impl FeatureRoutes {
    fn sized(table: &FeatureTable) -> Self {
        Self {
            keys: vec![None; table.keys().len()],
            abs_axes: vec![None; table.abs_axes().len()],
            rel_axes: vec![None; table.rel_axes().len()],
        }
    }

    fn change_for(&self, update: &FeatureUpdate) -> Option<FeatureChange> {
        match *update {
            FeatureUpdate::Key { index, pressed } => Some(FeatureChange::Button {
                index: self.keys.get(index).copied().flatten()?,
                pressed,
            }),
            FeatureUpdate::Absolute { index, value } => {
                let (position, mapper) = self.abs_axes.get(index).copied().flatten()?;
                Some(FeatureChange::Valuator {
                    index: position,
                    value: mapper.map(value as f64),
                })
            }
            FeatureUpdate::Relative { index, delta } => Some(FeatureChange::RelativeDelta {
                index: self.rel_axes.get(index).copied().flatten()?,
                delta,
            }),
        }
    }
}

// Field order matters: the binding must drop before the handle it reads from.
struct DevicePart {
    binding: Option<EventDispatchBinding>,
    signals: Receiver<DispatchSignal>,
    table: Arc<FeatureTable>,
    handle: RawDeviceHandle,
    routes: FeatureRoutes,
    pending_frames: usize,
    disabled: bool,
    effect: Option<EffectId>,
}

/// Dense indices in `0..count` not named by `ignored`; out-of-range entries are skipped
fn retained(entry: &str, category: &str, count: usize, ignored: &[i64]) -> Vec<usize> {
    for &index in ignored {
        if index < 0 || index as usize >= count {
            log::warn!(
                "{}: ignore list entry {} is out of range for {} {} features",
                entry,
                index,
                count,
                category
            );
        }
    }
    (0..count)
        .filter(|&index| !ignored.contains(&(index as i64)))
        .collect()
}

fn unit_to_u16(value: f32) -> u16 {
    (value.clamp(0.0, 1.0) * u16::MAX as f32) as u16
}

impl DevicePart {
    /// Open and configure the device; events flow only after `register`
    fn open(
        entry: &str,
        config: &PhysicalDeviceConfig,
        provider: &dyn DeviceProvider,
    ) -> Result<Self, AdapterError> {
        let selector = config.selector()?;
        let mut handle =
            RawDeviceHandle::open(provider, &selector).map_err(|source| AdapterError::Device {
                entry: entry.to_string(),
                source,
            })?;
        log::info!(
            "{}: opened '{}' ({:04x}:{:04x}) at {}",
            entry,
            handle.identity().name,
            handle.identity().vendor,
            handle.identity().product,
            handle.identity().path.display()
        );

        if config.grab_device && !handle.grab() {
            log::warn!(
                "{}: could not grab '{}', continuing shared",
                entry,
                handle.identity().name
            );
        }
        if handle.has_force_feedback() {
            if let Some(gain) = config.force_feedback_gain {
                if let Err(e) = handle.set_gain(unit_to_u16(gain)) {
                    log::warn!("{}: failed to set force feedback gain: {}", entry, e);
                }
            }
            if let Some(strength) = config.autocenter {
                if let Err(e) = handle.set_autocenter(unit_to_u16(strength)) {
                    log::warn!("{}: failed to set autocenter: {}", entry, e);
                }
            }
        }

        let table = Arc::new(FeatureTable::build(handle.device(), handle.capabilities()));
        Ok(Self {
            binding: None,
            signals: crossbeam_channel::never(),
            routes: FeatureRoutes::sized(&table),
            table,
            handle,
            pending_frames: 0,
            disabled: false,
            effect: None,
        })
    }

    fn register(&mut self, reactor: &Reactor) {
        let (binding, signals) =
            EventDispatchBinding::register(reactor, &self.handle, Arc::clone(&self.table));
        self.binding = Some(binding);
        self.signals = signals;
    }

    fn feature_name(&self, category: EventCategory, index: usize) -> String {
        let map = match category {
            EventCategory::Key => self.table.keys(),
            EventCategory::Absolute => self.table.abs_axes(),
            _ => self.table.rel_axes(),
        };
        self.handle
            .device()
            .feature_name(category, map.code_of(index).unwrap_or_default())
    }

    fn drain_signals(
        &mut self,
        entry: &str,
        device: Option<DeviceId>,
        listener: &mut Option<ChangeListener>,
    ) {
        for signal in self.signals.try_iter() {
            match signal {
                DispatchSignal::Frame => self.pending_frames += 1,
                DispatchSignal::Updates(updates) => {
                    if let (Some(listener), Some(device)) = (listener.as_mut(), device) {
                        for change in updates.iter().filter_map(|u| self.routes.change_for(u)) {
                            listener(device, change);
                        }
                    }
                }
                DispatchSignal::Resync => self.table.resync(self.handle.device()),
                DispatchSignal::Disconnected(reason) => {
                    if !self.disabled {
                        log::warn!(
                            "{}: '{}' disconnected ({}), keeping last state",
                            entry,
                            self.handle.identity().name,
                            reason
                        );
                    }
                    self.disabled = true;
                }
            }
        }
        if self.disabled {
            // the reactor already dropped the source
            self.binding = None;
        }
    }

    fn haptic_tick(
        &mut self,
        duration_ms: u32,
        frequency: u32,
        amplitude: f32,
    ) -> Result<(), DeviceError> {
        let effect = rumble_for(duration_ms, frequency, amplitude);
        let id = self.handle.write_effect(&effect, self.effect)?;
        self.effect = Some(id);
        self.handle.play_effect(id, 1)
    }
}

impl Drop for DevicePart {
    fn drop(&mut self) {
        if let Some(mut binding) = self.binding.take() {
            binding.unregister();
        }
        if let Some(id) = self.effect.take() {
            if let Err(e) = self.handle.stop_effect(id) {
                log::warn!(
                    "Failed to stop effect on '{}': {}",
                    self.handle.identity().name,
                    e
                );
            }
        }
    }
}

struct AdapterEntry {
    name: String,
    parts: Vec<DevicePart>,
    /// (part, dense key index) per button
    buttons: Vec<(usize, usize)>,
    valuators: Vec<(ValuatorSource, AxisValueMapper)>,
    button_names: Vec<String>,
    valuator_names: Vec<String>,
    device: Option<DeviceId>,
}

impl AdapterEntry {
    fn open(
        config: &DeviceEntryConfig,
        provider: &dyn DeviceProvider,
        reactor: &Reactor,
    ) -> Result<Self, AdapterError> {
        let mut overrides = config.valuator_mappings()?;

        let mut parts: Vec<DevicePart> = Vec::new();
        let mut buttons = Vec::new();
        let mut abs_axes = Vec::new();
        let mut rel_axes = Vec::new();
        for physical in config.physical_devices() {
            let part = DevicePart::open(&config.name, physical, provider)?;
            let owner = parts.len();
            let table = &part.table;
            buttons.extend(
                retained(
                    &config.name,
                    "key",
                    table.keys().len(),
                    &physical.ignore_key_features,
                )
                .into_iter()
                .map(|index| (owner, index)),
            );
            abs_axes.extend(
                retained(
                    &config.name,
                    "absolute axis",
                    table.abs_axes().len(),
                    &physical.ignore_abs_axis_features,
                )
                .into_iter()
                .map(|index| (owner, index)),
            );
            rel_axes.extend(
                retained(
                    &config.name,
                    "relative axis",
                    table.rel_axes().len(),
                    &physical.ignore_rel_axis_features,
                )
                .into_iter()
                .map(|index| (owner, index)),
            );
            parts.push(part);
        }

        let mut valuators = Vec::with_capacity(abs_axes.len() + rel_axes.len());
        for (part, index) in abs_axes {
            let axis = parts[part].table.abs_config(index).copied().unwrap_or_default();
            let mapper = match overrides.remove(&valuators.len()) {
                Some(values) => AxisValueMapper::from_normalized(&axis, values)?,
                None => AxisValueMapper::from_axis(&axis),
            };
            valuators.push((ValuatorSource::Absolute { part, index }, mapper));
        }
        for (part, index) in rel_axes {
            let mapper = match overrides.remove(&valuators.len()) {
                Some([min, dead_min, dead_max, max]) => {
                    AxisValueMapper::new(min, dead_min, dead_max, max)?
                }
                None => AxisValueMapper::relative_default(),
            };
            valuators.push((ValuatorSource::Relative { part, index }, mapper));
        }
        for valuator in overrides.keys() {
            log::warn!(
                "{}: valuatorMapping{} has no matching valuator ({} present)",
                config.name,
                valuator,
                valuators.len()
            );
        }

        for (position, &(part, index)) in buttons.iter().enumerate() {
            parts[part].routes.keys[index] = Some(position);
        }
        for (position, &(source, mapper)) in valuators.iter().enumerate() {
            match source {
                ValuatorSource::Absolute { part, index } => {
                    parts[part].routes.abs_axes[index] = Some((position, mapper))
                }
                ValuatorSource::Relative { part, index } => {
                    parts[part].routes.rel_axes[index] = Some(position)
                }
            }
        }

        let button_names = buttons
            .iter()
            .enumerate()
            .map(|(position, &(part, index))| match config.button_names.get(position) {
                Some(name) => name.clone(),
                None => parts[part].feature_name(EventCategory::Key, index),
            })
            .collect();
        let valuator_names = valuators
            .iter()
            .enumerate()
            .map(|(position, (source, _))| match config.valuator_names.get(position) {
                Some(name) => name.clone(),
                None => match *source {
                    ValuatorSource::Absolute { part, index } => {
                        parts[part].feature_name(EventCategory::Absolute, index)
                    }
                    ValuatorSource::Relative { part, index } => {
                        parts[part].feature_name(EventCategory::Relative, index)
                    }
                },
            })
            .collect();

        if parts.len() > 1 {
            log::info!("{}: fed by {} devices", config.name, parts.len());
        }
        for part in &mut parts {
            part.register(reactor);
        }

        Ok(Self {
            name: config.name.clone(),
            parts,
            buttons,
            valuators,
            button_names,
            valuator_names,
            device: None,
        })
    }

    fn layout(&self) -> EntryLayout {
        EntryLayout {
            name: self.name.clone(),
            num_buttons: self.buttons.len(),
            num_valuators: self.valuators.len(),
            haptic: self
                .parts
                .iter()
                .any(|part| part.handle.capabilities().has_rumble()),
        }
    }

    fn is_disabled(&self) -> bool {
        self.parts.iter().any(|part| part.disabled)
    }

    /// Collect signals from the reactor without touching the logical device
    fn drain_signals(&mut self, listener: &mut Option<ChangeListener>) {
        let device = self.device;
        for part in &mut self.parts {
            part.drain_signals(&self.name, device, listener);
        }
    }

    fn pending_frames(&self) -> usize {
        self.parts.iter().map(|part| part.pending_frames).sum()
    }

    fn propagate(
        &mut self,
        devices: &mut DeviceSlab,
        listener: &mut Option<ChangeListener>,
    ) -> usize {
        self.drain_signals(listener);
        let frames = self
            .parts
            .iter_mut()
            .map(|part| std::mem::take(&mut part.pending_frames))
            .sum();
        let Some(logical) = self.device.and_then(|id| devices.get_mut(id)) else {
            return frames;
        };

        // a disconnected part leaves its features at their last values
        for (owner, feed) in self.parts.iter().enumerate() {
            if feed.disabled {
                continue;
            }
            let mut values = feed.table.lock_values();
            for (position, &(part, index)) in self.buttons.iter().enumerate() {
                if part == owner {
                    logical.set_button(position, values.keys[index]);
                }
            }
            for (position, (source, mapper)) in self.valuators.iter().enumerate() {
                let raw = match *source {
                    ValuatorSource::Absolute { part, index } if part == owner => {
                        values.abs_axes[index] as f64
                    }
                    ValuatorSource::Relative { part, index } if part == owner => {
                        std::mem::take(&mut values.rel_accumulators[index]) as f64
                    }
                    _ => continue,
                };
                logical.set_valuator(position, mapper.map(raw));
            }
        }
        frames
    }

    /// Rumble goes to the first connected part that supports it
    fn haptic_tick(
        &mut self,
        duration_ms: u32,
        frequency: u32,
        amplitude: f32,
    ) -> Result<(), DeviceError> {
        let target = self
            .parts
            .iter_mut()
            .find(|part| !part.disabled && part.handle.capabilities().has_rumble());
        match target {
            Some(part) => part.haptic_tick(duration_ms, frequency, amplitude),
            None => Ok(()),
        }
    }
}

/// A named group of device entries, each feeding one logical device
pub struct DeviceAdapter {
    name: String,
    entries: Vec<Option<AdapterEntry>>,
    listener: Option<ChangeListener>,
}

impl DeviceAdapter {
    /// Open every configured device. Any failure closes what was already opened.
    pub fn open(
        config: &AdapterConfig,
        provider: &dyn DeviceProvider,
        reactor: &Reactor,
    ) -> Result<Self, AdapterError> {
        let mut entries = Vec::with_capacity(config.devices.len());
        for entry in &config.devices {
            entries.push(Some(AdapterEntry::open(entry, provider, reactor)?));
        }
        Ok(Self {
            name: config.name.clone(),
            entries,
            listener: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_entries(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    /// Report every decoded change of a bound device as it is drained.
    ///
    /// Changes to ignored features are not reported. State re-read after an overrun is not
    /// reported either; the logical device itself is always current after `update`.
    pub fn set_change_listener<F>(&mut self, listener: F)
    where
        F: FnMut(DeviceId, FeatureChange) + 'static,
    {
        self.listener = Some(Box::new(listener));
    }

    pub fn layouts(&self) -> Vec<EntryLayout> {
        self.entries
            .iter()
            .map(|entry| match entry {
                Some(entry) => entry.layout(),
                None => EntryLayout {
                    name: String::new(),
                    num_buttons: 0,
                    num_valuators: 0,
                    haptic: false,
                },
            })
            .collect()
    }

    pub fn bind_device(&mut self, entry: usize, device: DeviceId) {
        if let Some(Some(entry)) = self.entries.get_mut(entry) {
            entry.device = Some(device);
        }
    }

    pub fn entry_device(&self, entry: usize) -> Option<DeviceId> {
        self.entries.get(entry)?.as_ref()?.device
    }

    /// True once any of the entry's devices stopped delivering events
    pub fn is_disabled(&self, entry: usize) -> bool {
        self.entries
            .get(entry)
            .and_then(Option::as_ref)
            .is_some_and(AdapterEntry::is_disabled)
    }

    fn entry_for(&self, device: DeviceId) -> Option<&AdapterEntry> {
        self.entries
            .iter()
            .flatten()
            .find(|entry| entry.device == Some(device))
    }

    /// Frame boundaries received since the last propagation pass
    pub fn pending_frames(&mut self) -> usize {
        let mut frames = 0;
        for entry in self.entries.iter_mut().flatten() {
            entry.drain_signals(&mut self.listener);
            frames += entry.pending_frames();
        }
        frames
    }

    /// Copy current state into the bound logical devices; returns frames consumed
    pub fn update(&mut self, devices: &mut DeviceSlab) -> usize {
        let mut frames = 0;
        for entry in self.entries.iter_mut().flatten() {
            frames += entry.propagate(devices, &mut self.listener);
        }
        frames
    }

    pub fn feature_name(&self, feature: Feature) -> Option<String> {
        let entry = self.entry_for(feature.device)?;
        let names = match feature.kind {
            FeatureKind::Button => &entry.button_names,
            FeatureKind::Valuator => &entry.valuator_names,
        };
        names.get(feature.index).cloned()
    }

    pub fn haptic_tick(
        &mut self,
        entry: usize,
        duration_ms: u32,
        frequency: u32,
        amplitude: f32,
    ) -> Result<(), DeviceError> {
        match self.entries.get_mut(entry).and_then(Option::as_mut) {
            Some(entry) => entry.haptic_tick(duration_ms, frequency, amplitude),
            None => Ok(()),
        }
    }

    /// Close the physical devices feeding `device`
    pub fn release_device(&mut self, device: DeviceId) {
        let slot = self
            .entries
            .iter_mut()
            .find(|entry| entry.as_ref().is_some_and(|e| e.device == Some(device)));
        if let Some(slot) = slot {
            if let Some(entry) = slot.take() {
                log::debug!(
                    "{}: releasing {} ({} device(s))",
                    self.name,
                    entry.name,
                    entry.parts.len()
                );
            }
        }
    }
}
