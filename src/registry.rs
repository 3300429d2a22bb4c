//! Owner of every logical device, whichever adapter feeds it.
//!
//! Devices live in a generational slab; a `DeviceId` from a destroyed device never resolves
//! to a later device that reuses its slot. All access happens on the main thread.

use crate::adapter::{AdapterId, DeviceAdapter};
use crate::error::RegistryError;
use crate::haptic::HapticRouter;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackType {
    #[default]
    None,
    Position,
    PositionDirection,
    SixDof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Button,
    Valuator,
}

/// One button or valuator of a logical device; buttons come first in feature index order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feature {
    pub device: DeviceId,
    pub kind: FeatureKind,
    pub index: usize,
}

impl Feature {
    pub fn button(device: DeviceId, index: usize) -> Self {
        Self {
            device,
            kind: FeatureKind::Button,
            index,
        }
    }

    pub fn valuator(device: DeviceId, index: usize) -> Self {
        Self {
            device,
            kind: FeatureKind::Valuator,
            index,
        }
    }
}

/// Canonical application-facing device: ordered buttons and valuators
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalDevice {
    name: String,
    track_type: TrackType,
    physical: bool,
    buttons: Vec<bool>,
    valuators: Vec<f64>,
}

impl LogicalDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn track_type(&self) -> TrackType {
        self.track_type
    }

    /// Fed by an adapter rather than by the application
    pub fn is_physical(&self) -> bool {
        self.physical
    }

    pub fn num_buttons(&self) -> usize {
        self.buttons.len()
    }

    pub fn num_valuators(&self) -> usize {
        self.valuators.len()
    }

    pub fn num_features(&self) -> usize {
        self.buttons.len() + self.valuators.len()
    }

    pub fn button(&self, index: usize) -> Option<bool> {
        self.buttons.get(index).copied()
    }

    pub fn valuator(&self, index: usize) -> Option<f64> {
        self.valuators.get(index).copied()
    }

    pub fn buttons(&self) -> &[bool] {
        &self.buttons
    }

    pub fn valuators(&self) -> &[f64] {
        &self.valuators
    }

    pub fn set_button(&mut self, index: usize, pressed: bool) {
        if let Some(slot) = self.buttons.get_mut(index) {
            *slot = pressed;
        }
    }

    pub fn set_valuator(&mut self, index: usize, value: f64) {
        if let Some(slot) = self.valuators.get_mut(index) {
            *slot = value;
        }
    }

    /// Map a flat feature index to (kind, index within kind)
    pub fn feature(&self, feature_index: usize) -> Option<(FeatureKind, usize)> {
        if feature_index < self.buttons.len() {
            Some((FeatureKind::Button, feature_index))
        } else if feature_index < self.num_features() {
            Some((FeatureKind::Valuator, feature_index - self.buttons.len()))
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    device: Option<LogicalDevice>,
}

/// Generational arena of logical devices
#[derive(Debug, Default)]
pub struct DeviceSlab {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl DeviceSlab {
    fn insert(&mut self, device: LogicalDevice) -> DeviceId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.device = Some(device);
                DeviceId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    device: Some(device),
                });
                DeviceId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    fn remove(&mut self, id: DeviceId) -> Option<LogicalDevice> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let device = slot.device.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(device)
    }

    pub fn get(&self, id: DeviceId) -> Option<&LogicalDevice> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.device.as_ref())
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut LogicalDevice> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.device.as_mut())
    }
}

type DestructionCallback = Box<dyn FnMut(&DeviceRegistry, DeviceId)>;

/// Split "Name:3" into ("Name", Some(3)); anything else is all prefix
fn split_alias(name: &str) -> (&str, Option<u32>) {
    match name.rsplit_once(':') {
        Some((prefix, suffix)) => match suffix.parse::<u32>() {
            Ok(n) => (prefix, Some(n)),
            Err(_) => (name, None),
        },
        None => (name, None),
    }
}

pub struct DeviceRegistry {
    devices: DeviceSlab,
    /// Live devices in creation order
    active: Vec<DeviceId>,
    /// Highest alias suffix ever issued per name prefix; 0 means only the bare name
    alias_suffixes: HashMap<String, u32>,
    adapters: Vec<Option<DeviceAdapter>>,
    owners: HashMap<DeviceId, AdapterId>,
    haptics: HapticRouter,
    destruction_callbacks: Vec<DestructionCallback>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: DeviceSlab::default(),
            active: Vec::new(),
            alias_suffixes: HashMap::new(),
            adapters: Vec::new(),
            owners: HashMap::new(),
            haptics: HapticRouter::new(),
            destruction_callbacks: Vec::new(),
        }
    }

    /// Create a device.
    ///
    /// The first device with a given prefix keeps the requested name, so "Pad:3" stays "Pad:3".
    /// Later requests for that prefix get the next ":N" suffix above any issued before.
    pub fn create_input_device(
        &mut self,
        name: &str,
        track_type: TrackType,
        num_buttons: usize,
        num_valuators: usize,
        physical: bool,
    ) -> DeviceId {
        let (prefix, suffix) = split_alias(name);
        let unique_name = match self.alias_suffixes.get_mut(prefix) {
            Some(max_suffix) => {
                *max_suffix += 1;
                format!("{}:{}", prefix, max_suffix)
            }
            None => {
                self.alias_suffixes
                    .insert(prefix.to_string(), suffix.unwrap_or(0));
                name.to_string()
            }
        };

        let id = self.devices.insert(LogicalDevice {
            name: unique_name,
            track_type,
            physical,
            buttons: vec![false; num_buttons],
            valuators: vec![0.0; num_valuators],
        });
        self.active.push(id);
        log::debug!(
            "Created input device '{}' ({} buttons, {} valuators)",
            self.devices.get(id).map_or("", |d| d.name()),
            num_buttons,
            num_valuators
        );
        id
    }

    /// Observers run in registration order, before the device becomes unreachable
    pub fn add_destruction_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&DeviceRegistry, DeviceId) + 'static,
    {
        self.destruction_callbacks.push(Box::new(callback));
    }

    /// Destroy a device: notify observers, detach it, then free its storage
    pub fn destroy_input_device(&mut self, id: DeviceId) -> Result<(), RegistryError> {
        if self.devices.get(id).is_none() {
            return Err(RegistryError::UnknownDevice(id));
        }

        let mut callbacks = std::mem::take(&mut self.destruction_callbacks);
        for callback in callbacks.iter_mut() {
            callback(self, id);
        }
        self.destruction_callbacks = callbacks;

        self.active.retain(|active| *active != id);
        self.haptics.remove(id);
        if let Some(adapter_id) = self.owners.remove(&id) {
            if let Some(adapter) = self.adapter_mut(adapter_id) {
                adapter.release_device(id);
            }
        }

        if let Some(device) = self.devices.remove(id) {
            log::debug!("Destroyed input device '{}'", device.name());
        }
        Ok(())
    }

    /// Take ownership of an opened adapter and create one logical device per entry
    pub fn attach_adapter(&mut self, mut adapter: DeviceAdapter) -> AdapterId {
        let adapter_id = self.adapters.len();

        for (entry_index, layout) in adapter.layouts().into_iter().enumerate() {
            let id = self.create_input_device(
                &layout.name,
                TrackType::None,
                layout.num_buttons,
                layout.num_valuators,
                true,
            );
            adapter.bind_device(entry_index, id);
            self.owners.insert(id, adapter_id);
            if layout.haptic {
                if let Err(e) = self.add_haptic_feature(id, adapter_id, entry_index) {
                    log::warn!("{}: {}", layout.name, e);
                }
            }
        }

        adapter.update(&mut self.devices);
        log::info!(
            "Attached adapter '{}' with {} device(s)",
            adapter.name(),
            adapter.num_entries()
        );
        self.adapters.push(Some(adapter));
        adapter_id
    }

    pub fn adapter(&self, id: AdapterId) -> Option<&DeviceAdapter> {
        self.adapters.get(id).and_then(Option::as_ref)
    }

    pub fn adapter_mut(&mut self, id: AdapterId) -> Option<&mut DeviceAdapter> {
        self.adapters.get_mut(id).and_then(Option::as_mut)
    }

    /// Destroy every device an adapter feeds, then drop the adapter
    pub fn remove_adapter(&mut self, adapter_id: AdapterId) {
        let owned: Vec<DeviceId> = self
            .active
            .iter()
            .rev()
            .copied()
            .filter(|id| self.owners.get(id) == Some(&adapter_id))
            .collect();
        for id in owned {
            if let Err(e) = self.destroy_input_device(id) {
                log::debug!("Removing adapter {}: {}", adapter_id, e);
            }
        }
        if let Some(slot) = self.adapters.get_mut(adapter_id) {
            *slot = None;
        }
    }

    pub fn add_haptic_feature(
        &mut self,
        device: DeviceId,
        adapter: AdapterId,
        feature_index: usize,
    ) -> Result<(), RegistryError> {
        if self.devices.get(device).is_none() {
            return Err(RegistryError::UnknownDevice(device));
        }
        self.haptics.add(device, adapter, feature_index)
    }

    /// Fire-and-forget; devices without a haptic binding ignore the request
    pub fn haptic_tick(&mut self, device: DeviceId, duration_ms: u32, frequency: u32, amplitude: f32) {
        let Some(binding) = self.haptics.binding(device).copied() else {
            return;
        };
        if let Some(adapter) = self.adapter_mut(binding.adapter) {
            if let Err(e) =
                adapter.haptic_tick(binding.feature_index, duration_ms, frequency, amplitude)
            {
                log::warn!("Haptic tick on {:?} failed: {}", device, e);
            }
        }
    }

    /// Propagate decoded state into every logical device; call once per frame.
    ///
    /// Returns the number of frame boundaries that arrived since the previous call.
    pub fn update_input_devices(&mut self) -> usize {
        let mut frames = 0;
        for adapter in self.adapters.iter_mut().flatten() {
            frames += adapter.update(&mut self.devices);
        }
        frames
    }

    /// Frame boundaries received by all adapters since the last propagation pass
    pub fn pending_frames(&mut self) -> usize {
        self.adapters
            .iter_mut()
            .flatten()
            .map(DeviceAdapter::pending_frames)
            .sum()
    }

    pub fn device(&self, id: DeviceId) -> Option<&LogicalDevice> {
        self.devices.get(id)
    }

    /// For devices created by the application; adapter-fed devices are overwritten each frame
    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut LogicalDevice> {
        self.devices.get_mut(id)
    }

    pub fn num_input_devices(&self) -> usize {
        self.active.len()
    }

    /// Live device by creation order
    pub fn input_device(&self, index: usize) -> Option<DeviceId> {
        self.active.get(index).copied()
    }

    pub fn input_devices(&self) -> impl Iterator<Item = (DeviceId, &LogicalDevice)> + '_ {
        self.active
            .iter()
            .filter_map(|id| self.devices.get(*id).map(|device| (*id, device)))
    }

    pub fn find_input_device(&self, name: &str) -> Option<DeviceId> {
        self.input_devices()
            .find(|(_, device)| device.name() == name)
            .map(|(id, _)| id)
    }

    pub fn feature_name(&self, feature: Feature) -> Option<String> {
        let device = self.devices.get(feature.device)?;
        let count = match feature.kind {
            FeatureKind::Button => device.num_buttons(),
            FeatureKind::Valuator => device.num_valuators(),
        };
        if feature.index >= count {
            return None;
        }

        let owner = self
            .owners
            .get(&feature.device)
            .and_then(|adapter| self.adapter(*adapter));
        match owner {
            Some(adapter) => adapter.feature_name(feature),
            None => Some(match feature.kind {
                FeatureKind::Button => format!("Button{}", feature.index),
                FeatureKind::Valuator => format!("Valuator{}", feature.index),
            }),
        }
    }

    /// Flat feature index (buttons, then valuators) of the feature with this name
    pub fn feature_index(&self, device: DeviceId, name: &str) -> Option<usize> {
        let logical = self.devices.get(device)?;
        (0..logical.num_features()).find(|&feature_index| {
            logical
                .feature(feature_index)
                .map(|(kind, index)| Feature {
                    device,
                    kind,
                    index,
                })
                .and_then(|feature| self.feature_name(feature))
                .is_some_and(|feature_name| feature_name == name)
        })
    }

    pub fn has_haptic_feature(&self, device: DeviceId) -> bool {
        self.haptics.binding(device).is_some()
    }

    /// Destroy all devices newest first, then drop the adapters
    pub fn shutdown(&mut self) {
        while let Some(&id) = self.active.last() {
            if self.destroy_input_device(id).is_err() {
                self.active.pop();
            }
        }
        self.adapters.clear();
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
