//! Routing of haptic requests from logical devices to the adapter feature that drives them

use crate::adapter::AdapterId;
use crate::device::RumbleEffect;
use crate::error::RegistryError;
use crate::registry::DeviceId;
use std::collections::HashMap;

/// Below this the strong (low-frequency) motor is used, above it the weak one
const MOTOR_SPLIT_HZ: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HapticBinding {
    pub device: DeviceId,
    pub adapter: AdapterId,
    /// Adapter-local index of the haptic feature
    pub feature_index: usize,
}

#[derive(Debug, Default)]
pub struct HapticRouter {
    bindings: HashMap<DeviceId, HapticBinding>,
}

impl HapticRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        device: DeviceId,
        adapter: AdapterId,
        feature_index: usize,
    ) -> Result<(), RegistryError> {
        if self.bindings.contains_key(&device) {
            return Err(RegistryError::AlreadyRegistered(device));
        }
        self.bindings.insert(
            device,
            HapticBinding {
                device,
                adapter,
                feature_index,
            },
        );
        Ok(())
    }

    pub fn binding(&self, device: DeviceId) -> Option<&HapticBinding> {
        self.bindings.get(&device)
    }

    pub fn remove(&mut self, device: DeviceId) -> Option<HapticBinding> {
        self.bindings.remove(&device)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Translate a tick request into a rumble effect.
///
/// Amplitude 0..1 sets the magnitude of one motor, picked by frequency.
pub fn rumble_for(duration_ms: u32, frequency: u32, amplitude: f32) -> RumbleEffect {
    let magnitude = (amplitude.clamp(0.0, 1.0) * u16::MAX as f32) as u16;
    let (strong_magnitude, weak_magnitude) = if frequency < MOTOR_SPLIT_HZ {
        (magnitude, 0)
    } else {
        (0, magnitude)
    };
    RumbleEffect {
        duration_ms: duration_ms.min(u16::MAX as u32) as u16,
        strong_magnitude,
        weak_magnitude,
    }
}
