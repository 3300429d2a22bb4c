//! Dense feature index space built from a device's capability bitmaps.
//!
//! OS codes are sparse (a joystick may report keys 0x120..0x12f and nothing else); every
//! supported code gets a contiguous index in ascending code order. The mapping is fixed for
//! the lifetime of the table. Current values live behind one mutex, the only state shared
//! between the reactor thread and the main loop.

use crate::device::codes::{SYN_DROPPED, SYN_REPORT};
use crate::device::{AxisConfig, BitSet, Capabilities, EventCategory, RawDevice, RawEvent};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Sparse OS code to dense index, and back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenseMap {
    to_dense: Box<[Option<u16>]>,
    to_code: Vec<u16>,
}

impl DenseMap {
    pub fn from_bits(bits: &BitSet) -> Self {
        let mut to_dense = vec![None; bits.capacity()].into_boxed_slice();
        let mut to_code = Vec::with_capacity(bits.count());
        for code in bits.iter_ones() {
            to_dense[code] = Some(to_code.len() as u16);
            to_code.push(code as u16);
        }
        Self { to_dense, to_code }
    }

    pub fn len(&self) -> usize {
        self.to_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_code.is_empty()
    }

    pub fn index_of(&self, code: u16) -> Option<usize> {
        self.to_dense
            .get(code as usize)
            .copied()
            .flatten()
            .map(usize::from)
    }

    pub fn is_mapped(&self, code: u16) -> bool {
        self.index_of(code).is_some()
    }

    pub fn code_of(&self, index: usize) -> Option<u16> {
        self.to_code.get(index).copied()
    }

    pub fn codes(&self) -> &[u16] {
        &self.to_code
    }
}

/// Current values indexed by dense index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureValues {
    pub keys: Vec<bool>,
    pub abs_axes: Vec<i32>,
    /// Deltas summed since the consumer last drained them
    pub rel_accumulators: Vec<i32>,
    /// Set after SYN_DROPPED until the next SYN_REPORT
    resyncing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureUpdate {
    Key { index: usize, pressed: bool },
    Absolute { index: usize, value: i32 },
    Relative { index: usize, delta: i32 },
}

/// What one batch of records did to the table
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub updates: Vec<FeatureUpdate>,
    /// Frame boundaries (SYN_REPORT) seen
    pub frames: usize,
    /// Records for codes the device never advertised, or of other categories
    pub ignored: usize,
    /// A SYN_REPORT ended an overrun; values must be re-read from the device
    pub needs_resync: bool,
}

pub struct FeatureTable {
    keys: DenseMap,
    abs_axes: DenseMap,
    rel_axes: DenseMap,
    abs_configs: Vec<AxisConfig>,
    has_sync: bool,
    values: Mutex<FeatureValues>,
}

impl FeatureTable {
    /// Scan capabilities and seed current values from the device's state snapshots
    pub fn build(device: &dyn RawDevice, capabilities: &Capabilities) -> Self {
        let keys = DenseMap::from_bits(&capabilities.keys);
        let abs_axes = DenseMap::from_bits(&capabilities.abs_axes);
        let rel_axes = DenseMap::from_bits(&capabilities.rel_axes);

        let key_values = pressed_keys(&keys, device);

        let reported = device.axis_configs();
        let abs_configs: Vec<AxisConfig> = abs_axes
            .codes()
            .iter()
            .map(|&code| {
                reported
                    .iter()
                    .find(|(c, _)| *c == code)
                    .map(|(_, config)| config.normalized())
                    .unwrap_or_else(|| {
                        log::warn!(
                            "{}: no axis info for ABS code {:#x}",
                            device.identity().name,
                            code
                        );
                        AxisConfig::default()
                    })
            })
            .collect();
        let abs_values = abs_configs.iter().map(|c| c.value).collect();

        let values = FeatureValues {
            keys: key_values,
            abs_axes: abs_values,
            rel_accumulators: vec![0; rel_axes.len()],
            resyncing: false,
        };

        Self {
            keys,
            abs_axes,
            rel_axes,
            abs_configs,
            has_sync: capabilities.has_sync(),
            values: Mutex::new(values),
        }
    }

    /// Re-read key and axis state from the device after events were lost.
    ///
    /// Relative accumulators restart from zero since the lost deltas cannot be recovered.
    pub fn resync(&self, device: &dyn RawDevice) {
        let keys = pressed_keys(&self.keys, device);
        let reported = device.axis_configs();
        let abs_axes: Vec<Option<i32>> = self
            .abs_axes
            .codes()
            .iter()
            .map(|&code| {
                reported
                    .iter()
                    .find(|(c, _)| *c == code)
                    .map(|(_, config)| config.value)
            })
            .collect();

        let mut values = self.lock_values();
        values.keys = keys;
        for (slot, value) in values.abs_axes.iter_mut().zip(abs_axes) {
            if let Some(value) = value {
                *slot = value;
            }
        }
        values.rel_accumulators.iter_mut().for_each(|delta| *delta = 0);
        log::debug!("{}: state re-read after dropped events", device.identity().name);
    }

    pub fn keys(&self) -> &DenseMap {
        &self.keys
    }

    pub fn abs_axes(&self) -> &DenseMap {
        &self.abs_axes
    }

    pub fn rel_axes(&self) -> &DenseMap {
        &self.rel_axes
    }

    pub fn abs_config(&self, index: usize) -> Option<&AxisConfig> {
        self.abs_configs.get(index)
    }

    pub fn has_sync(&self) -> bool {
        self.has_sync
    }

    /// Lock the value slots. Hold the guard only as long as the copy or update takes.
    pub fn lock_values(&self) -> MutexGuard<'_, FeatureValues> {
        // values are plain data; a panic elsewhere cannot leave them half-written
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> FeatureValues {
        self.lock_values().clone()
    }

    /// Apply decoded records in delivery order under a single lock acquisition
    pub fn apply(&self, events: &[RawEvent]) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let mut values = self.lock_values();

        for event in events {
            match event.category {
                EventCategory::Sync => match event.code {
                    SYN_REPORT => {
                        if values.resyncing {
                            values.resyncing = false;
                            outcome.needs_resync = true;
                        }
                        outcome.frames += 1;
                    }
                    SYN_DROPPED => values.resyncing = true,
                    _ => outcome.ignored += 1,
                },
                _ if values.resyncing => outcome.ignored += 1,
                EventCategory::Key => match self.keys.index_of(event.code) {
                    Some(index) => {
                        let pressed = event.value != 0;
                        values.keys[index] = pressed;
                        outcome.updates.push(FeatureUpdate::Key { index, pressed });
                    }
                    None => outcome.ignored += 1,
                },
                EventCategory::Absolute => match self.abs_axes.index_of(event.code) {
                    Some(index) => {
                        values.abs_axes[index] = event.value;
                        outcome.updates.push(FeatureUpdate::Absolute {
                            index,
                            value: event.value,
                        });
                    }
                    None => outcome.ignored += 1,
                },
                EventCategory::Relative => match self.rel_axes.index_of(event.code) {
                    Some(index) => {
                        let slot = &mut values.rel_accumulators[index];
                        *slot = slot.saturating_add(event.value);
                        outcome.updates.push(FeatureUpdate::Relative {
                            index,
                            delta: event.value,
                        });
                    }
                    None => outcome.ignored += 1,
                },
                EventCategory::Other(_) => outcome.ignored += 1,
            }
        }

        outcome
    }
}

fn pressed_keys(keys: &DenseMap, device: &dyn RawDevice) -> Vec<bool> {
    let pressed = device.key_state();
    keys.codes()
        .iter()
        .map(|&code| pressed.contains(code as usize))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::codes::{
        ABS_X, ABS_Y, BTN_THUMB, BTN_TRIGGER, EV_SYN, KEY_CNT, REL_WHEEL, REL_X,
    };
    use crate::device::testing::SyntheticDevice;

    fn table(device: &SyntheticDevice) -> FeatureTable {
        FeatureTable::build(device, &device.capabilities())
    }

    #[test]
    fn test_dense_map_is_monotonic_and_gapless() {
        let codes = [0x2ff, 0x100, 0x120, 0x121, 0x13f, 0x1];
        let bits = BitSet::from_codes(0x300, codes.iter().map(|&c| c as usize));
        let map = DenseMap::from_bits(&bits);

        assert_eq!(map.len(), codes.len());
        let mut previous = None;
        for index in 0..map.len() {
            let code = map.code_of(index).unwrap();
            assert_eq!(map.index_of(code), Some(index));
            if let Some(prev) = previous {
                assert!(code > prev);
            }
            previous = Some(code);
        }
        assert_eq!(map.index_of(0x122), None);
        assert_eq!(map.code_of(codes.len()), None);
        assert!(!map.is_mapped(0x2fe));
    }

    #[test]
    fn test_dense_map_empty_category() {
        let map = DenseMap::from_bits(&BitSet::new(0x10));
        assert!(map.is_empty());
        assert_eq!(map.index_of(0), None);
    }

    #[test]
    fn test_initial_values_seeded_from_snapshots() {
        let device = SyntheticDevice::named("Stick")
            .with_keys(&[BTN_TRIGGER, BTN_THUMB])
            .with_pressed(&[BTN_THUMB])
            .with_abs(
                ABS_Y,
                AxisConfig {
                    value: 40,
                    ..AxisConfig::new(0, 255, 10)
                },
            );
        let table = table(&device);
        let values = table.snapshot();
        assert_eq!(values.keys, vec![false, true]);
        assert_eq!(values.abs_axes, vec![40]);
        assert_eq!(table.abs_config(0).unwrap().flat, 10);
    }

    #[test]
    fn test_inverted_axis_range_is_swapped() {
        let device = SyntheticDevice::named("Odd").with_abs(ABS_X, AxisConfig::new(100, -100, 0));
        let table = table(&device);
        let config = table.abs_config(0).unwrap();
        assert!(config.min <= config.max);
    }

    #[test]
    fn test_apply_updates_and_accumulates() {
        let device = SyntheticDevice::named("Mouse")
            .with_keys(&[BTN_TRIGGER])
            .with_abs(ABS_X, AxisConfig::new(0, 255, 0))
            .with_rel(&[REL_X, REL_WHEEL]);
        let table = table(&device);

        let outcome = table.apply(&[
            RawEvent::new(EventCategory::Key, BTN_TRIGGER, 1),
            RawEvent::new(EventCategory::Absolute, ABS_X, 200),
            RawEvent::new(EventCategory::Relative, REL_X, 3),
            RawEvent::new(EventCategory::Relative, REL_X, -1),
            RawEvent::new(EventCategory::Relative, REL_WHEEL, 1),
            RawEvent::new(EventCategory::Key, 0x2ff, 1),
            RawEvent::new(EventCategory::Sync, EV_SYN, 0),
        ]);

        assert_eq!(outcome.frames, 1);
        assert_eq!(outcome.ignored, 1);
        assert_eq!(outcome.updates.len(), 5);

        let values = table.snapshot();
        assert_eq!(values.keys, vec![true]);
        assert_eq!(values.abs_axes, vec![200]);
        assert_eq!(values.rel_accumulators, vec![2, 1]);
    }

    #[test]
    fn test_syn_dropped_discards_until_report() {
        let device = SyntheticDevice::named("Pad").with_abs(ABS_X, AxisConfig::new(0, 255, 0));
        let table = table(&device);

        table.apply(&[
            RawEvent::new(EventCategory::Sync, SYN_DROPPED, 0),
            RawEvent::new(EventCategory::Absolute, ABS_X, 10),
            RawEvent::new(EventCategory::Sync, SYN_REPORT, 0),
            RawEvent::new(EventCategory::Absolute, ABS_X, 20),
        ]);
        assert_eq!(table.snapshot().abs_axes, vec![20]);
    }

    #[test]
    fn test_overrun_rereads_key_state() {
        let device = SyntheticDevice::named("Stick")
            .with_keys(&[BTN_TRIGGER, BTN_THUMB])
            .with_pressed(&[BTN_TRIGGER])
            .with_rel(&[REL_X]);
        let table = table(&device);
        table.apply(&[RawEvent::new(EventCategory::Relative, REL_X, 4)]);

        // the release happened while the kernel buffer was full
        *device.key_states().lock().unwrap() = BitSet::new(KEY_CNT);
        let outcome = table.apply(&[
            RawEvent::new(EventCategory::Sync, SYN_DROPPED, 0),
            RawEvent::new(EventCategory::Key, BTN_THUMB, 1),
            RawEvent::new(EventCategory::Sync, SYN_REPORT, 0),
        ]);
        assert!(outcome.needs_resync);
        assert_eq!(table.snapshot().keys, vec![true, false]);

        table.resync(&device);
        let values = table.snapshot();
        assert_eq!(values.keys, vec![false, false]);
        assert_eq!(values.rel_accumulators, vec![0]);

        let outcome = table.apply(&[RawEvent::new(EventCategory::Sync, SYN_REPORT, 0)]);
        assert!(!outcome.needs_resync);
    }
}
