use crate::device::AxisConfig;
use crate::error::ConfigError;

/// Three-segment piecewise-linear axis normalization with a dead zone.
///
/// Raw values below `dead_min` ramp from -1 (at `min`) to 0; values in
/// `[dead_min, dead_max]` map to exactly 0; values above `dead_max` ramp to +1 (at `max`).
/// Nothing is extrapolated past `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisValueMapper {
    min: f64,
    dead_min: f64,
    dead_max: f64,
    max: f64,
}

impl AxisValueMapper {
    pub fn new(min: f64, dead_min: f64, dead_max: f64, max: f64) -> Result<Self, ConfigError> {
        let ordered = min <= dead_min && dead_min <= dead_max && dead_max <= max;
        if !ordered || [min, dead_min, dead_max, max].iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::Mapping {
                key: "axis".to_string(),
                reason: format!(
                    "expected min <= deadMin <= deadMax <= max, got ({}, {}, {}, {})",
                    min, dead_min, dead_max, max
                ),
            });
        }
        Ok(Self {
            min,
            dead_min,
            dead_max,
            max,
        })
    }

    /// Dead zone of `flat` on either side of the axis midpoint
    pub fn from_axis(config: &AxisConfig) -> Self {
        let min = config.min as f64;
        let max = config.max as f64;
        let mid = (min + max) * 0.5;
        let flat = config.flat.max(0) as f64;
        Self {
            min,
            dead_min: (mid - flat).max(min),
            dead_max: (mid + flat).min(max),
            max,
        }
    }

    /// Overrides are given in normalized units, -1 and +1 being the ends of the physical range
    pub fn from_normalized(config: &AxisConfig, values: [f64; 4]) -> Result<Self, ConfigError> {
        let mid = (config.min as f64 + config.max as f64) * 0.5;
        let half = (config.max as f64 - config.min as f64) * 0.5;
        let [min, dead_min, dead_max, max] = values.map(|v| mid + v * half);
        Self::new(min, dead_min, dead_max, max)
    }

    /// Relative axes have no physical range; deltas are used as-is
    pub fn relative_default() -> Self {
        Self {
            min: -1.0,
            dead_min: 0.0,
            dead_max: 0.0,
            max: 1.0,
        }
    }

    pub fn map(&self, raw: f64) -> f64 {
        if raw < self.dead_min {
            if self.dead_min > self.min {
                (raw.max(self.min) - self.dead_min) / (self.dead_min - self.min)
            } else {
                -1.0
            }
        } else if raw > self.dead_max {
            if self.max > self.dead_max {
                (raw.min(self.max) - self.dead_max) / (self.max - self.dead_max)
            } else {
                1.0
            }
        } else {
            0.0
        }
    }

    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        (self.min, self.dead_min, self.dead_max, self.max)
    }
}
