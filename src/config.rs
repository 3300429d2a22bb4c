use crate::device::DeviceSelector;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "inputhub_config.json";
const VALUATOR_MAPPING_PREFIX: &str = "valuatorMapping";

/// Selection and open-time settings for one physical device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalDeviceConfig {
    /// "vvvv:pppp" in hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_vendor_product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_version: Option<u16>,
    /// Substring of the device name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_serial_number: Option<String>,
    /// Which of several matching devices to take
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_index: Option<usize>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_key_features: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_abs_axis_features: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_rel_axis_features: Vec<i64>,

    #[serde(default)]
    pub grab_device: bool,
    /// 0.0..1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_feedback_gain: Option<f32>,
    /// 0.0..1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autocenter: Option<f32>,
}

impl PhysicalDeviceConfig {
    pub fn named(device_name: &str) -> Self {
        Self {
            device_name: Some(device_name.to_string()),
            ..Default::default()
        }
    }

    pub fn selector(&self) -> Result<DeviceSelector, ConfigError> {
        let (vendor_id, product_id) = match self.device_vendor_product_id.as_deref() {
            Some(spec) => {
                let (vendor, product) = DeviceSelector::parse_vendor_product(spec)?;
                (Some(vendor), Some(product))
            }
            None => (None, None),
        };

        Ok(DeviceSelector {
            vendor_id,
            product_id,
            version: self.device_version,
            name: self.device_name.clone(),
            serial_number: self.device_serial_number.clone(),
            index: self.device_index.unwrap_or(0),
        })
    }
}

/// One logical device, fed by its primary physical device and any additional ones.
///
/// Features of the additional devices are appended after the primary's, in the order listed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntryConfig {
    pub name: String,
    #[serde(flatten)]
    pub device: PhysicalDeviceConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_devices: Vec<PhysicalDeviceConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub button_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valuator_names: Vec<String>,

    /// `valuatorMapping<N>` keys, plus anything unrecognized
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DeviceEntryConfig {
    pub fn new(name: &str, device: PhysicalDeviceConfig) -> Self {
        Self {
            name: name.to_string(),
            device,
            ..Default::default()
        }
    }

    /// Primary device first, then the additional ones
    pub fn physical_devices(&self) -> impl Iterator<Item = &PhysicalDeviceConfig> {
        std::iter::once(&self.device).chain(&self.additional_devices)
    }

    /// Per-valuator overrides (min, deadMin, deadMax, max) in normalized units
    pub fn valuator_mappings(&self) -> Result<BTreeMap<usize, [f64; 4]>, ConfigError> {
        let mut mappings = BTreeMap::new();
        for (key, value) in &self.extra {
            let Some(index) = key.strip_prefix(VALUATOR_MAPPING_PREFIX) else {
                log::warn!("{}: ignoring unknown setting '{}'", self.name, key);
                continue;
            };
            let index: usize = index.parse().map_err(|_| ConfigError::Mapping {
                key: key.clone(),
                reason: "expected valuatorMapping<N>".to_string(),
            })?;
            let values: Vec<f64> =
                serde_json::from_value(value.clone()).map_err(|e| ConfigError::Mapping {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            let values: [f64; 4] = values.try_into().map_err(|v: Vec<f64>| ConfigError::Mapping {
                key: key.clone(),
                reason: format!("expected 4 values, got {}", v.len()),
            })?;
            mappings.insert(index, values);
        }
        Ok(mappings)
    }

    pub fn with_valuator_mapping(mut self, index: usize, values: [f64; 4]) -> Self {
        self.extra.insert(
            format!("{}{}", VALUATOR_MAPPING_PREFIX, index),
            serde_json::json!(values),
        );
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    pub name: String,
    #[serde(default)]
    pub devices: Vec<DeviceEntryConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputConfig {
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
}

impl InputConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        log::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_FILENAME)
    }
}
