//! Raw input device management.
//!
//! Physical devices are opened through a [`device::DeviceProvider`], decoded on one shared
//! reactor thread into per-device [`feature::FeatureTable`]s, and translated by
//! [`adapter::DeviceAdapter`]s into canonical button/valuator devices owned by the
//! [`registry::DeviceRegistry`].

pub mod adapter;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod feature;
pub mod haptic;
pub mod registry;

pub use adapter::{AdapterId, AxisValueMapper, DeviceAdapter, FeatureChange};
pub use config::{AdapterConfig, DeviceEntryConfig, InputConfig, PhysicalDeviceConfig};
pub use dispatch::Reactor;
pub use error::{AdapterError, ConfigError, DeviceError, RegistryError};
pub use registry::{DeviceId, DeviceRegistry, Feature, FeatureKind, LogicalDevice, TrackType};
