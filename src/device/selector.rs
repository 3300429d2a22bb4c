use super::{DeviceIdentity, RawDevice};
use crate::error::{ConfigError, DeviceError};
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Conjunctive match over device identity plus an occurrence index.
///
/// An empty selector matches the first device that opens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSelector {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub version: Option<u16>,
    pub name: Option<String>,
    pub serial_number: Option<String>,
    /// Zero-based occurrence among matching devices
    pub index: usize,
}

impl DeviceSelector {
    /// Parse a "vvvv:pppp" hexadecimal vendor/product pair
    pub fn parse_vendor_product(spec: &str) -> Result<(u16, u16), ConfigError> {
        let (vendor, product) = spec
            .split_once(':')
            .ok_or_else(|| ConfigError::Selector(format!("'{}' is not vendorId:productId", spec)))?;
        let parse = |part: &str| {
            u16::from_str_radix(part.trim(), 16)
                .map_err(|e| ConfigError::Selector(format!("'{}' in '{}': {}", part, spec, e)))
        };
        Ok((parse(vendor)?, parse(product)?))
    }

    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        self.vendor_id.map_or(true, |v| v == identity.vendor)
            && self.product_id.map_or(true, |p| p == identity.product)
            && self.version.map_or(true, |v| v == identity.version)
            && self
                .name
                .as_deref()
                .map_or(true, |n| identity.name.contains(n))
            && self
                .serial_number
                .as_deref()
                .map_or(true, |s| identity.serial.as_deref() == Some(s))
    }

    /// Walk candidates in order and return the `index`-th match.
    ///
    /// Each candidate is opened lazily by the iterator; rejected ones are dropped (closed)
    /// before the next is opened. Candidates that fail to open are skipped; if nothing
    /// matched and at least one was refused for permissions, that is what gets reported.
    pub fn select<D, I>(&self, candidates: I) -> Result<D, DeviceError>
    where
        D: RawDevice,
        I: IntoIterator<Item = (PathBuf, io::Result<D>)>,
    {
        let mut remaining = self.index;
        let mut denied: Option<PathBuf> = None;

        for (path, opened) in candidates {
            let device = match opened {
                Ok(device) => device,
                Err(e) => {
                    if e.kind() == io::ErrorKind::PermissionDenied {
                        log::debug!("Permission denied opening {}", path.display());
                        denied.get_or_insert(path);
                    } else {
                        log::debug!("Skipping {}: {}", path.display(), e);
                    }
                    continue;
                }
            };

            if !self.matches(device.identity()) {
                drop(device);
                continue;
            }

            if remaining == 0 {
                log::info!(
                    "Selected {} ({}) for {}",
                    device.identity().name,
                    path.display(),
                    self
                );
                return Ok(device);
            }
            remaining -= 1;
            drop(device);
        }

        match denied {
            Some(path) => Err(DeviceError::PermissionDenied { path }),
            None => Err(DeviceError::NotFound(self.to_string())),
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        match (self.vendor_id, self.product_id) {
            (Some(v), Some(p)) => parts.push(format!("{:04x}:{:04x}", v, p)),
            (Some(v), None) => parts.push(format!("vendor {:04x}", v)),
            (None, Some(p)) => parts.push(format!("product {:04x}", p)),
            (None, None) => {}
        }
        if let Some(version) = self.version {
            parts.push(format!("version {}", version));
        }
        if let Some(ref name) = self.name {
            parts.push(format!("name ~ '{}'", name));
        }
        if let Some(ref serial) = self.serial_number {
            parts.push(format!("serial '{}'", serial));
        }
        if parts.is_empty() {
            parts.push("any device".to_string());
        }
        write!(f, "[{}] #{}", parts.join(", "), self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::SyntheticDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn identity(vendor: u16, product: u16, name: &str, serial: Option<&str>) -> DeviceIdentity {
        DeviceIdentity {
            vendor,
            product,
            version: 0x0111,
            name: name.to_string(),
            serial: serial.map(str::to_string),
            path: PathBuf::new(),
        }
    }

    fn candidates(
        ids: Vec<DeviceIdentity>,
    ) -> impl Iterator<Item = (PathBuf, io::Result<SyntheticDevice>)> {
        ids.into_iter().enumerate().map(|(i, id)| {
            (
                PathBuf::from(format!("/dev/input/event{}", i)),
                Ok(SyntheticDevice::new(id)),
            )
        })
    }

    #[test]
    fn test_parse_vendor_product() {
        assert_eq!(
            DeviceSelector::parse_vendor_product("046d:c215").unwrap(),
            (0x046d, 0xc215)
        );
        assert!(DeviceSelector::parse_vendor_product("046d").is_err());
        assert!(DeviceSelector::parse_vendor_product("zz:0001").is_err());
    }

    #[test]
    fn test_empty_selector_matches_first() {
        let selector = DeviceSelector::default();
        let device = selector
            .select(candidates(vec![
                identity(1, 1, "Pad A", None),
                identity(2, 2, "Pad B", None),
            ]))
            .unwrap();
        assert_eq!(device.identity().name, "Pad A");
    }

    #[test]
    fn test_occurrence_index_disambiguates_identical_devices() {
        let selector = DeviceSelector {
            vendor_id: Some(0x046d),
            product_id: Some(0xc215),
            index: 1,
            ..Default::default()
        };
        let device = selector
            .select(candidates(vec![
                identity(0x046d, 0xc215, "Extreme 3D", Some("first")),
                identity(0x1234, 0x0001, "Keyboard", None),
                identity(0x046d, 0xc215, "Extreme 3D", Some("second")),
            ]))
            .unwrap();
        assert_eq!(device.identity().serial.as_deref(), Some("second"));
    }

    #[test]
    fn test_name_substring_and_serial() {
        let selector = DeviceSelector {
            name: Some("Stick".to_string()),
            serial_number: Some("B".to_string()),
            ..Default::default()
        };
        let device = selector
            .select(candidates(vec![
                identity(1, 1, "Flight Stick", Some("A")),
                identity(1, 1, "Flight Stick", Some("B")),
            ]))
            .unwrap();
        assert_eq!(device.identity().serial.as_deref(), Some("B"));
    }

    #[test]
    fn test_rejected_candidates_closed_before_next_open() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let selector = DeviceSelector {
            name: Some("Wanted".to_string()),
            ..Default::default()
        };

        let names = ["Other", "Other", "Wanted"];
        let iter = names.iter().enumerate().map(|(i, name)| {
            let device = SyntheticDevice::new(identity(1, 1, name, None))
                .with_live_counter(Arc::clone(&live));
            peak.fetch_max(live.load(Ordering::SeqCst), Ordering::SeqCst);
            (PathBuf::from(format!("/dev/input/event{}", i)), Ok(device))
        });

        let device = selector.select(iter).unwrap();
        assert_eq!(device.identity().name, "Wanted");
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_not_found_vs_permission_denied() {
        let selector = DeviceSelector {
            vendor_id: Some(0xdead),
            ..Default::default()
        };
        let err = selector
            .select(candidates(vec![identity(1, 1, "Pad", None)]))
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(_)));

        let refused: Vec<(PathBuf, io::Result<SyntheticDevice>)> = vec![(
            PathBuf::from("/dev/input/event0"),
            Err(io::Error::from(io::ErrorKind::PermissionDenied)),
        )];
        let err = selector.select(refused).unwrap_err();
        assert!(matches!(err, DeviceError::PermissionDenied { .. }));
    }
}
