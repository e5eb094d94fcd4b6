//! Devices and the pools they are grouped into.
//!
//! A [`Device`] is an execution target: a unique serial plus the capability
//! attributes that pooling strategies and backends use to decide where a
//! test may run. A [`DevicePool`] is an immutable, named set of devices that
//! share one work queue for the lifetime of a run.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Unique identity of a device (usually its serial number).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Name of a device pool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Coarse display geometry of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayClass {
    #[default]
    Phone,
    Tablet,
    Tv,
    Watch,
    Other,
}

impl DisplayClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayClass::Phone => "phone",
            DisplayClass::Tablet => "tablet",
            DisplayClass::Tv => "tv",
            DisplayClass::Watch => "watch",
            DisplayClass::Other => "other",
        }
    }
}

/// An execution target and its capabilities.
///
/// Devices are usually produced by a [`DeviceProvider`](crate::provider::DeviceProvider)
/// and deserialized from its output, so every capability has a default.
///
/// # Example
///
/// ```
/// use poolrun::device::{Device, DisplayClass};
///
/// let device = Device::new("emulator-5554")
///     .with_platform_version(33)
///     .with_display(DisplayClass::Tablet)
///     .with_feature("video");
///
/// assert!(device.is_tablet());
/// assert!(device.supports("video"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Unique serial.
    pub serial: DeviceId,

    /// Human-readable model name.
    #[serde(default)]
    pub model: String,

    /// Platform (OS/API) version.
    #[serde(default)]
    pub platform_version: u32,

    /// Display/geometry class.
    #[serde(default)]
    pub display: DisplayClass,

    /// Supported diagnostics (e.g. `video`, `screenshot`, `coverage`).
    #[serde(default)]
    pub features: BTreeSet<String>,
}

impl Device {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: DeviceId::new(serial),
            model: String::new(),
            platform_version: 0,
            display: DisplayClass::default(),
            features: BTreeSet::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_platform_version(mut self, version: u32) -> Self {
        self.platform_version = version;
        self
    }

    pub fn with_display(mut self, display: DisplayClass) -> Self {
        self.display = display;
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    pub fn id(&self) -> &DeviceId {
        &self.serial
    }

    pub fn is_tablet(&self) -> bool {
        self.display == DisplayClass::Tablet
    }

    pub fn supports(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

/// A named, immutable group of devices sharing one work queue.
///
/// Cloning is cheap; the member list is shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePool {
    id: PoolId,
    devices: Arc<[Device]>,
}

impl DevicePool {
    pub fn new(id: impl Into<PoolId>, devices: Vec<Device>) -> Self {
        Self {
            id: id.into(),
            devices: devices.into(),
        }
    }

    pub fn id(&self) -> &PoolId {
        &self.id
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id() == id)
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.devices.iter().map(Device::id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl From<String> for PoolId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_deserializes_with_defaults() {
        let device: Device = serde_json::from_str(r#"{"serial": "abc"}"#).unwrap();
        assert_eq!(device.id().as_str(), "abc");
        assert_eq!(device.platform_version, 0);
        assert_eq!(device.display, DisplayClass::Phone);
        assert!(device.features.is_empty());
    }

    #[test]
    fn test_display_class_kebab_case() {
        let device: Device =
            serde_json::from_str(r#"{"serial": "t1", "display": "tablet"}"#).unwrap();
        assert!(device.is_tablet());
    }

    #[test]
    fn test_pool_lookup() {
        let pool = DevicePool::new("p", vec![Device::new("a"), Device::new("b")]);
        assert_eq!(pool.len(), 2);
        assert!(pool.device(&DeviceId::new("b")).is_some());
        assert!(pool.device(&DeviceId::new("c")).is_none());
        let ids: Vec<_> = pool.device_ids().map(DeviceId::as_str).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
