//! Devices listed directly in the configuration (`builtin.static`).
//!
//! ```toml
//! [devices]
//! type = "builtin.static"
//! devices = [
//!     { serial = "emulator-5554", platform_version = 33 },
//!     { serial = "R58M123ABC", model = "Galaxy Tab", display = "tablet" },
//! ]
//! ```

use async_trait::async_trait;
use serde::Deserialize;

use super::{DeviceProvider, ProviderResult};
use crate::config::PluginEntry;
use crate::device::Device;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StaticParams {
    #[serde(default)]
    devices: Vec<Device>,
}

/// Provider returning a fixed device list.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    devices: Vec<Device>,
}

impl StaticProvider {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn from_params(entry: &PluginEntry) -> anyhow::Result<Self> {
        let params: StaticParams = entry.parse_params()?;
        Ok(Self::new(params.devices))
    }
}

#[async_trait]
impl DeviceProvider for StaticProvider {
    fn name(&self) -> &str {
        "builtin.static"
    }

    async fn devices(&self) -> ProviderResult<Vec<Device>> {
        Ok(self.devices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;
    use crate::device::DisplayClass;

    #[tokio::test]
    async fn test_devices_from_config() {
        let config = load_config_str(
            r#"
            [devices]
            type = "builtin.static"
            devices = [
                { serial = "a", platform_version = 33 },
                { serial = "b", display = "tablet", features = ["video"] },
            ]

            [suite]
            type = "inline"
            "#,
        )
        .unwrap();

        let provider = StaticProvider::from_params(&config.devices).unwrap();
        let devices = provider.devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].platform_version, 33);
        assert_eq!(devices[1].display, DisplayClass::Tablet);
        assert!(devices[1].supports("video"));
    }
}
