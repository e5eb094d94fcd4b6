//! Devices reported by an external command (`builtin.command`).
//!
//! The command must print a JSON array of devices on stdout:
//!
//! ```json
//! [{"serial": "emulator-5554", "platform_version": 33, "display": "phone"}]
//! ```
//!
//! ```toml
//! [devices]
//! type = "builtin.command"
//! command = "./scripts/list-devices.sh"
//! timeout_secs = 30
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{DeviceProvider, ProviderError, ProviderResult};
use crate::config::PluginEntry;
use crate::device::Device;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandParams {
    command: String,
    #[serde(default = "default_shell")]
    shell: String,
    #[serde(default = "default_timeout")]
    timeout_secs: u64,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_timeout() -> u64 {
    60
}

/// Provider that runs a command and parses its JSON output.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    command: String,
    shell: String,
    timeout: Duration,
}

impl CommandProvider {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            shell: default_shell(),
            timeout: Duration::from_secs(default_timeout()),
        }
    }

    pub fn from_params(entry: &PluginEntry) -> anyhow::Result<Self> {
        let params: CommandParams = entry.parse_params()?;
        Ok(Self {
            command: params.command,
            shell: params.shell,
            timeout: Duration::from_secs(params.timeout_secs),
        })
    }
}

#[async_trait]
impl DeviceProvider for CommandProvider {
    fn name(&self) -> &str {
        "builtin.command"
    }

    async fn devices(&self) -> ProviderResult<Vec<Device>> {
        debug!("Listing devices: {}", self.command);

        let mut command = tokio::process::Command::new(&self.shell);
        command.arg("-c").arg(&self.command).kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                ProviderError::Timeout(format!("`{}` did not finish in {:?}", self.command, self.timeout))
            })??;

        if !output.status.success() {
            return Err(ProviderError::CommandFailed(format!(
                "`{}` exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| ProviderError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parses_json_output() {
        let provider = CommandProvider::new(
            r#"echo '[{"serial": "a", "platform_version": 30}, {"serial": "b"}]'"#,
        );
        let devices = provider.devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].platform_version, 30);
    }

    #[tokio::test]
    async fn test_failing_command() {
        let provider = CommandProvider::new("echo nope >&2; exit 2");
        let err = provider.devices().await.unwrap_err();
        assert!(matches!(err, ProviderError::CommandFailed(msg) if msg.contains("nope")));
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let provider = CommandProvider::new("echo not-json");
        assert!(matches!(
            provider.devices().await,
            Err(ProviderError::Parse(_))
        ));
    }
}
