//! Device providers: where the devices of a run come from.
//!
//! A provider is asked once, before scheduling, for the full list of
//! devices. The list is then partitioned into pools by the configured
//! [`pooling`](crate::pooling) strategy.
//!
//! ```text
//! ┌──────────────────┐   devices()   ┌─────────────┐  partition()  ┌──────────────┐
//! │  DeviceProvider  │ ────────────► │ Vec<Device> │ ────────────► │ DevicePool…  │
//! └──────────────────┘               └─────────────┘               └──────────────┘
//! ```
//!
//! # Built-in Providers
//!
//! | Identifier | Module | Description |
//! |------------|--------|-------------|
//! | `builtin.static` | [`static_set`] | Devices listed in the configuration |
//! | `builtin.command` | [`command`] | Devices printed as JSON by a command |
//!
//! # Error Handling
//!
//! All provider operations return [`ProviderResult<T>`]. A provider error
//! aborts the run before any test is scheduled.

pub mod command;
pub mod static_set;

use async_trait::async_trait;

use crate::device::Device;

pub use command::CommandProvider;
pub use static_set::StaticProvider;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur while discovering devices.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The discovery command could not run or exited unsuccessfully.
    #[error("Device discovery command failed: {0}")]
    CommandFailed(String),

    /// The discovery output could not be parsed.
    #[error("Failed to parse device list: {0}")]
    Parse(String),

    /// Discovery took too long.
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Provider-specific error not covered by other variants.
    #[error("Provider-specific error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Source of the devices available to a run.
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Lists the devices available right now.
    async fn devices(&self) -> ProviderResult<Vec<Device>>;
}
