//! Configuration schema definitions for poolrun.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Extension points (device providers, backends,
//! rules) are configured as [`PluginEntry`] tables: a `type` identifier that
//! is resolved through the [`PluginRegistry`](crate::registry::PluginRegistry),
//! plus free-form parameters handed to the plugin's factory.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunConfig          - Output, timeouts, ignore_failures
//! ├── RetryConfig        - Global and per-test-case retry quotas
//! ├── devices            - PluginEntry selecting the device provider
//! ├── PoolingConfig      - Tagged enum selecting the pooling strategy
//! ├── SuiteConfig        - Tagged enum selecting the suite loader
//! ├── backends           - PluginEntry list of execution backends
//! ├── RulesConfig        - PluginEntry lists per rule scope
//! └── ReportConfig       - Console / JSON / JUnit output
//! ```
//!
//! # Example
//!
//! ```toml
//! [run]
//! output_dir = "build/poolrun"
//! output_timeout_secs = 600
//!
//! [retry]
//! total_allowed_retry_quota = 20
//! retry_per_test_case_quota = 2
//!
//! [devices]
//! type = "builtin.static"
//! devices = [{ serial = "emulator-5554", platform_version = 33 }]
//!
//! [pooling]
//! strategy = "per-device"
//!
//! [suite]
//! type = "inline"
//! tests = [{ package = "com.example", class = "LoginTest", method = "testValid" }]
//!
//! [[backends]]
//! type = "builtin.shell"
//! command = "run-test --serial {device} --test {test}"
//!
//! [[rules.test_case_run]]
//! type = "builtin.capture-trace"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::testcase::TestCase;

/// Root configuration structure for poolrun.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core run settings.
    #[serde(default)]
    pub run: RunConfig,

    /// Retry quotas.
    #[serde(default)]
    pub retry: RetryConfig,

    /// The device provider.
    pub devices: PluginEntry,

    /// How devices are partitioned into pools.
    #[serde(default)]
    pub pooling: PoolingConfig,

    /// Where the tests come from.
    pub suite: SuiteConfig,

    /// Execution backends, in preference order.
    #[serde(default = "default_backends")]
    pub backends: Vec<PluginEntry>,

    /// Configured rules per scope, appended after the built-in rules.
    #[serde(default)]
    pub rules: RulesConfig,

    /// Report configuration (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

fn default_backends() -> Vec<PluginEntry> {
    vec![PluginEntry::new("builtin.dry-run")]
}

/// Core run settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `name` | `"poolrun"` |
/// | `output_dir` | `"poolrun-output"` |
/// | `ignore_failures` | false |
/// | `output_timeout_secs` | 300 |
/// | `listener_grace_secs` | 5 |
/// | `poll_timeout_secs` | 10 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Name of the run, used in reports.
    #[serde(default = "default_run_name")]
    pub name: String,

    /// Directory receiving artifacts and reports. `~` and `$VARS` are expanded.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Exit successfully even when failures remain.
    #[serde(default)]
    pub ignore_failures: bool,

    /// How long a backend may run a single test.
    #[serde(default = "default_output_timeout")]
    pub output_timeout_secs: u64,

    /// How long to wait for backend listeners to drain after a test ends.
    #[serde(default = "default_listener_grace")]
    pub listener_grace_secs: u64,

    /// How long a device worker waits for compatible work per poll.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: default_run_name(),
            output_dir: default_output_dir(),
            ignore_failures: false,
            output_timeout_secs: default_output_timeout(),
            listener_grace_secs: default_listener_grace(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

impl RunConfig {
    /// The output directory with `~` and environment variables expanded.
    pub fn output_dir(&self) -> PathBuf {
        let raw = self.output_dir.to_string_lossy();
        match shellexpand::full(&raw) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(_) => self.output_dir.clone(),
        }
    }

    pub fn output_timeout(&self) -> Duration {
        Duration::from_secs(self.output_timeout_secs)
    }

    pub fn listener_grace(&self) -> Duration {
        Duration::from_secs(self.listener_grace_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

fn default_run_name() -> String {
    "poolrun".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("poolrun-output")
}

fn default_output_timeout() -> u64 {
    300
}

fn default_listener_grace() -> u64 {
    5
}

fn default_poll_timeout() -> u64 {
    10
}

/// Retry quotas.
///
/// A failed (FAIL or ERROR) test is retried while its own failure count is
/// below `retry_per_test_case_quota` and the run-wide
/// `total_allowed_retry_quota` is not exhausted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_total_retry_quota")]
    pub total_allowed_retry_quota: usize,

    #[serde(default = "default_per_test_retry_quota")]
    pub retry_per_test_case_quota: u32,

    /// Prefer a different device for the retry when the pool has one.
    #[serde(default = "default_true")]
    pub avoid_failed_device: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            total_allowed_retry_quota: default_total_retry_quota(),
            retry_per_test_case_quota: default_per_test_retry_quota(),
            avoid_failed_device: true,
        }
    }
}

fn default_total_retry_quota() -> usize {
    200
}

fn default_per_test_retry_quota() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// A pluggable component selected by identifier.
///
/// Every key other than `type` and `name` is collected into `params` and
/// handed to the plugin factory.
///
/// ```toml
/// [[rules.device]]
/// type = "builtin.hook"
/// before = ["adb -s {device} shell settings put global animator_duration_scale 0"]
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PluginEntry {
    /// Registry identifier, e.g. `builtin.shell`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Optional instance name; defaults to the identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Factory parameters.
    #[serde(flatten)]
    pub params: toml::Table,
}

impl PluginEntry {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            params: toml::Table::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// The instance name: `name` if set, otherwise the identifier.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }

    /// Deserializes the parameters into a typed settings struct.
    pub fn parse_params<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let value = toml::Value::Table(self.params.clone());
        value
            .try_into()
            .map_err(|e| anyhow::anyhow!("invalid parameters for '{}': {}", self.label(), e))
    }
}

/// Device characteristic used by capability pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Characteristic {
    PlatformVersion,
    Display,
}

impl Characteristic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Characteristic::PlatformVersion => "platform_version",
            Characteristic::Display => "display",
        }
    }
}

/// How devices are grouped into pools.
///
/// # Strategies
///
/// | Strategy | Pools |
/// |----------|-------|
/// | `omni` | One pool with every device (default) |
/// | `manual` | Named pools listing device serials |
/// | `tablet` | `tablets` and `phones` |
/// | `capability` | Up to `buckets` ranges of a characteristic |
/// | `per-device` | One pool per device |
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum PoolingConfig {
    #[default]
    Omni,
    Manual {
        pools: BTreeMap<String, Vec<String>>,
    },
    Tablet,
    Capability {
        characteristic: Characteristic,
        #[serde(default = "default_buckets")]
        buckets: usize,
    },
    PerDevice,
}

fn default_buckets() -> usize {
    2
}

/// A test as written in a suite definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestDescriptor {
    #[serde(flatten)]
    pub test: TestCase,

    /// Only run on these device serials (empty: any device).
    #[serde(default)]
    pub only_on: Vec<String>,

    /// Never run on these device serials.
    #[serde(default)]
    pub not_on: Vec<String>,
}

/// Where the test suite comes from.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SuiteConfig {
    /// Tests listed directly in the configuration.
    Inline {
        #[serde(default)]
        tests: Vec<TestDescriptor>,
    },
    /// Tests listed in a JSON file (an array of descriptors).
    File { path: PathBuf },
}

/// Configured rules per scope.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub run: Vec<PluginEntry>,

    #[serde(default)]
    pub pool: Vec<PluginEntry>,

    #[serde(default)]
    pub device: Vec<PluginEntry>,

    #[serde(default)]
    pub test_case_run: Vec<PluginEntry>,

    /// Pool-scope rules that filter/transform the suite before scheduling.
    #[serde(default)]
    pub test_case: Vec<PluginEntry>,
}

/// Report outputs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Progress bar and summary on the terminal.
    #[serde(default = "default_true")]
    pub console: bool,

    /// Write `results.json` into the output directory.
    #[serde(default = "default_true")]
    pub json: bool,

    /// Write a JUnit XML report to this path.
    #[serde(default)]
    pub junit: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            console: true,
            json: true,
            junit: None,
        }
    }
}
