//! Execution backends: the components that actually run a test on a device.
//!
//! A backend receives a [`TestCaseRunContext`] and produces exactly one
//! [`TestResult`] whose identity matches the context. Backends are selected
//! per (device, test) pair during preparation: every configured backend is
//! asked whether it [`supports`](ExecutionBackend::supports) the pair, and the
//! supporting backend identifiers are recorded on the work item in
//! configuration order. Devices no backend supports are excluded from the
//! item up front.
//!
//! ```text
//!  DeviceWorker ──► ExecutionBackend::execute(ctx)
//!                        │
//!                        ├── Ok(TestResult)        ─► pipeline unwind
//!                        ├── Err(BackendError)     ─► ERROR result
//!                        ├── panic                 ─► ERROR result
//!                        └── no answer in time     ─► ERROR result
//! ```
//!
//! # Built-in Backends
//!
//! | Identifier | Module | Description |
//! |------------|--------|-------------|
//! | `builtin.shell` | [`shell`] | Runs a command template through a shell |
//! | `builtin.dry-run` | [`dry_run`] | Reports a fixed status without running anything |

pub mod dry_run;
pub mod shell;

use std::sync::Arc;

use async_trait::async_trait;

use crate::device::Device;
use crate::rules::TestCaseRunContext;
use crate::testcase::{TestCase, TestResult};

pub use dry_run::DryRunBackend;
pub use shell::ShellBackend;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors a backend can report instead of a test result.
///
/// Every variant is turned into an ERROR result by the device worker; none
/// of them stops the run.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The test process could not be started.
    #[error("Failed to launch test: {0}")]
    Launch(String),

    /// Output listeners did not finish within the grace period.
    #[error("Lost connection to test output: {0}")]
    Disconnected(String),

    /// The test exceeded its output timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Runs tests on devices.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Instance identifier, unique among configured backends.
    fn id(&self) -> &str;

    /// Whether this backend can run `test` on `device`.
    fn supports(&self, _device: &Device, _test: &TestCase) -> bool {
        true
    }

    /// Runs one attempt and returns its result.
    async fn execute(&self, ctx: &TestCaseRunContext) -> BackendResult<TestResult>;
}

/// The configured backends, in preference order.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: Vec<Arc<dyn ExecutionBackend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn push(&mut self, backend: Arc<dyn ExecutionBackend>) {
        self.backends.push(backend);
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn ExecutionBackend>> {
        self.backends.iter().find(|b| b.id() == id)
    }

    /// Identifiers of the backends supporting `(device, test)`, in order.
    pub fn supporting(&self, device: &Device, test: &TestCase) -> Vec<String> {
        self.backends
            .iter()
            .filter(|b| b.supports(device, test))
            .map(|b| b.id().to_string())
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.backends.iter().map(|b| b.id())
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcase::TestStatus;

    #[test]
    fn test_supporting_keeps_configuration_order() {
        let set = BackendSet::new()
            .with_backend(Arc::new(DryRunBackend::new("first", TestStatus::Pass).with_kinds(["unit"])))
            .with_backend(Arc::new(DryRunBackend::new("second", TestStatus::Pass)));

        let device = Device::new("d");
        let unit = TestCase::new("p", "C", "m").with_kind("unit");
        let ui = TestCase::new("p", "C", "m");

        assert_eq!(set.supporting(&device, &unit), vec!["first", "second"]);
        assert_eq!(set.supporting(&device, &ui), vec!["second"]);
        assert!(set.get("second").is_some());
        assert!(set.get("third").is_none());
    }
}
