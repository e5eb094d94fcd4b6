//! Backend that reports results without running anything (`builtin.dry-run`).
//!
//! Useful to validate a configuration end to end: pooling, filtering, rule
//! hooks and reports all run, but no device is touched.
//!
//! ```toml
//! [[backends]]
//! type = "builtin.dry-run"
//! status = "PASS"
//! delay_ms = 20
//! fail = ["com.example.LoginTest#testBroken"]
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use super::{BackendResult, ExecutionBackend};
use crate::config::PluginEntry;
use crate::device::Device;
use crate::rules::TestCaseRunContext;
use crate::testcase::{TestCase, TestResult, TestStatus};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DryRunParams {
    #[serde(default = "default_status")]
    status: TestStatus,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    kinds: BTreeSet<String>,
    /// Tests (`pkg.Class#method`) reported as FAIL regardless of `status`.
    #[serde(default)]
    fail: BTreeSet<String>,
}

fn default_status() -> TestStatus {
    TestStatus::Pass
}

/// Reports a fixed status for every test.
#[derive(Debug, Clone)]
pub struct DryRunBackend {
    id: String,
    status: TestStatus,
    delay: Duration,
    kinds: BTreeSet<String>,
    fail: BTreeSet<String>,
}

impl DryRunBackend {
    pub fn new(id: impl Into<String>, status: TestStatus) -> Self {
        Self {
            id: id.into(),
            status,
            delay: Duration::ZERO,
            kinds: BTreeSet::new(),
            fail: BTreeSet::new(),
        }
    }

    pub fn from_params(entry: &PluginEntry) -> anyhow::Result<Self> {
        let params: DryRunParams = entry.parse_params()?;
        Ok(Self {
            id: entry.label().to_string(),
            status: params.status,
            delay: Duration::from_millis(params.delay_ms),
            kinds: params.kinds,
            fail: params.fail,
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Restricts the backend to these test kinds.
    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn with_failing(mut self, test: impl Into<String>) -> Self {
        self.fail.insert(test.into());
        self
    }
}

#[async_trait]
impl ExecutionBackend for DryRunBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, _device: &Device, test: &TestCase) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&test.kind)
    }

    async fn execute(&self, ctx: &TestCaseRunContext) -> BackendResult<TestResult> {
        let started = Utc::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let identity = ctx.expected_identity();
        let status = if self.fail.contains(&identity.test.to_string()) {
            TestStatus::Fail
        } else {
            self.status
        };

        let mut result = TestResult::new(identity.pool, identity.device, identity.test, status)
            .with_timestamps(started, Utc::now());
        if status == TestStatus::Fail {
            result = result.with_trace("dry run: marked as failing");
        }
        Ok(result)
    }
}
