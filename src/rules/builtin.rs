//! Rules shipped with poolrun.
//!
//! The log rules and [`TimingRule`] are always installed, ahead of any
//! configured rule. The others are selected through the registry as
//! `builtin.capture-trace` and `builtin.tag-retry`.

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{DeviceContext, PoolContext, Rule, RunContext, TestCaseRunContext};
use crate::orchestrator::{DeviceSummary, PoolResult, RunResult};
use crate::testcase::TestResult;

/// Logs the start and the outcome of the run.
pub struct RunLogRule;

#[async_trait]
impl Rule<RunContext, RunResult> for RunLogRule {
    fn name(&self) -> &str {
        "builtin.run-log"
    }

    async fn before(&self, ctx: &RunContext) -> anyhow::Result<()> {
        info!(
            "Starting run '{}' ({}), output in {}",
            ctx.config().run.name,
            ctx.run_id(),
            ctx.output_dir().display()
        );
        Ok(())
    }

    async fn after(&self, _ctx: &RunContext, carried: RunResult) -> anyhow::Result<RunResult> {
        info!(
            "Run {} finished in {:?}: {} passed, {} failed, {} errors, {} retries used",
            carried.run_id,
            carried.duration,
            carried.passed(),
            carried.failed(),
            carried.errors(),
            carried.retries_used
        );
        Ok(carried)
    }
}

/// Logs when a pool starts and what it produced.
pub struct PoolLogRule;

#[async_trait]
impl Rule<PoolContext, PoolResult> for PoolLogRule {
    fn name(&self) -> &str {
        "builtin.pool-log"
    }

    async fn before(&self, ctx: &PoolContext) -> anyhow::Result<()> {
        info!(
            "Pool {} starting with {} device(s)",
            ctx.pool().id(),
            ctx.pool().len()
        );
        Ok(())
    }

    async fn after(&self, ctx: &PoolContext, carried: PoolResult) -> anyhow::Result<PoolResult> {
        info!(
            "Pool {} done: {} result(s), {} retried attempt(s), {} unreachable",
            ctx.pool().id(),
            carried.results.len(),
            carried.retried_attempts.len(),
            carried.unreachable
        );
        Ok(carried)
    }
}

/// Logs device worker start and retirement.
pub struct DeviceLogRule;

#[async_trait]
impl Rule<DeviceContext, DeviceSummary> for DeviceLogRule {
    fn name(&self) -> &str {
        "builtin.device-log"
    }

    async fn before(&self, ctx: &DeviceContext) -> anyhow::Result<()> {
        debug!("[{}] worker started in pool {}", ctx.device().id(), ctx.pool().id());
        Ok(())
    }

    async fn after(
        &self,
        ctx: &DeviceContext,
        carried: DeviceSummary,
    ) -> anyhow::Result<DeviceSummary> {
        match &carried.retired {
            Some(reason) => warn!("[{}] retired: {}", ctx.device().id(), reason),
            None => debug!("[{}] executed {} attempt(s)", ctx.device().id(), carried.executed),
        }
        Ok(carried)
    }
}

/// Records attempt wall time (rules included) as the `attempt_ms` metric.
///
/// A fresh instance is created for every attempt.
#[derive(Default)]
pub struct TimingRule {
    started: Mutex<Option<Instant>>,
}

impl TimingRule {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Rule<TestCaseRunContext, TestResult> for TimingRule {
    fn name(&self) -> &str {
        "builtin.timing"
    }

    async fn before(&self, _ctx: &TestCaseRunContext) -> anyhow::Result<()> {
        *self.started.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        Ok(())
    }

    async fn after(
        &self,
        _ctx: &TestCaseRunContext,
        carried: TestResult,
    ) -> anyhow::Result<TestResult> {
        let started = *self.started.lock().unwrap_or_else(|e| e.into_inner());
        let Some(started) = started else {
            return Ok(carried);
        };
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        let duration = carried.duration().as_secs_f64() * 1000.0;
        Ok(carried
            .with_metric("attempt_ms", elapsed)
            .with_metric("duration_ms", duration))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CaptureTraceParams {
    #[serde(default = "default_trace_file")]
    file_name: String,
}

fn default_trace_file() -> String {
    "failure-trace.txt".to_string()
}

/// Saves the trace of failing attempts as an artifact.
pub struct CaptureTraceRule {
    file_name: String,
}

impl CaptureTraceRule {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn from_params(entry: &crate::config::PluginEntry) -> anyhow::Result<Self> {
        let params: CaptureTraceParams = entry.parse_params()?;
        Ok(Self::new(params.file_name))
    }
}

#[async_trait]
impl Rule<TestCaseRunContext, TestResult> for CaptureTraceRule {
    fn name(&self) -> &str {
        "builtin.capture-trace"
    }

    async fn after(
        &self,
        ctx: &TestCaseRunContext,
        carried: TestResult,
    ) -> anyhow::Result<TestResult> {
        if !carried.status().is_failure() {
            return Ok(carried);
        }
        let Some(trace) = carried.trace() else {
            return Ok(carried);
        };
        let artifact = ctx.artifacts().write(&self.file_name, trace).await?;
        Ok(carried.with_artifact(artifact))
    }
}

/// Marks attempts that are retries with the `retry_attempt` metric.
pub struct TagRetryRule;

#[async_trait]
impl Rule<TestCaseRunContext, TestResult> for TagRetryRule {
    fn name(&self) -> &str {
        "builtin.tag-retry"
    }

    async fn after(
        &self,
        ctx: &TestCaseRunContext,
        carried: TestResult,
    ) -> anyhow::Result<TestResult> {
        let attempt = ctx.item().failure_count();
        if attempt == 0 {
            return Ok(carried);
        }
        Ok(carried.with_metric("retry_attempt", f64::from(attempt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginEntry;
    use crate::rules::fixtures::{attempt, test_item};
    use crate::rules::{Pipeline, Scope};
    use crate::testcase::TestStatus;

    fn failing(ctx: &TestCaseRunContext) -> TestResult {
        let id = ctx.expected_identity();
        TestResult::error(id.pool, id.device, id.test, "boom\nat Foo.kt:12")
    }

    #[tokio::test]
    async fn test_timing_records_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = attempt(dir.path(), test_item());
        let pipeline = Pipeline::new(Scope::TestCaseRun).with_rule(TimingRule::new());

        let entered = pipeline.enter(&ctx).await;
        let result = pipeline.unwind(&ctx, failing(&ctx), &entered).await.unwrap();

        assert!(result.metrics().contains_key("attempt_ms"));
        assert!(result.metrics().contains_key("duration_ms"));
    }

    #[tokio::test]
    async fn test_capture_trace_writes_artifact_for_failures() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = attempt(dir.path(), test_item());
        let rule = CaptureTraceRule::from_params(&PluginEntry::new("builtin.capture-trace"))
            .unwrap();

        let result = rule.after(&ctx, failing(&ctx)).await.unwrap();
        assert_eq!(result.artifacts().len(), 1);
        let written = std::fs::read_to_string(&result.artifacts()[0].path).unwrap();
        assert!(written.contains("Foo.kt:12"));

        let id = ctx.expected_identity();
        let passing = TestResult::new(id.pool, id.device, id.test, TestStatus::Pass);
        let result = rule.after(&ctx, passing).await.unwrap();
        assert!(result.artifacts().is_empty());
    }

    #[test]
    fn test_capture_trace_rejects_unknown_params() {
        let entry = PluginEntry::new("builtin.capture-trace").with_param("bogus", 1_i64);
        assert!(CaptureTraceRule::from_params(&entry).is_err());
    }

    #[tokio::test]
    async fn test_tag_retry_only_tags_retries() {
        let dir = tempfile::tempdir().unwrap();

        let first = attempt(dir.path(), test_item());
        let result = TagRetryRule.after(&first, failing(&first)).await.unwrap();
        assert!(!result.metrics().contains_key("retry_attempt"));

        let retry = attempt(dir.path(), test_item().successor().successor());
        let result = TagRetryRule.after(&retry, failing(&retry)).await.unwrap();
        assert_eq!(result.metrics()["retry_attempt"], 2.0);
    }
}
