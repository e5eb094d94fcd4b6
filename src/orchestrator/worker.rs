//! One worker per device, pulling from the pool's shared queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, warn};

use super::pool::PoolShared;
use super::DeviceSummary;
use crate::queue::WorkItem;
use crate::rules::{DeviceContext, DeviceLogRule, Pipeline, PipelineError, Scope, TestCaseRunContext, TimingRule};
use crate::testcase::{ResultIdentity, TestResult};

/// Slack on top of the backend's own timeout before the worker gives up
/// on it.
const WATCHDOG_MARGIN: Duration = Duration::from_secs(5);

/// Executes work items on a single device until the pool's queue has
/// nothing more for it.
pub struct DeviceWorker {
    context: Arc<DeviceContext>,
    shared: PoolShared,
}

impl DeviceWorker {
    pub(crate) fn new(context: Arc<DeviceContext>, shared: PoolShared) -> Self {
        Self { context, shared }
    }

    /// Runs the device pipeline around the work loop.
    ///
    /// A failed device `before` retires the device without taking any
    /// work. The only error returned is a fatal pipeline error, after
    /// which the whole run is cancelled.
    pub async fn run(self) -> Result<DeviceSummary, PipelineError> {
        let ctx = Arc::clone(&self.context);
        let mut summary = DeviceSummary::new(ctx.device().id().clone());

        let config = ctx.config();
        let pipeline = match self.shared.registry.device_rules(&ctx, &config.rules.device) {
            Ok(rules) => Pipeline::new(Scope::Device).with_rule(DeviceLogRule).with_rules(rules),
            Err(e) => {
                summary.retired = Some(e.to_string());
                return Ok(summary);
            }
        };

        let mut entered = pipeline.enter(&ctx).await;
        let outcome = match entered.take_failure() {
            Some(failure) => {
                summary.retired = Some(failure.to_string());
                Ok(())
            }
            None => self.work(&mut summary).await,
        };
        if let Err(e) = outcome {
            pipeline.release(&ctx, summary, &entered).await;
            return Err(e);
        }

        pipeline.unwind(&ctx, summary, &entered).await
    }

    async fn work(&self, summary: &mut DeviceSummary) -> Result<(), PipelineError> {
        let device = self.context.device().id();
        let queue = &self.shared.queue;
        let cancel = &self.shared.cancel;
        let poll_timeout = self.context.config().run.poll_timeout();

        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => break,
                task = queue.poll_for_device(device, poll_timeout) => task,
            };

            let Some(task) = task else {
                if queue.has_no_potential_events_for(device) {
                    debug!("[{}] no more work", device);
                    break;
                }
                continue;
            };

            // Not raced against `cancel`: an attempt in progress always unwinds its rules.
            let outcome = task.do_work(|item| self.contained(item)).await;
            summary.executed += 1;

            if let Err(e) = outcome {
                cancel.cancel();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Processes `item`, turning a panic anywhere in the attempt into an
    /// ERROR result for it.
    async fn contained(&self, item: WorkItem) -> Result<(), PipelineError> {
        let identity = self.identity_for(&item);
        match AssertUnwindSafe(self.process(item)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let trace = format!("worker panicked: {}", panic_message(panic.as_ref()));
                warn!("[{}] {}: {}", identity.device, identity.test, trace);
                self.record(error_result(identity, Utc::now(), trace)).await;
                Ok(())
            }
        }
    }

    async fn process(&self, item: WorkItem) -> Result<(), PipelineError> {
        let ctx = TestCaseRunContext::new(Arc::clone(&self.context), item);
        let config = ctx.config();

        let base = Pipeline::new(Scope::TestCaseRun).with_rule(TimingRule::new());
        let (pipeline, setup_error) =
            match self.shared.registry.test_case_run_rules(&ctx, &config.rules.test_case_run) {
                Ok(rules) => (base.with_rules(rules), None),
                Err(e) => (base, Some(e.to_string())),
            };

        let started = Utc::now();
        let mut entered = pipeline.enter(&ctx).await;
        let result = match (setup_error, entered.take_failure()) {
            (Some(error), _) => error_result(ctx.expected_identity(), started, error),
            (None, Some(failure)) => error_result(ctx.expected_identity(), started, failure.to_string()),
            (None, None) => match self.execute(&ctx).await {
                Ok(result) => result,
                Err(e) => {
                    let aborted = error_result(ctx.expected_identity(), started, e.to_string());
                    pipeline.release(&ctx, aborted, &entered).await;
                    return Err(e);
                }
            },
        };

        let result = pipeline.unwind(&ctx, result, &entered).await?;

        match self.shared.retry.successor(ctx.item(), &result, ctx.pool()) {
            Some(next) => {
                info!(
                    "[{}] {} {}, retrying (attempt {})",
                    ctx.device().id(),
                    result.test(),
                    result.status(),
                    next.failure_count() + 1
                );
                match self.shared.queue.offer(next) {
                    Ok(()) => self.shared.collector.push_retried(result),
                    Err(e) => {
                        warn!("Could not re-offer {}: {}", result.test(), e);
                        self.record(result).await;
                    }
                }
            }
            None => self.record(result).await,
        }
        Ok(())
    }

    /// Runs the item's first supporting backend for this device.
    ///
    /// Backend errors, panics and a backend that never answers all become
    /// an ERROR result. A result for the wrong test, device or pool is a
    /// fatal error.
    async fn execute(&self, ctx: &TestCaseRunContext) -> Result<TestResult, PipelineError> {
        let expected = ctx.expected_identity();
        let started = Utc::now();

        let backend = ctx
            .item()
            .backends_for(ctx.device().id())
            .first()
            .and_then(|id| self.shared.backends.get(id));
        let Some(backend) = backend else {
            let trace = format!("no backend supports {} on {}", expected.test, expected.device);
            return Ok(error_result(expected, started, trace));
        };

        let run = &ctx.config().run;
        let limit = run.output_timeout() + run.listener_grace() + WATCHDOG_MARGIN;
        debug!("[{}] running {} with {}", expected.device, expected.test, backend.id());

        let outcome = tokio::time::timeout(limit, AssertUnwindSafe(backend.execute(ctx)).catch_unwind()).await;
        let result = match outcome {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => {
                warn!("[{}] {}: {}", expected.device, expected.test, e);
                return Ok(error_result(expected, started, e.to_string()));
            }
            Ok(Err(panic)) => {
                let trace = format!("backend '{}' panicked: {}", backend.id(), panic_message(panic.as_ref()));
                warn!("[{}] {}: {}", expected.device, expected.test, trace);
                return Ok(error_result(expected, started, trace));
            }
            Err(_) => {
                let trace = format!("backend '{}' did not answer within {:?}", backend.id(), limit);
                warn!("[{}] {}: {}", expected.device, expected.test, trace);
                return Ok(error_result(expected, started, trace));
            }
        };

        let actual = result.identity();
        if actual != expected {
            return Err(PipelineError::IdentityViolation {
                scope: Scope::TestCaseRun,
                rule: backend.id().to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(result)
    }

    async fn record(&self, result: TestResult) {
        self.shared.reporter.on_test_complete(&result).await;
        self.shared.collector.push(result);
    }

    fn identity_for(&self, item: &WorkItem) -> ResultIdentity {
        ResultIdentity {
            pool: self.context.pool().id().clone(),
            device: self.context.device().id().clone(),
            test: item.test().clone(),
        }
    }
}

fn error_result(identity: ResultIdentity, started: chrono::DateTime<Utc>, trace: impl Into<String>) -> TestResult {
    TestResult::error(identity.pool, identity.device, identity.test, trace).with_timestamps(started, Utc::now())
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
