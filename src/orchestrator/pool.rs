//! Per-pool coordination: one queue, one worker per device.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::worker::{DeviceWorker, panic_message};
use super::{DeviceSummary, PoolResult, RetryPolicy, SchedulerError};
use crate::backend::BackendSet;
use crate::device::DevicePool;
use crate::queue::{WorkItem, WorkQueue};
use crate::registry::PluginRegistry;
use crate::report::Reporter;
use crate::rules::{DeviceContext, Pipeline, PoolContext, PoolLogRule, Scope};
use crate::testcase::{TestCase, TestResult};

/// Append-only result store shared by the workers of one pool.
#[derive(Debug, Default)]
pub struct ResultCollector {
    results: Mutex<Vec<TestResult>>,
    retried: Mutex<Vec<TestResult>>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a final result.
    pub fn push(&self, result: TestResult) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);
    }

    /// Records an attempt that was superseded by a retry.
    pub fn push_retried(&self, result: TestResult) {
        self.retried
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);
    }

    /// Takes back the latest retried attempt of `test`, if there is one.
    pub fn reclaim_retried(&self, test: &TestCase) -> Option<TestResult> {
        let mut retried = self.retried.lock().unwrap_or_else(PoisonError::into_inner);
        let position = retried.iter().rposition(|r| r.test() == test)?;
        Some(retried.remove(position))
    }

    pub fn len(&self) -> usize {
        self.results.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the final and the retried results out of the collector.
    pub fn take(&self) -> (Vec<TestResult>, Vec<TestResult>) {
        let results = std::mem::take(&mut *self.results.lock().unwrap_or_else(PoisonError::into_inner));
        let retried = std::mem::take(&mut *self.retried.lock().unwrap_or_else(PoisonError::into_inner));
        (results, retried)
    }
}

/// Everything the device workers of one pool share.
#[derive(Clone)]
pub(crate) struct PoolShared {
    pub queue: Arc<WorkQueue>,
    pub registry: Arc<PluginRegistry>,
    pub backends: Arc<BackendSet>,
    pub retry: RetryPolicy,
    pub collector: Arc<ResultCollector>,
    pub reporter: Arc<dyn Reporter>,
    pub cancel: CancellationToken,
}

/// Runs one pool to completion.
pub struct PoolCoordinator {
    context: Arc<PoolContext>,
    items: Vec<WorkItem>,
    registry: Arc<PluginRegistry>,
    backends: Arc<BackendSet>,
    retry: RetryPolicy,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
}

impl PoolCoordinator {
    pub fn new(
        context: Arc<PoolContext>,
        items: Vec<WorkItem>,
        registry: Arc<PluginRegistry>,
        backends: Arc<BackendSet>,
        retry: RetryPolicy,
        reporter: Arc<dyn Reporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context,
            items,
            registry,
            backends,
            retry,
            reporter,
            cancel,
        }
    }

    /// Spawns the device workers and waits for all of them.
    ///
    /// Items still queued once every worker has stopped (their eligible
    /// devices were all retired) are recorded as ERROR results and counted
    /// as unreachable. A stranded retry instead keeps the attempt that
    /// asked for it as its final result. A fatal error in any worker, or a failed pool
    /// `before`, cancels the whole run.
    pub async fn run(self) -> Result<PoolResult, SchedulerError> {
        let ctx = Arc::clone(&self.context);
        let rules = self.registry.pool_rules(&ctx, &ctx.config().rules.pool)?;
        let pipeline = Pipeline::new(Scope::Pool).with_rule(PoolLogRule).with_rules(rules);

        let mut entered = pipeline.enter(&ctx).await;
        if let Some(failure) = entered.take_failure() {
            self.cancel.cancel();
            let nothing = PoolResult::new(ctx.pool().id().clone());
            pipeline.release(&ctx, nothing, &entered).await;
            return Err(failure.into());
        }

        let shared = PoolShared {
            queue: Arc::new(WorkQueue::new(self.items)),
            registry: self.registry,
            backends: self.backends,
            retry: self.retry,
            collector: Arc::new(ResultCollector::new()),
            reporter: self.reporter,
            cancel: self.cancel,
        };

        let mut workers = JoinSet::new();
        for device in ctx.pool().devices() {
            let device_ctx = Arc::new(DeviceContext::new(Arc::clone(&ctx), device.clone()));
            let id = device.id().clone();
            let worker = DeviceWorker::new(device_ctx, shared.clone());
            workers.spawn(async move {
                AssertUnwindSafe(worker.run())
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let reason = format!("worker panicked: {}", panic_message(panic.as_ref()));
                        error!("[{}] {}", id, reason);
                        Ok(DeviceSummary::new(id).with_retired(reason))
                    })
            });
        }

        let mut devices = Vec::with_capacity(ctx.pool().len());
        let mut fatal = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(summary)) => devices.push(summary),
                Ok(Err(e)) => {
                    shared.cancel.cancel();
                    fatal.get_or_insert(e);
                }
                Err(e) => error!("[{}] worker task failed: {}", ctx.pool().id(), e),
            }
        }
        devices.sort_by(|a, b| a.device.cmp(&b.device));
        let failure = match fatal {
            Some(e) => Some(SchedulerError::from(e)),
            None if shared.cancel.is_cancelled() => Some(SchedulerError::Aborted),
            None => None,
        };
        if let Some(e) = failure {
            let (results, retried_attempts) = shared.collector.take();
            let partial = PoolResult {
                results,
                retried_attempts,
                devices,
                ..PoolResult::new(ctx.pool().id().clone())
            };
            pipeline.release(&ctx, partial, &entered).await;
            return Err(e);
        }

        let mut unreachable = 0;
        for item in shared.queue.drain() {
            let previous = if item.failure_count() > 0 {
                shared.collector.reclaim_retried(item.test())
            } else {
                None
            };
            let result = match previous {
                Some(previous) => {
                    warn!(
                        "[{}] {}: no device left to retry it, keeping {}",
                        ctx.pool().id(),
                        previous.test(),
                        previous.status()
                    );
                    previous
                }
                None => {
                    unreachable += 1;
                    let result = unreachable_result(ctx.pool(), item);
                    warn!("[{}] {}: {}", ctx.pool().id(), result.test(), result.trace().unwrap_or_default());
                    result
                }
            };
            shared.reporter.on_test_complete(&result).await;
            shared.collector.push(result);
        }

        let (results, retried_attempts) = shared.collector.take();
        let pool_result = PoolResult {
            pool: ctx.pool().id().clone(),
            results,
            retried_attempts,
            unreachable,
            devices,
        };

        Ok(pipeline.unwind(&ctx, pool_result, &entered).await?)
    }
}

fn unreachable_result(pool: &DevicePool, item: WorkItem) -> TestResult {
    let device = pool
        .device_ids()
        .find(|d| item.is_compatible_with(d))
        .or_else(|| pool.device_ids().next())
        .cloned()
        .unwrap_or_else(|| crate::device::DeviceId::new("none"));
    TestResult::error(
        pool.id().clone(),
        device,
        item.test().clone(),
        "no device of the pool was left to run this test",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceId};
    use crate::testcase::TestStatus;

    #[test]
    fn test_collector_separates_retried_attempts() {
        let collector = ResultCollector::new();
        let result = |status| {
            TestResult::new("p".into(), DeviceId::new("d"), TestCase::new("pkg", "C", "m"), status)
        };
        collector.push_retried(result(TestStatus::Fail));
        collector.push(result(TestStatus::Pass));
        assert_eq!(collector.len(), 1);

        let (results, retried) = collector.take();
        assert_eq!(results[0].status(), TestStatus::Pass);
        assert_eq!(retried[0].status(), TestStatus::Fail);
        assert!(collector.is_empty());
    }

    #[test]
    fn test_reclaim_retried_takes_latest_attempt_of_test() {
        let collector = ResultCollector::new();
        let attempt = |method: &str, status| {
            TestResult::new("p".into(), DeviceId::new("d"), TestCase::new("pkg", "C", method), status)
        };
        collector.push_retried(attempt("m", TestStatus::Error));
        collector.push_retried(attempt("other", TestStatus::Fail));
        collector.push_retried(attempt("m", TestStatus::Fail));

        let reclaimed = collector.reclaim_retried(&TestCase::new("pkg", "C", "m")).unwrap();
        assert_eq!(reclaimed.status(), TestStatus::Fail);
        assert!(collector.reclaim_retried(&TestCase::new("pkg", "C", "missing")).is_none());

        let (_, retried) = collector.take();
        assert_eq!(retried.len(), 2);
    }

    #[test]
    fn test_unreachable_result_prefers_eligible_device() {
        let pool = DevicePool::new("p", vec![Device::new("a"), Device::new("b")]);
        let item = WorkItem::new(TestCase::new("pkg", "C", "m")).with_excluded([DeviceId::new("a")]);
        let result = unreachable_result(&pool, item);
        assert_eq!(result.device(), &DeviceId::new("b"));
        assert_eq!(result.status(), TestStatus::Error);
    }
}
