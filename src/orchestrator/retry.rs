//! Retry decisions and the run-wide retry budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::config::RetryConfig;
use crate::device::DevicePool;
use crate::queue::WorkItem;
use crate::testcase::TestResult;

/// Retries left for the whole run, shared by every pool.
#[derive(Debug)]
pub struct RetryBudget {
    total: usize,
    remaining: AtomicUsize,
}

impl RetryBudget {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            remaining: AtomicUsize::new(total),
        }
    }

    /// Takes one retry from the budget. Returns `false` once it is spent.
    pub fn try_consume(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn used(&self) -> usize {
        self.total - self.remaining()
    }
}

/// Decides whether a finished attempt gets another one.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    per_test_case: u32,
    avoid_failed_device: bool,
    budget: Arc<RetryBudget>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig, budget: Arc<RetryBudget>) -> Self {
        Self {
            per_test_case: config.retry_per_test_case_quota,
            avoid_failed_device: config.avoid_failed_device,
            budget,
        }
    }

    /// Returns the item to re-offer after `result`, or `None` if `result`
    /// is final.
    ///
    /// The per-test quota is checked before the shared budget so that a
    /// test past its own quota never spends a retry.
    pub fn successor(
        &self,
        item: &WorkItem,
        result: &TestResult,
        pool: &DevicePool,
    ) -> Option<WorkItem> {
        if !result.status().is_failure() || item.failure_count() >= self.per_test_case {
            return None;
        }
        if !self.budget.try_consume() {
            debug!("Retry budget spent, not retrying {}", item.test());
            return None;
        }

        if self.avoid_failed_device {
            let next = item.successor_excluding(result.device());
            if pool.device_ids().any(|d| next.is_compatible_with(d)) {
                return Some(next);
            }
        }
        Some(item.successor())
    }
}
