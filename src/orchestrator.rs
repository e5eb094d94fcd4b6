//! Run orchestration: from configuration to aggregated results.
//!
//! The [`Orchestrator`] resolves every configured component up front, so
//! that a bad identifier, a device no pooling strategy can place or a test
//! no backend can run fails the run before any test is scheduled. It then
//! runs all pools concurrently:
//!
//! ```text
//!                          ┌──────────────────────┐
//!                          │     Orchestrator     │  run pipeline
//!                          └──────────┬───────────┘
//!             ┌───────────────────────┼───────────────────────┐
//!             ▼                       ▼                       ▼
//!     ┌───────────────┐       ┌───────────────┐       ┌───────────────┐
//!     │PoolCoordinator│       │PoolCoordinator│       │PoolCoordinator│  pool pipeline
//!     │   WorkQueue   │       │   WorkQueue   │       │   WorkQueue   │
//!     └───────┬───────┘       └───────────────┘       └───────────────┘
//!       ┌─────┴─────┐
//!       ▼           ▼
//!  DeviceWorker DeviceWorker                                           device pipeline
//!       │
//!       └─► TestCaseRunContext ─► backend ─► RetryPolicy ─► offer / record
//! ```
//!
//! All pools share one [`RetryBudget`]. A fatal error anywhere (an identity
//! violation, a failed run or pool `before`) cancels every worker through
//! a shared [`CancellationToken`] and fails the run.

mod pool;
mod retry;
mod worker;

pub use pool::{PoolCoordinator, ResultCollector};
pub use retry::{RetryBudget, RetryPolicy};
pub use worker::DeviceWorker;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::BackendSet;
use crate::config::{Config, ConfigError};
use crate::device::{DeviceId, DevicePool, PoolId};
use crate::discovery;
use crate::pooling;
use crate::provider::ProviderError;
use crate::queue::WorkItem;
use crate::registry::PluginRegistry;
use crate::report::Reporter;
use crate::rules::{
    Carried, DeviceContext, Pipeline, PipelineError, PoolContext, RunContext, RunLogRule, Scope,
    TestCaseRunContext,
};
use crate::testcase::{TestResult, TestStatus};

/// Errors that stop a run.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Device provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Failed to load the suite for pool {pool}: {source:#}")]
    Suite {
        pool: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Another pool failed and the run was cancelled.
    #[error("Run aborted")]
    Aborted,
}

/// What one device did during the run.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub device: DeviceId,
    /// Attempts this device finished, retried ones included.
    pub executed: usize,
    /// Why the device stopped taking work early, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired: Option<String>,
}

impl DeviceSummary {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            executed: 0,
            retired: None,
        }
    }

    pub fn with_retired(mut self, reason: impl Into<String>) -> Self {
        self.retired = Some(reason.into());
        self
    }
}

impl Carried for DeviceSummary {
    type Identity = DeviceId;

    fn identity(&self) -> DeviceId {
        self.device.clone()
    }
}

/// The results of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolResult {
    pub pool: PoolId,
    /// Exactly one final result per work item.
    pub results: Vec<TestResult>,
    /// Failed attempts that were superseded by a retry.
    pub retried_attempts: Vec<TestResult>,
    /// Items no device could take; also present in `results` as ERROR.
    pub unreachable: usize,
    pub devices: Vec<DeviceSummary>,
}

impl PoolResult {
    /// A pool that has produced nothing yet.
    pub fn new(pool: PoolId) -> Self {
        Self {
            pool,
            results: Vec::new(),
            retried_attempts: Vec::new(),
            unreachable: 0,
            devices: Vec::new(),
        }
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.results.iter().filter(|r| r.status() == status).count()
    }
}

impl Carried for PoolResult {
    type Identity = PoolId;

    fn identity(&self) -> PoolId {
        self.pool.clone()
    }
}

/// Aggregated results of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub pools: Vec<PoolResult>,
    #[serde(rename = "duration_secs", serialize_with = "as_secs")]
    pub duration: Duration,
    pub ignore_failures: bool,
    pub retries_used: usize,
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl RunResult {
    /// Final results of every pool.
    pub fn results(&self) -> impl Iterator<Item = &TestResult> {
        self.pools.iter().flat_map(|p| p.results.iter())
    }

    pub fn total(&self) -> usize {
        self.pools.iter().map(|p| p.results.len()).sum()
    }

    pub fn passed(&self) -> usize {
        self.count(|s| s == TestStatus::Pass)
    }

    pub fn failed(&self) -> usize {
        self.count(|s| s == TestStatus::Fail)
    }

    pub fn errors(&self) -> usize {
        self.count(|s| s == TestStatus::Error)
    }

    /// IGNORED and ASSUMPTION_FAILED results.
    pub fn ignored(&self) -> usize {
        self.count(|s| matches!(s, TestStatus::Ignored | TestStatus::AssumptionFailed))
    }

    fn count(&self, matches: impl Fn(TestStatus) -> bool) -> usize {
        self.results().filter(|r| matches(r.status())).count()
    }

    /// Returns `true` if no FAIL or ERROR result remains, or failures are
    /// ignored.
    ///
    /// # Example
    ///
    /// ```
    /// use poolrun::orchestrator::RunResult;
    /// use std::time::Duration;
    ///
    /// let result = RunResult {
    ///     run_id: uuid::Uuid::nil(),
    ///     pools: vec![],
    ///     duration: Duration::from_secs(1),
    ///     ignore_failures: false,
    ///     retries_used: 0,
    /// };
    ///
    /// assert!(result.success());
    /// assert_eq!(result.exit_code(), 0);
    /// ```
    pub fn success(&self) -> bool {
        self.ignore_failures || self.failed() + self.errors() == 0
    }

    /// Returns an appropriate process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

impl Carried for RunResult {
    type Identity = Uuid;

    fn identity(&self) -> Uuid {
        self.run_id
    }
}

/// The prepared work of one pool.
#[derive(Debug, Clone)]
pub struct PoolPlan {
    pub pool: DevicePool,
    pub items: Vec<WorkItem>,
}

/// Everything resolved before scheduling starts.
pub struct RunPlan {
    pub context: Arc<RunContext>,
    pub backends: Arc<BackendSet>,
    pub pools: Vec<PoolPlan>,
}

/// The top-level component that ties together the device provider, the
/// suite, the backends, the rules and a [`Reporter`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use poolrun::config::load_config;
/// use poolrun::orchestrator::Orchestrator;
/// use poolrun::registry::PluginRegistry;
/// use poolrun::report::NullReporter;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = load_config(std::path::Path::new("poolrun.toml"))?;
///     let orchestrator =
///         Orchestrator::new(config, PluginRegistry::with_builtins(), Arc::new(NullReporter));
///
///     let result = orchestrator.run().await?;
///     std::process::exit(result.exit_code());
/// }
/// ```
pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<PluginRegistry>,
    reporter: Arc<dyn Reporter>,
}

impl Orchestrator {
    pub fn new(config: Config, registry: PluginRegistry, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            reporter,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validates the configuration, lists the devices and partitions them
    /// into pools.
    pub async fn discover_pools(&self) -> Result<Vec<DevicePool>, SchedulerError> {
        self.config.validate()?;
        self.registry.validate(&self.config)?;

        let provider = self.registry.device_provider(&self.config.devices)?;
        let devices = provider.devices().await?;
        info!("{} reported {} device(s)", provider.name(), devices.len());

        Ok(pooling::partition(devices, &self.config.pooling)?)
    }

    /// Resolves pools, suites and backends, and instantiates every
    /// configured rule once so that parameter errors surface now.
    pub async fn plan(&self) -> Result<RunPlan, SchedulerError> {
        let pools = self.discover_pools().await?;

        let mut backends = BackendSet::new();
        for entry in &self.config.backends {
            backends.push(self.registry.backend(entry)?);
        }

        let context = Arc::new(RunContext::new(Arc::clone(&self.config)));
        self.registry.run_rules(&context, &self.config.rules.run)?;

        let loader = discovery::loader_for(&self.config.suite);
        let mut plans = Vec::with_capacity(pools.len());
        for pool in pools {
            let pool_ctx = PoolContext::new(Arc::clone(&context), pool.clone());
            self.registry.pool_rules(&pool_ctx, &self.config.rules.pool)?;

            let mut items = loader
                .load(&pool)
                .await
                .map_err(|source| SchedulerError::Suite {
                    pool: pool.id().to_string(),
                    source,
                })?;
            for rule in self.registry.test_case_rules(&pool_ctx, &self.config.rules.test_case)? {
                let before = items.len();
                items = rule.apply(&pool_ctx, items);
                debug!("[{}] {}: {} -> {} item(s)", pool.id(), rule.name(), before, items.len());
            }
            let items = discovery::prepare(&pool, items, &backends)?;

            self.preflight(Arc::new(pool_ctx), &items)?;
            info!("Pool {}: {} device(s), {} test(s)", pool.id(), pool.len(), items.len());
            plans.push(PoolPlan { pool, items });
        }

        Ok(RunPlan {
            context,
            backends: Arc::new(backends),
            pools: plans,
        })
    }

    fn preflight(&self, pool_ctx: Arc<PoolContext>, items: &[WorkItem]) -> Result<(), ConfigError> {
        let Some(device) = pool_ctx.pool().devices().first().cloned() else {
            return Ok(());
        };
        let device_ctx = Arc::new(DeviceContext::new(pool_ctx, device));
        self.registry.device_rules(&device_ctx, &self.config.rules.device)?;

        if let Some(item) = items.first() {
            let attempt = TestCaseRunContext::new(device_ctx, item.clone());
            self.registry.test_case_run_rules(&attempt, &self.config.rules.test_case_run)?;
        }
        Ok(())
    }

    /// Plans and executes the run.
    pub async fn run(&self) -> Result<RunResult, SchedulerError> {
        let plan = self.plan().await?;
        self.execute(plan).await
    }

    /// Executes a prepared plan, all pools concurrently.
    ///
    /// Must be called from a multi-threaded runtime.
    pub async fn execute(&self, plan: RunPlan) -> Result<RunResult, SchedulerError> {
        let started = Instant::now();
        let RunPlan {
            context,
            backends,
            pools,
        } = plan;

        let rules = self.registry.run_rules(&context, &self.config.rules.run)?;
        let pipeline = Pipeline::new(Scope::Run).with_rule(RunLogRule).with_rules(rules);
        let mut entered = pipeline.enter(&context).await;
        if let Some(failure) = entered.take_failure() {
            let nothing = self.run_result(&context, Vec::new(), started, 0);
            pipeline.release(&context, nothing, &entered).await;
            return Err(failure.into());
        }

        self.reporter.on_run_start(&pools).await;

        let budget = Arc::new(RetryBudget::new(self.config.retry.total_allowed_retry_quota));
        let retry = RetryPolicy::new(&self.config.retry, Arc::clone(&budget));
        let cancel = CancellationToken::new();
        let outcomes: Mutex<Vec<Result<PoolResult, SchedulerError>>> = Mutex::new(Vec::new());

        tokio_scoped::scope(|scope| {
            for plan in pools {
                let coordinator = PoolCoordinator::new(
                    Arc::new(PoolContext::new(Arc::clone(&context), plan.pool)),
                    plan.items,
                    Arc::clone(&self.registry),
                    Arc::clone(&backends),
                    retry.clone(),
                    Arc::clone(&self.reporter),
                    cancel.clone(),
                );
                let outcomes = &outcomes;
                scope.spawn(async move {
                    let outcome = coordinator.run().await;
                    outcomes
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(outcome);
                });
            }
        });

        let mut pools = Vec::new();
        let mut failure = None;
        for outcome in outcomes.into_inner().unwrap_or_else(PoisonError::into_inner) {
            match outcome {
                Ok(pool) => pools.push(pool),
                // The error that caused the cancellation wins over the
                // pools that merely observed it.
                Err(SchedulerError::Aborted) => {
                    failure.get_or_insert(SchedulerError::Aborted);
                }
                Err(e) => {
                    if matches!(failure, None | Some(SchedulerError::Aborted)) {
                        failure = Some(e);
                    }
                }
            }
        }
        pools.sort_by(|a, b| a.pool.cmp(&b.pool));
        let result = self.run_result(&context, pools, started, budget.used());
        if let Some(e) = failure {
            pipeline.release(&context, result, &entered).await;
            return Err(e);
        }
        let result = pipeline.unwind(&context, result, &entered).await?;

        self.reporter.on_run_complete(&result).await;
        Ok(result)
    }

    fn run_result(
        &self,
        context: &RunContext,
        pools: Vec<PoolResult>,
        started: Instant,
        retries_used: usize,
    ) -> RunResult {
        RunResult {
            run_id: context.run_id(),
            pools,
            duration: started.elapsed(),
            ignore_failures: self.config.run.ignore_failures,
            retries_used,
        }
    }
}
