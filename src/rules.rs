//! Scoped rule pipelines.
//!
//! Rules are before/after hooks composed into nested pipelines, one per
//! scope. Each scope pairs a context (what the rule may look at) with the
//! value carried back up through the unwind (what the rule may annotate):
//!
//! | Scope | Context | Carried value |
//! |-------|---------|---------------|
//! | run | [`RunContext`] | [`RunResult`](crate::orchestrator::RunResult) |
//! | pool | [`PoolContext`] | [`PoolResult`](crate::orchestrator::PoolResult) |
//! | device | [`DeviceContext`] | [`DeviceSummary`](crate::orchestrator::DeviceSummary) |
//! | test-case-run | [`TestCaseRunContext`] | [`TestResult`](crate::testcase::TestResult) |
//!
//! # Ordering
//!
//! ```text
//!   enter:   R1.before → R2.before → R3.before ─┐
//!                                               │ body (backend / workers)
//!   unwind:  R1.after  ← R2.after  ← R3.after  ←┘
//! ```
//!
//! Only rules whose `before` completed get their `after` called. If `R2.before`
//! fails, `R3` is never entered and the unwind runs `R1.after` alone.
//!
//! # Failure Semantics
//!
//! - A failed `before` stops the descent. What that means for the scope is
//!   decided by the caller (retire the device, record an ERROR result, ...).
//! - A failed `after` is logged and the value it was given is kept; the
//!   remaining `after` stages still run.
//! - A scope that ends early (failed `before`, fatal error in its body)
//!   still unwinds the stages it entered, through [`Pipeline::release`].
//! - An `after` that changes the identity of the carried value is a fatal
//!   programming error: [`PipelineError::IdentityViolation`].

mod builtin;
mod context;
mod filter;
mod hook;

pub use builtin::{
    CaptureTraceRule, DeviceLogRule, PoolLogRule, RunLogRule, TagRetryRule, TimingRule,
};
pub use context::{ArtifactSink, DeviceContext, PoolContext, RunContext, TestCaseRunContext};
#[cfg(test)]
pub(crate) use context::fixtures;
pub use filter::{FilterRule, ShuffleRule, TestCaseRule};
pub use hook::{HookRule, HookVars};
pub(crate) use hook::substitute;

use std::fmt;

use async_trait::async_trait;
use tracing::warn;

/// Rule scopes, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Run,
    Pool,
    Device,
    TestCaseRun,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Run => "run",
            Scope::Pool => "pool",
            Scope::Device => "device",
            Scope::TestCaseRun => "test-case-run",
        })
    }
}

/// A value carried up through a pipeline unwind.
///
/// The identity of a carried value must survive every `after` stage.
pub trait Carried: Clone + Send + Sync + 'static {
    type Identity: PartialEq + fmt::Display + Send;

    fn identity(&self) -> Self::Identity;

    /// Normalizes the value once, before the first `after` stage runs.
    fn settle(self) -> Self {
        self
    }
}

impl Carried for crate::testcase::TestResult {
    type Identity = crate::testcase::ResultIdentity;

    fn identity(&self) -> Self::Identity {
        crate::testcase::TestResult::identity(self)
    }

    fn settle(self) -> Self {
        crate::testcase::TestResult::settle(self)
    }
}

/// A before/after hook bound to one scope.
///
/// `after` receives the carried value by value and returns the (possibly
/// annotated) value to hand to the next outer stage.
#[async_trait]
pub trait Rule<C, R>: Send + Sync
where
    C: Sync,
    R: Carried,
{
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    async fn before(&self, _ctx: &C) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after(&self, _ctx: &C, carried: R) -> anyhow::Result<R> {
        Ok(carried)
    }
}

/// Error produced by a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A `before` stage failed; the scope was not fully entered.
    #[error("{scope} rule '{rule}' failed before: {source:#}")]
    Before {
        scope: Scope,
        rule: String,
        #[source]
        source: anyhow::Error,
    },

    /// A stage changed the identity of the carried value.
    #[error("{scope} stage '{rule}' changed result identity from {expected} to {actual}")]
    IdentityViolation {
        scope: Scope,
        rule: String,
        expected: String,
        actual: String,
    },
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::IdentityViolation { .. })
    }
}

/// How far a pipeline got on the way down.
#[derive(Debug)]
pub struct Entered {
    depth: usize,
    failure: Option<PipelineError>,
}

impl Entered {
    /// Number of stages whose `before` completed.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failure(&self) -> Option<&PipelineError> {
        self.failure.as_ref()
    }

    pub fn take_failure(&mut self) -> Option<PipelineError> {
        self.failure.take()
    }
}

/// An ordered list of rules for one scope.
pub struct Pipeline<C, R> {
    scope: Scope,
    stages: Vec<Box<dyn Rule<C, R>>>,
}

impl<C, R> Pipeline<C, R>
where
    C: Sync,
    R: Carried,
{
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            stages: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: impl Rule<C, R> + 'static) -> Self {
        self.stages.push(Box::new(rule));
        self
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = Box<dyn Rule<C, R>>>) -> Self {
        self.stages.extend(rules);
        self
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs `before` on every stage in order, stopping at the first failure.
    pub async fn enter(&self, ctx: &C) -> Entered {
        for (depth, stage) in self.stages.iter().enumerate() {
            if let Err(source) = stage.before(ctx).await {
                return Entered {
                    depth,
                    failure: Some(PipelineError::Before {
                        scope: self.scope,
                        rule: stage.name().to_string(),
                        source,
                    }),
                };
            }
        }
        Entered {
            depth: self.stages.len(),
            failure: None,
        }
    }

    /// Settles `carried`, then runs `after` on every entered stage in
    /// reverse order.
    ///
    /// A stage that changes the identity is reported once every entered
    /// stage has been unwound; the stages outside it receive the value it
    /// was given.
    pub async fn unwind(&self, ctx: &C, carried: R, entered: &Entered) -> Result<R, PipelineError> {
        let mut carried = carried.settle();
        let expected = carried.identity();
        let mut violation = None;

        for stage in self.stages[..entered.depth].iter().rev() {
            match stage.after(ctx, carried.clone()).await {
                Ok(annotated) => {
                    let actual = annotated.identity();
                    if actual != expected {
                        violation.get_or_insert(PipelineError::IdentityViolation {
                            scope: self.scope,
                            rule: stage.name().to_string(),
                            expected: expected.to_string(),
                            actual: actual.to_string(),
                        });
                        continue;
                    }
                    carried = annotated;
                }
                Err(e) => {
                    warn!(
                        "{} rule '{}' failed after, keeping previous value: {:#}",
                        self.scope,
                        stage.name(),
                        e
                    );
                }
            }
        }

        match violation {
            Some(e) => Err(e),
            None => Ok(carried),
        }
    }

    /// Unwinds the entered stages of a scope that is being abandoned.
    ///
    /// `carried` stands in for the value the scope would have produced.
    /// The caller already holds the error that ends the scope, so unwind
    /// errors are only logged.
    pub async fn release(&self, ctx: &C, carried: R, entered: &Entered) {
        if let Err(e) = self.unwind(ctx, carried, entered).await {
            warn!("{} pipeline failed while unwinding: {}", self.scope, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    struct Value {
        id: u32,
        notes: Vec<String>,
    }

    impl Carried for Value {
        type Identity = u32;

        fn identity(&self) -> u32 {
            self.id
        }
    }

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: String,
        log: Log,
        fail_before: bool,
        fail_after: bool,
        rewrite_id: bool,
    }

    impl Recording {
        fn new(name: &str, log: &Log) -> Self {
            Self {
                name: name.to_string(),
                log: Arc::clone(log),
                fail_before: false,
                fail_after: false,
                rewrite_id: false,
            }
        }
    }

    #[async_trait]
    impl Rule<(), Value> for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        async fn before(&self, _ctx: &()) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("{}.before", self.name));
            if self.fail_before {
                anyhow::bail!("refused");
            }
            Ok(())
        }

        async fn after(&self, _ctx: &(), mut carried: Value) -> anyhow::Result<Value> {
            self.log.lock().unwrap().push(format!("{}.after", self.name));
            if self.fail_after {
                carried.notes.push("lost".to_string());
                anyhow::bail!("broken");
            }
            if self.rewrite_id {
                carried.id += 1;
            }
            carried.notes.push(self.name.clone());
            Ok(carried)
        }
    }

    fn value() -> Value {
        Value {
            id: 7,
            notes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_before_in_order_after_in_reverse() {
        let log = Log::default();
        let pipeline = Pipeline::new(Scope::Device)
            .with_rule(Recording::new("R1", &log))
            .with_rule(Recording::new("R2", &log))
            .with_rule(Recording::new("R3", &log));

        let entered = pipeline.enter(&()).await;
        assert!(entered.is_complete());
        let out = pipeline.unwind(&(), value(), &entered).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["R1.before", "R2.before", "R3.before", "R3.after", "R2.after", "R1.after"]
        );
        assert_eq!(out.notes, vec!["R3", "R2", "R1"]);
    }

    #[tokio::test]
    async fn test_failed_before_unwinds_only_entered_stages() {
        let log = Log::default();
        let mut r2 = Recording::new("R2", &log);
        r2.fail_before = true;
        let pipeline = Pipeline::new(Scope::Device)
            .with_rule(Recording::new("R1", &log))
            .with_rule(r2)
            .with_rule(Recording::new("R3", &log));

        let mut entered = pipeline.enter(&()).await;
        assert_eq!(entered.depth(), 1);
        let failure = entered.take_failure().unwrap();
        assert!(failure.to_string().contains("R2"));
        assert!(!failure.is_fatal());

        pipeline.unwind(&(), value(), &entered).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["R1.before", "R2.before", "R1.after"]);
    }

    #[tokio::test]
    async fn test_failed_after_keeps_previous_value() {
        let log = Log::default();
        let mut r2 = Recording::new("R2", &log);
        r2.fail_after = true;
        let pipeline = Pipeline::new(Scope::TestCaseRun)
            .with_rule(Recording::new("R1", &log))
            .with_rule(r2)
            .with_rule(Recording::new("R3", &log));

        let entered = pipeline.enter(&()).await;
        let out = pipeline.unwind(&(), value(), &entered).await.unwrap();

        assert_eq!(out.notes, vec!["R3", "R1"]);
        assert_eq!(log.lock().unwrap().last().unwrap(), "R1.after");
    }

    #[tokio::test]
    async fn test_identity_change_is_fatal() {
        let log = Log::default();
        let mut rogue = Recording::new("rogue", &log);
        rogue.rewrite_id = true;
        let pipeline = Pipeline::new(Scope::TestCaseRun)
            .with_rule(Recording::new("outer", &log))
            .with_rule(rogue);

        let entered = pipeline.enter(&()).await;
        let err = pipeline.unwind(&(), value(), &entered).await.unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(
            &err,
            PipelineError::IdentityViolation { rule, expected, actual, .. }
                if rule == "rogue" && expected == "7" && actual == "8"
        ));
        // The outer stage still unwinds.
        assert_eq!(log.lock().unwrap().last().unwrap(), "outer.after");
    }

    #[tokio::test]
    async fn test_release_unwinds_and_swallows_violation() {
        let log = Log::default();
        let mut rogue = Recording::new("rogue", &log);
        rogue.rewrite_id = true;
        let mut refusing = Recording::new("refusing", &log);
        refusing.fail_before = true;
        let pipeline = Pipeline::new(Scope::Pool)
            .with_rule(Recording::new("outer", &log))
            .with_rule(rogue)
            .with_rule(refusing);

        let entered = pipeline.enter(&()).await;
        assert!(!entered.is_complete());
        pipeline.release(&(), value(), &entered).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer.before", "rogue.before", "refusing.before", "rogue.after", "outer.after"]
        );
    }

    #[tokio::test]
    async fn test_unwind_settles_test_results() {
        use crate::device::{DeviceId, PoolId};
        use crate::testcase::{TestCase, TestResult, TestStatus};

        let pipeline: Pipeline<(), TestResult> = Pipeline::new(Scope::TestCaseRun);
        let entered = pipeline.enter(&()).await;
        let unknown = TestResult::new(
            PoolId::new("p"),
            DeviceId::new("d"),
            TestCase::new("pkg", "C", "m"),
            TestStatus::Unknown,
        );

        let settled = pipeline.unwind(&(), unknown, &entered).await.unwrap();
        assert_eq!(settled.status(), TestStatus::Error);
    }
}
