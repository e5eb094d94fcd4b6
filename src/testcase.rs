//! Test cases and test results.
//!
//! A [`TestCase`] is the immutable description of one test. Its identity for
//! equality and hashing is the `(kind, class, method)` triple; everything else
//! is metadata.
//!
//! A [`TestResult`] records one execution of a test case on a device. The
//! *identity* of a result (pool, device, test case) is fixed at construction
//! and has no setters: pipeline stages can only annotate the status, trace,
//! metrics and artifacts, each through a consuming builder method that
//! returns a new value.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, PoolId};

/// An annotation attached to a test (e.g. `@LargeTest`, `@Flaky(reason=..)`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl Annotation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }
}

/// One test, identified by `(kind, class, method)`.
///
/// # Example
///
/// ```
/// use poolrun::testcase::TestCase;
///
/// let a = TestCase::new("com.example", "LoginTest", "testValid").with_property("owner", "auth");
/// let b = TestCase::new("com.other", "LoginTest", "testValid");
///
/// // Package and metadata do not participate in identity.
/// assert_eq!(a, b);
/// assert_eq!(a.to_string(), "com.example.LoginTest#testValid");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub package: String,

    pub class: String,

    pub method: String,

    /// Type tag distinguishing test kinds (instrumentation, unit, ...).
    #[serde(default = "default_kind")]
    pub kind: String,

    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

fn default_kind() -> String {
    TestCase::DEFAULT_KIND.to_string()
}

impl TestCase {
    pub const DEFAULT_KIND: &'static str = "instrumentation";

    pub fn new(
        package: impl Into<String>,
        class: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
            method: method.into(),
            kind: default_kind(),
            properties: BTreeMap::new(),
            annotations: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub fn has_annotation(&self, name: &str) -> bool {
        self.annotations.iter().any(|a| a.name == name)
    }

    /// Fully-qualified class name.
    pub fn qualified_class(&self) -> String {
        if self.package.is_empty() {
            self.class.clone()
        } else {
            format!("{}.{}", self.package, self.class)
        }
    }

    /// A filesystem-safe name for per-test artifact directories.
    pub fn safe_name(&self) -> String {
        format!("{}#{}", self.qualified_class(), self.method)
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' | '#' => c,
                _ => '_',
            })
            .collect()
    }

    /// Compares every field, not just the identity triple.
    pub fn same_as(&self, other: &TestCase) -> bool {
        self.package == other.package
            && self.class == other.class
            && self.method == other.method
            && self.kind == other.kind
            && self.properties == other.properties
            && self.annotations == other.annotations
    }
}

impl PartialEq for TestCase {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.class == other.class && self.method == other.method
    }
}

impl Eq for TestCase {}

impl Hash for TestCase {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.class.hash(state);
        self.method.hash(state);
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.qualified_class(), self.method)
    }
}

/// Outcome of one test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Ignored,
    AssumptionFailed,
    /// Not yet determined. Never survives the pipeline unwind.
    Unknown,
}

impl TestStatus {
    /// FAIL and ERROR are the statuses that are retried and fail a run.
    pub fn is_failure(&self) -> bool {
        matches!(self, TestStatus::Fail | TestStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "PASS",
            TestStatus::Fail => "FAIL",
            TestStatus::Error => "ERROR",
            TestStatus::Ignored => "IGNORED",
            TestStatus::AssumptionFailed => "ASSUMPTION_FAILED",
            TestStatus::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for TestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PASS" | "PASSED" => Ok(TestStatus::Pass),
            "FAIL" | "FAILED" | "FAILURE" => Ok(TestStatus::Fail),
            "ERROR" => Ok(TestStatus::Error),
            "IGNORED" | "SKIPPED" => Ok(TestStatus::Ignored),
            "ASSUMPTION_FAILED" => Ok(TestStatus::AssumptionFailed),
            "UNKNOWN" => Ok(TestStatus::Unknown),
            other => Err(format!("unknown test status '{}'", other)),
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file produced while running a test (log, video, trace dump, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
}

/// The fields of a [`TestResult`] that no pipeline stage may change.
#[derive(Debug, Clone)]
pub struct ResultIdentity {
    pub pool: PoolId,
    pub device: DeviceId,
    pub test: TestCase,
}

impl PartialEq for ResultIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.pool == other.pool && self.device == other.device && self.test.same_as(&other.test)
    }
}

impl fmt::Display for ResultIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.pool, self.device, self.test)
    }
}

/// The result of running one test case on one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pool: PoolId,
    device: DeviceId,
    test: TestCase,
    status: TestStatus,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trace: Option<String>,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
    #[serde(default)]
    artifacts: Vec<Artifact>,
}

impl TestResult {
    pub fn new(pool: PoolId, device: DeviceId, test: TestCase, status: TestStatus) -> Self {
        let now = Utc::now();
        Self {
            pool,
            device,
            test,
            status,
            started_at: now,
            finished_at: now,
            trace: None,
            metrics: BTreeMap::new(),
            artifacts: Vec::new(),
        }
    }

    /// Shorthand for an ERROR result carrying `trace`.
    pub fn error(pool: PoolId, device: DeviceId, test: TestCase, trace: impl Into<String>) -> Self {
        Self::new(pool, device, test, TestStatus::Error).with_trace(trace)
    }

    pub fn pool(&self) -> &PoolId {
        &self.pool
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn test(&self) -> &TestCase {
        &self.test
    }

    pub fn status(&self) -> TestStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    pub fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn duration(&self) -> std::time::Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn identity(&self) -> ResultIdentity {
        ResultIdentity {
            pool: self.pool.clone(),
            device: self.device.clone(),
            test: self.test.clone(),
        }
    }

    pub fn with_status(mut self, status: TestStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn with_timestamps(mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self.finished_at = finished_at;
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Coerces an UNKNOWN status to ERROR.
    pub fn settle(self) -> Self {
        if self.status != TestStatus::Unknown {
            return self;
        }
        let trace = self
            .trace
            .clone()
            .unwrap_or_else(|| "test finished without reporting a status".to_string());
        self.with_status(TestStatus::Error).with_trace(trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn result(status: TestStatus) -> TestResult {
        TestResult::new(
            PoolId::new("p"),
            DeviceId::new("d"),
            TestCase::new("pkg", "C", "m"),
            status,
        )
    }

    #[test]
    fn test_identity_ignores_metadata() {
        let mut set = HashSet::new();
        set.insert(TestCase::new("a", "C", "m").with_property("k", "v"));
        assert!(!set.insert(TestCase::new("b", "C", "m")));
        assert!(set.insert(TestCase::new("a", "C", "m").with_kind("unit")));
    }

    #[test]
    fn test_same_as_compares_everything() {
        let a = TestCase::new("a", "C", "m");
        let b = TestCase::new("a", "C", "m").with_property("k", "v");
        assert_eq!(a, b);
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_settle_unknown_becomes_error() {
        let settled = result(TestStatus::Unknown).settle();
        assert_eq!(settled.status(), TestStatus::Error);
        assert!(settled.trace().is_some());

        let kept = result(TestStatus::Fail).settle();
        assert_eq!(kept.status(), TestStatus::Fail);
        assert!(kept.trace().is_none());
    }

    #[test]
    fn test_annotations_keep_identity() {
        let before = result(TestStatus::Fail);
        let identity = before.identity();
        let after = before
            .with_status(TestStatus::Pass)
            .with_metric("duration_ms", 12.0)
            .with_trace("retried");
        assert_eq!(after.identity(), identity);
    }

    #[test]
    fn test_safe_name() {
        let test = TestCase::new("com.x", "Foo$Inner", "test one");
        assert_eq!(test.safe_name(), "com.x.Foo_Inner#test_one");
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("passed".parse::<TestStatus>(), Ok(TestStatus::Pass));
        assert_eq!(" SKIPPED ".parse::<TestStatus>(), Ok(TestStatus::Ignored));
        assert!("maybe".parse::<TestStatus>().is_err());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TestStatus::AssumptionFailed).unwrap();
        assert_eq!(json, "\"ASSUMPTION_FAILED\"");
    }
}
