//! Pool-scope rules that reshape the suite before it is queued.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use super::PoolContext;
use crate::config::PluginEntry;
use crate::queue::WorkItem;

/// Transforms or filters the work items of one pool before scheduling.
///
/// Test-case rules run in configuration order, each receiving the output
/// of the previous one.
pub trait TestCaseRule: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, ctx: &PoolContext, items: Vec<WorkItem>) -> Vec<WorkItem>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterParams {
    /// Keep tests whose `pkg.Class#method` matches.
    #[serde(default)]
    include: Option<String>,
    /// Drop tests whose `pkg.Class#method` matches.
    #[serde(default)]
    exclude: Option<String>,
    #[serde(default)]
    include_annotations: Vec<String>,
    #[serde(default)]
    exclude_annotations: Vec<String>,
    #[serde(default)]
    kinds: Vec<String>,
}

/// Keeps tests matching name patterns, annotations and kinds
/// (`builtin.filter`).
///
/// ```toml
/// [[rules.test_case]]
/// type = "builtin.filter"
/// include = "^com\\.example\\.login\\."
/// exclude_annotations = ["Flaky"]
/// ```
#[derive(Debug)]
pub struct FilterRule {
    name: String,
    include: Option<Regex>,
    exclude: Option<Regex>,
    include_annotations: Vec<String>,
    exclude_annotations: Vec<String>,
    kinds: Vec<String>,
}

impl FilterRule {
    pub fn from_params(entry: &PluginEntry) -> anyhow::Result<Self> {
        let params: FilterParams = entry.parse_params()?;
        let include = params.include.as_deref().map(Regex::new).transpose()?;
        let exclude = params.exclude.as_deref().map(Regex::new).transpose()?;
        Ok(Self {
            name: entry.label().to_string(),
            include,
            exclude,
            include_annotations: params.include_annotations,
            exclude_annotations: params.exclude_annotations,
            kinds: params.kinds,
        })
    }

    fn keeps(&self, item: &WorkItem) -> bool {
        let test = item.test();
        let full_name = test.to_string();

        if let Some(include) = &self.include
            && !include.is_match(&full_name)
        {
            return false;
        }
        if let Some(exclude) = &self.exclude
            && exclude.is_match(&full_name)
        {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&test.kind) {
            return false;
        }
        if !self.include_annotations.is_empty()
            && !self.include_annotations.iter().any(|a| test.has_annotation(a))
        {
            return false;
        }
        !self.exclude_annotations.iter().any(|a| test.has_annotation(a))
    }
}

impl TestCaseRule for FilterRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, ctx: &PoolContext, items: Vec<WorkItem>) -> Vec<WorkItem> {
        let before = items.len();
        let kept: Vec<WorkItem> = items.into_iter().filter(|i| self.keeps(i)).collect();
        if kept.len() != before {
            info!(
                "[{}] filter '{}' dropped {} of {} tests",
                ctx.pool().id(),
                self.name,
                before - kept.len(),
                before
            );
        }
        kept
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShuffleParams {
    #[serde(default)]
    seed: Option<u64>,
}

/// Randomizes queue order (`builtin.shuffle`). A fixed `seed` makes the
/// order reproducible.
#[derive(Debug)]
pub struct ShuffleRule {
    seed: Option<u64>,
}

impl ShuffleRule {
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }

    pub fn from_params(entry: &PluginEntry) -> anyhow::Result<Self> {
        let params: ShuffleParams = entry.parse_params()?;
        Ok(Self::new(params.seed))
    }
}

impl TestCaseRule for ShuffleRule {
    fn name(&self) -> &str {
        "builtin.shuffle"
    }

    fn apply(&self, _ctx: &PoolContext, mut items: Vec<WorkItem>) -> Vec<WorkItem> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        items.shuffle(&mut rng);
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DevicePool};
    use crate::rules::fixtures::run_context;
    use crate::testcase::{Annotation, TestCase};

    fn pool_ctx(dir: &std::path::Path) -> PoolContext {
        PoolContext::new(run_context(dir), DevicePool::new("p", vec![Device::new("d")]))
    }

    fn items() -> Vec<WorkItem> {
        vec![
            WorkItem::new(TestCase::new("com.a", "Login", "ok")),
            WorkItem::new(
                TestCase::new("com.a", "Login", "slow").with_annotation(Annotation::new("Flaky")),
            ),
            WorkItem::new(TestCase::new("com.b", "Cart", "add").with_kind("unit")),
        ]
    }

    fn names(items: &[WorkItem]) -> Vec<String> {
        items.iter().map(|i| i.test().method.clone()).collect()
    }

    #[test]
    fn test_filter_by_pattern_and_annotation() {
        let dir = tempfile::tempdir().unwrap();
        let entry = PluginEntry::new("builtin.filter")
            .with_param("include", r"^com\.a\.")
            .with_param("exclude_annotations", vec![toml::Value::from("Flaky")]);
        let rule = FilterRule::from_params(&entry).unwrap();

        let kept = rule.apply(&pool_ctx(dir.path()), items());
        assert_eq!(names(&kept), vec!["ok"]);
    }

    #[test]
    fn test_filter_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let entry = PluginEntry::new("builtin.filter")
            .with_param("kinds", vec![toml::Value::from("unit")]);
        let rule = FilterRule::from_params(&entry).unwrap();

        let kept = rule.apply(&pool_ctx(dir.path()), items());
        assert_eq!(names(&kept), vec!["add"]);
    }

    #[test]
    fn test_filter_rejects_bad_regex() {
        let entry = PluginEntry::new("builtin.filter").with_param("include", "(unclosed");
        assert!(FilterRule::from_params(&entry).is_err());
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = pool_ctx(dir.path());
        let many: Vec<WorkItem> = (0..20)
            .map(|i| WorkItem::new(TestCase::new("p", "C", format!("m{i}"))))
            .collect();

        let a = ShuffleRule::new(Some(42)).apply(&ctx, many.clone());
        let b = ShuffleRule::new(Some(42)).apply(&ctx, many.clone());
        assert_eq!(names(&a), names(&b));
        assert_eq!(a.len(), many.len());
    }
}
