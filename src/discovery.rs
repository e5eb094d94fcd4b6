//! Suite loading and work item preparation.
//!
//! Loading turns the configured suite into the [`WorkItem`]s available on
//! one pool. Preparation then decides, for every item and every device of
//! the pool, which backends can run it:
//!
//! ```text
//! ┌──────────────┐  load(pool)  ┌──────────────┐  TestCaseRules  ┌──────────────┐
//! │ SuiteConfig  │ ───────────► │ Vec<WorkItem>│ ──────────────► │ Vec<WorkItem>│
//! └──────────────┘              └──────────────┘                 └──────┬───────┘
//!                                                                       │ prepare()
//!                                                                       ▼
//!                                      items with backend assignments and
//!                                      unsupported devices excluded
//! ```
//!
//! # Suite Sources
//!
//! | Source | Config | Description |
//! |--------|--------|-------------|
//! | [`InlineSuite`] | `type = "inline"` | Tests listed in the configuration |
//! | [`FileSuite`] | `type = "file"` | A JSON array of test descriptors |
//!
//! A descriptor's `only_on` / `not_on` lists become the item's allow and
//! deny lists. Tests that cannot run on any device of a pool because of
//! those lists are simply not part of that pool's suite.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::backend::BackendSet;
use crate::config::{ConfigError, SuiteConfig, TestDescriptor};
use crate::device::{DeviceId, DevicePool};
use crate::queue::{BackendAssignments, WorkItem};

/// Produces the work items available on a pool.
#[async_trait]
pub trait SuiteLoader: Send + Sync {
    async fn load(&self, pool: &DevicePool) -> anyhow::Result<Vec<WorkItem>>;
}

/// Tests listed inline in the configuration.
#[derive(Debug, Clone)]
pub struct InlineSuite {
    tests: Vec<TestDescriptor>,
}

impl InlineSuite {
    pub fn new(tests: Vec<TestDescriptor>) -> Self {
        Self { tests }
    }
}

#[async_trait]
impl SuiteLoader for InlineSuite {
    async fn load(&self, pool: &DevicePool) -> anyhow::Result<Vec<WorkItem>> {
        Ok(items_for_pool(&self.tests, pool))
    }
}

/// Tests listed in a JSON file.
#[derive(Debug, Clone)]
pub struct FileSuite {
    path: PathBuf,
}

impl FileSuite {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SuiteLoader for FileSuite {
    async fn load(&self, pool: &DevicePool) -> anyhow::Result<Vec<WorkItem>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read suite file: {}", self.path.display()))?;
        let tests: Vec<TestDescriptor> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse suite file: {}", self.path.display()))?;
        Ok(items_for_pool(&tests, pool))
    }
}

/// Creates the loader for the configured suite source.
pub fn loader_for(config: &SuiteConfig) -> Box<dyn SuiteLoader> {
    match config {
        SuiteConfig::Inline { tests } => Box::new(InlineSuite::new(tests.clone())),
        SuiteConfig::File { path } => Box::new(FileSuite::new(path.clone())),
    }
}

fn items_for_pool(tests: &[TestDescriptor], pool: &DevicePool) -> Vec<WorkItem> {
    tests
        .iter()
        .filter_map(|descriptor| {
            let item = WorkItem::new(descriptor.test.clone())
                .with_included(descriptor.only_on.iter().map(|s| DeviceId::new(s.as_str())))
                .with_excluded(descriptor.not_on.iter().map(|s| DeviceId::new(s.as_str())));
            if pool.device_ids().any(|d| item.is_compatible_with(d)) {
                Some(item)
            } else {
                debug!("[{}] {} is not available on this pool", pool.id(), descriptor.test);
                None
            }
        })
        .collect()
}

/// Collapses repeated test identities (first wins), then records the
/// supporting backends of every (device, item) pair and excludes devices no
/// backend supports.
///
/// An item left without any compatible device is a configuration error.
pub fn prepare(
    pool: &DevicePool,
    items: Vec<WorkItem>,
    backends: &BackendSet,
) -> Result<Vec<WorkItem>, ConfigError> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            let first = seen.insert(item.test().clone());
            if !first {
                warn!("[{}] dropping duplicate test {}", pool.id(), item.test());
            }
            first
        })
        .map(|item| {
            let mut assignments = BackendAssignments::new();
            let mut unsupported = Vec::new();
            for device in pool.devices() {
                let supporting = backends.supporting(device, item.test());
                if supporting.is_empty() {
                    unsupported.push(device.id().clone());
                } else {
                    assignments.insert(device.id().clone(), supporting);
                }
            }

            let item = item.with_excluded(unsupported).with_backends(assignments);
            if pool.device_ids().any(|d| item.is_compatible_with(d)) {
                Ok(item)
            } else {
                Err(ConfigError::NoCompatibleDevice {
                    pool: pool.id().to_string(),
                    test: item.test().to_string(),
                })
            }
        })
        .collect()
}
