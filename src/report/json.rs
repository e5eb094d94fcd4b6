//! Machine-readable run results.
//!
//! Writes the whole [`RunResult`] as JSON, including the per-device
//! summaries and the attempts that were superseded by retries:
//!
//! ```json
//! {
//!   "run_id": "6f1c...",
//!   "summary": { "total": 20, "passed": 19, "failed": 1, "errors": 0, "ignored": 0, "success": false },
//!   "pools": [{ "pool": "omni", "results": [...], "retried_attempts": [...], "unreachable": 0, "devices": [...] }],
//!   "duration_secs": 12.5,
//!   "ignore_failures": false,
//!   "retries_used": 1
//! }
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

use super::Reporter;
use crate::orchestrator::{PoolPlan, RunResult};
use crate::testcase::TestResult;

#[derive(Serialize)]
struct Summary {
    total: usize,
    passed: usize,
    failed: usize,
    errors: usize,
    ignored: usize,
    success: bool,
}

#[derive(Serialize)]
struct Document<'a> {
    summary: Summary,
    #[serde(flatten)]
    run: &'a RunResult,
}

/// Reporter that writes `results.json` when the run completes.
pub struct JsonReporter {
    output_path: PathBuf,
}

impl JsonReporter {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }

    pub fn render(result: &RunResult) -> serde_json::Result<String> {
        let document = Document {
            summary: Summary {
                total: result.total(),
                passed: result.passed(),
                failed: result.failed(),
                errors: result.errors(),
                ignored: result.ignored(),
                success: result.success(),
            },
            run: result,
        };
        serde_json::to_string_pretty(&document)
    }

    async fn write(&self, result: &RunResult) -> anyhow::Result<()> {
        let json = Self::render(result)?;
        if let Some(parent) = self.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.output_path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn on_run_start(&self, _pools: &[PoolPlan]) {}

    async fn on_test_complete(&self, _result: &TestResult) {}

    async fn on_run_complete(&self, result: &RunResult) {
        match self.write(result).await {
            Ok(()) => info!("JSON results written to: {}", self.output_path.display()),
            Err(e) => error!("Failed to write {}: {:#}", self.output_path.display(), e),
        }
    }
}
