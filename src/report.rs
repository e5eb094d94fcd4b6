//! Reporting of run progress and results.
//!
//! A [`Reporter`] is told when the run starts, whenever a test reaches its
//! final result, and when the run completes. Retried attempts are not
//! reported individually; they are available on
//! [`PoolResult::retried_attempts`](crate::orchestrator::PoolResult).
//!
//! | Reporter | Output |
//! |----------|--------|
//! | [`ConsoleReporter`] | Progress bar and summary on the terminal |
//! | [`JsonReporter`] | `results.json` with every pool's results |
//! | [`JUnitReporter`] | JUnit XML, one `<testsuite>` per pool |

pub mod json;
pub mod junit;

pub use json::JsonReporter;
pub use junit::JUnitReporter;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::orchestrator::{PoolPlan, RunResult};
use crate::testcase::{TestResult, TestStatus};

/// Trait for reporting test progress and results.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once scheduling is about to start.
    async fn on_run_start(&self, pools: &[PoolPlan]);

    /// Called when a test reaches its final result.
    async fn on_test_complete(&self, result: &TestResult);

    /// Called when all pools are done.
    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _pools: &[PoolPlan]) {}
    async fn on_test_complete(&self, _result: &TestResult) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// Fans every event out to several reporters, in order.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, pools: &[PoolPlan]) {
        for r in &self.reporters {
            r.on_run_start(pools).await;
        }
    }

    async fn on_test_complete(&self, result: &TestResult) {
        for r in &self.reporters {
            r.on_test_complete(result).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for r in &self.reporters {
            r.on_run_complete(result).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn status_label(status: TestStatus) -> console::StyledObject<&'static str> {
        match status {
            TestStatus::Pass => console::style("PASS").green(),
            TestStatus::Fail => console::style("FAIL").red(),
            TestStatus::Error => console::style("ERR ").red().bold(),
            TestStatus::Ignored | TestStatus::AssumptionFailed => console::style("SKIP").yellow(),
            TestStatus::Unknown => console::style("????").dim(),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, pools: &[PoolPlan]) {
        let tests: usize = pools.iter().map(|p| p.items.len()).sum();
        let devices: usize = pools.iter().map(|p| p.pool.len()).sum();
        println!(
            "Running {} test(s) across {} pool(s) and {} device(s)",
            tests,
            pools.len(),
            devices
        );

        let pb = indicatif::ProgressBar::new(tests as u64);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);

        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(pb);
    }

    async fn on_test_complete(&self, result: &TestResult) {
        let line = format!(
            "{} [{}/{}] {}",
            Self::status_label(result.status()),
            result.pool(),
            result.device(),
            result.test()
        );
        let show = self.verbose || result.status().is_failure();

        match self.progress.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(pb) => {
                pb.inc(1);
                if show {
                    pb.println(line);
                }
            }
            None if show => println!("{}", line),
            None => {}
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Some(pb) = self.progress.lock().unwrap_or_else(PoisonError::into_inner).take() {
            pb.finish_and_clear();
        }

        println!();
        println!("Test Results:");
        for pool in &result.pools {
            println!(
                "  {:<16} {} passed, {} failed, {} errors, {} skipped",
                pool.pool,
                console::style(pool.count(TestStatus::Pass)).green(),
                console::style(pool.count(TestStatus::Fail)).red(),
                console::style(pool.count(TestStatus::Error)).red(),
                console::style(pool.count(TestStatus::Ignored) + pool.count(TestStatus::AssumptionFailed))
                    .yellow(),
            );
            for device in pool.devices.iter().filter(|d| d.retired.is_some()) {
                println!(
                    "    {} {}: {}",
                    console::style("retired").yellow(),
                    device.device,
                    device.retired.as_deref().unwrap_or_default()
                );
            }
        }
        println!("  Total:    {}", result.total());
        println!("  Retries:  {}", result.retries_used);
        println!("  Duration: {:?}", result.duration);

        println!();
        if result.failed() + result.errors() == 0 {
            println!("{}", console::style("All tests passed!").green().bold());
            return;
        }
        if result.ignore_failures {
            println!("{}", console::style("Some tests failed (ignored).").yellow().bold());
        } else {
            println!("{}", console::style("Some tests failed.").red().bold());
        }

        println!();
        println!("Failed tests:");
        for r in result.results().filter(|r| r.status().is_failure()) {
            println!("  - {} on {}/{}", r.test(), r.pool(), r.device());
            if let Some(trace) = r.trace()
                && let Some(first) = trace.lines().find(|l| !l.trim().is_empty())
            {
                println!("    {}", console::style(first).dim());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Reporter for Counting {
        async fn on_run_start(&self, _pools: &[PoolPlan]) {}

        async fn on_test_complete(&self, _result: &TestResult) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_run_complete(&self, _result: &RunResult) {}
    }

    #[tokio::test]
    async fn test_multi_reporter_fans_out() {
        let seen = Arc::new(AtomicUsize::new(0));
        let multi = MultiReporter::new()
            .with_reporter(Counting(Arc::clone(&seen)))
            .with_reporter(NullReporter)
            .with_reporter(Counting(Arc::clone(&seen)));
        assert_eq!(multi.len(), 3);

        let result = TestResult::new(
            "p".into(),
            "d".into(),
            crate::testcase::TestCase::new("pkg", "C", "m"),
            TestStatus::Pass,
        );
        multi.on_test_complete(&result).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
