//! poolrun: a retry-aware parallel test scheduler for pools of devices.
//!
//! Devices reported by a provider are partitioned into pools. Every pool
//! runs the whole suite: its devices pull work items from one shared queue,
//! each device taking only the items it is allowed to run, and failed
//! attempts are re-offered to the queue under per-test and run-wide retry
//! quotas. Pluggable rules wrap the run, every pool, every device and every
//! attempt.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Providers** ([`provider`]): list the available devices
//! - **Pooling** ([`pooling`]): partition devices into pools
//! - **Discovery** ([`discovery`]): load the suite and prepare work items
//! - **Queue** ([`queue`]): the per-pool work queue with its termination protocol
//! - **Rules** ([`rules`]): before/after hooks at run, pool, device and attempt scope
//! - **Backends** ([`backend`]): run one test on one device
//! - **Orchestrator** ([`orchestrator`]): pool coordinators, device workers, retries
//! - **Registry** ([`registry`]): the closed set of pluggable components
//! - **Report** ([`report`]): console, JSON and JUnit output
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use poolrun::{Orchestrator, PluginRegistry, load_config};
//! use poolrun::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("poolrun.toml"))?;
//!     let orchestrator = Orchestrator::new(
//!         config,
//!         PluginRegistry::with_builtins(),
//!         Arc::new(ConsoleReporter::new(false)),
//!     );
//!     let result = orchestrator.run().await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod backend;
pub mod config;
pub mod device;
pub mod discovery;
pub mod orchestrator;
pub mod pooling;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod report;
pub mod rules;
pub mod testcase;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use device::{Device, DeviceId, DevicePool, PoolId};
pub use orchestrator::{Orchestrator, RunResult, SchedulerError};
pub use queue::{WorkItem, WorkQueue};
pub use registry::PluginRegistry;
pub use report::Reporter;
pub use testcase::{TestCase, TestResult, TestStatus};
