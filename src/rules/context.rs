//! Scope contexts handed to rules and backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::device::{Device, DevicePool};
use crate::queue::WorkItem;
use crate::testcase::{Artifact, ResultIdentity};

/// Run-wide context.
#[derive(Debug)]
pub struct RunContext {
    run_id: Uuid,
    config: Arc<Config>,
    output_dir: PathBuf,
    started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(config: Arc<Config>) -> Self {
        let output_dir = config.run.output_dir();
        Self {
            run_id: Uuid::new_v4(),
            config,
            output_dir,
            started_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Expanded output directory.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Context of one device pool.
#[derive(Debug)]
pub struct PoolContext {
    run: Arc<RunContext>,
    pool: DevicePool,
}

impl PoolContext {
    pub fn new(run: Arc<RunContext>, pool: DevicePool) -> Self {
        Self { run, pool }
    }

    pub fn run(&self) -> &RunContext {
        &self.run
    }

    pub fn pool(&self) -> &DevicePool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        self.run.config()
    }
}

/// Context of one device worker.
#[derive(Debug)]
pub struct DeviceContext {
    pool: Arc<PoolContext>,
    device: Device,
}

impl DeviceContext {
    pub fn new(pool: Arc<PoolContext>, device: Device) -> Self {
        Self { pool, device }
    }

    pub fn pool_context(&self) -> &PoolContext {
        &self.pool
    }

    pub fn pool(&self) -> &DevicePool {
        self.pool.pool()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &Config {
        self.pool.config()
    }
}

/// Context of one attempt at one test on one device.
#[derive(Debug)]
pub struct TestCaseRunContext {
    device: Arc<DeviceContext>,
    item: WorkItem,
    artifacts: ArtifactSink,
}

impl TestCaseRunContext {
    /// Creates the context, placing artifacts under
    /// `<output>/artifacts/<pool>/<device>/<test>/attempt-<n>`.
    pub fn new(device: Arc<DeviceContext>, item: WorkItem) -> Self {
        let root = device
            .pool_context()
            .run()
            .output_dir()
            .join("artifacts")
            .join(device.pool().id().as_str())
            .join(device.device().id().as_str())
            .join(item.test().safe_name())
            .join(format!("attempt-{}", item.failure_count()));
        Self {
            device,
            item,
            artifacts: ArtifactSink::new(root),
        }
    }

    pub fn device_context(&self) -> &DeviceContext {
        &self.device
    }

    pub fn device(&self) -> &Device {
        self.device.device()
    }

    pub fn pool(&self) -> &DevicePool {
        self.device.pool()
    }

    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    pub fn artifacts(&self) -> &ArtifactSink {
        &self.artifacts
    }

    pub fn config(&self) -> &Config {
        self.device.config()
    }

    /// The identity every result of this attempt must carry.
    pub fn expected_identity(&self) -> ResultIdentity {
        ResultIdentity {
            pool: self.pool().id().clone(),
            device: self.device().id().clone(),
            test: self.item.test().clone(),
        }
    }
}

/// Destination for files produced by one test attempt.
///
/// The directory is created on first write.
#[derive(Debug, Clone)]
pub struct ArtifactSink {
    root: PathBuf,
}

impl ArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where an artifact called `name` would be written.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Writes `contents` as artifact `name`.
    pub async fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> std::io::Result<Artifact> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(name);
        tokio::fs::write(&path, contents).await?;
        Ok(Artifact {
            name: name.to_string(),
            path,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;

    #[tokio::test]
    async fn test_artifact_layout() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = attempt(dir.path(), test_item().successor());

        let artifact = ctx.artifacts().write("log.txt", "hello").await.unwrap();
        assert_eq!(
            artifact.path,
            dir.path()
                .join("artifacts/pool/dev-1/com.example.LoginTest#testValid/attempt-1/log.txt")
        );
        assert_eq!(std::fs::read_to_string(&artifact.path).unwrap(), "hello");
    }

    #[test]
    fn test_expected_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = attempt(dir.path(), test_item());
        let identity = ctx.expected_identity();
        assert_eq!(identity.device.as_str(), "dev-1");
        assert_eq!(identity.pool.as_str(), "pool");
    }
}
