//! Shell command backend (`builtin.shell`).
//!
//! Runs a command template through a shell for every attempt. The template
//! uses the same placeholders as `builtin.hook` at test-case-run scope
//! (`{device}`, `{test}`, `{class}`, `{method}`, `{artifacts}`, ...); the
//! most important ones are also exported as `POOLRUN_*` environment
//! variables.
//!
//! # Outcome
//!
//! | Condition | Status |
//! |-----------|--------|
//! | A stdout line `POOLRUN_STATUS=<STATUS>` | that status (last line wins) |
//! | Exit code 0 | PASS |
//! | Exit code equal to `ignored_exit_code` | IGNORED |
//! | Any other exit code | FAIL |
//! | Killed by a signal | ERROR |
//! | Running longer than `run.output_timeout_secs` | ERROR (timeout) |
//!
//! # Output Listeners
//!
//! Stdout and stderr are read by two listener tasks. When the process exits
//! the listeners get `run.listener_grace_secs` to reach end of stream (a
//! leftover grandchild can hold the pipes open). If they do not, the attempt
//! is reported as an error instead of waiting forever.
//!
//! # Example Configuration
//!
//! ```toml
//! [[backends]]
//! type = "builtin.shell"
//! command = "adb -s {device} shell am instrument -w -e class {class}#{method} com.example.test"
//! kinds = ["instrumentation"]
//! min_platform_version = 26
//! ignored_exit_code = 77
//!
//! [backends.env]
//! ANDROID_HOME = "/opt/android"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinSet;
use tokio_stream::wrappers::SplitStream;
use tracing::{debug, warn};

use super::{BackendError, BackendResult, ExecutionBackend};
use crate::config::PluginEntry;
use crate::device::Device;
use crate::rules::{HookVars, TestCaseRunContext, substitute};
use crate::testcase::{TestCase, TestResult, TestStatus};

/// Prefix of the stdout line a test command may print to report its status.
pub const STATUS_MARKER: &str = "POOLRUN_STATUS=";

/// Lines of output kept in the trace of a failed attempt.
const TRACE_TAIL_LINES: usize = 50;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShellParams {
    command: String,
    #[serde(default = "default_shell")]
    shell: String,
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    kinds: BTreeSet<String>,
    #[serde(default)]
    min_platform_version: Option<u32>,
    #[serde(default)]
    required_features: BTreeSet<String>,
    #[serde(default)]
    ignored_exit_code: Option<i32>,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Runs each attempt as a shell command.
#[derive(Debug, Clone)]
pub struct ShellBackend {
    id: String,
    params: ShellParams,
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct CapturedOutput {
    stdout: Vec<String>,
    stderr: Vec<String>,
}

impl CapturedOutput {
    fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// The status reported through [`STATUS_MARKER`], if any.
    fn reported_status(&self) -> Option<TestStatus> {
        self.stdout
            .iter()
            .rev()
            .find_map(|line| line.trim().strip_prefix(STATUS_MARKER))
            .and_then(|status| status.parse().ok())
    }

    fn tail(&self) -> String {
        let lines = if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let skip = lines.len().saturating_sub(TRACE_TAIL_LINES);
        lines[skip..].join("\n")
    }

    fn log(&self) -> String {
        let mut log = String::new();
        for line in &self.stdout {
            log.push_str(line);
            log.push('\n');
        }
        if !self.stderr.is_empty() {
            log.push_str("--- stderr ---\n");
            for line in &self.stderr {
                log.push_str(line);
                log.push('\n');
            }
        }
        log
    }
}

impl ShellBackend {
    pub fn from_params(entry: &PluginEntry) -> anyhow::Result<Self> {
        let params: ShellParams = entry.parse_params()?;
        if params.command.trim().is_empty() {
            anyhow::bail!("backend '{}' has an empty command", entry.label());
        }
        Ok(Self {
            id: entry.label().to_string(),
            params,
        })
    }

    fn render(&self, ctx: &TestCaseRunContext) -> String {
        substitute(&self.params.command, &ctx.hook_vars())
    }

    fn status_for(&self, exit: ExitStatus, output: &CapturedOutput) -> TestStatus {
        if let Some(reported) = output.reported_status() {
            return reported;
        }
        match exit.code() {
            Some(0) => TestStatus::Pass,
            Some(code) if Some(code) == self.params.ignored_exit_code => TestStatus::Ignored,
            Some(_) => TestStatus::Fail,
            None => TestStatus::Error,
        }
    }
}

/// Reads `reader` to its end, one entry per line. Bytes that are not
/// UTF-8 are replaced rather than dropping the line.
async fn read_lines<R>(channel: Channel, reader: R) -> (Channel, Vec<String>)
where
    R: AsyncRead + Unpin,
{
    let mut segments = SplitStream::new(BufReader::new(reader).split(b'\n'));
    let mut lines = Vec::new();
    while let Some(segment) = segments.next().await {
        match segment {
            Ok(bytes) => lines.push(decode_line(&bytes)),
            Err(e) => {
                debug!("{:?} listener stopped reading: {}", channel, e);
                break;
            }
        }
    }
    (channel, lines)
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[async_trait]
impl ExecutionBackend for ShellBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, device: &Device, test: &TestCase) -> bool {
        if !self.params.kinds.is_empty() && !self.params.kinds.contains(&test.kind) {
            return false;
        }
        if let Some(min) = self.params.min_platform_version
            && device.platform_version < min
        {
            return false;
        }
        self.params
            .required_features
            .iter()
            .all(|feature| device.supports(feature))
    }

    async fn execute(&self, ctx: &TestCaseRunContext) -> BackendResult<TestResult> {
        let run = &ctx.config().run;
        let identity = ctx.expected_identity();
        let command = self.render(ctx);
        debug!("[{}] {}", identity.device, command);

        let mut process = tokio::process::Command::new(&self.params.shell);
        process
            .arg("-c")
            .arg(&command)
            .env("POOLRUN_POOL", identity.pool.as_str())
            .env("POOLRUN_DEVICE", identity.device.as_str())
            .env("POOLRUN_TEST", identity.test.to_string())
            .env("POOLRUN_ATTEMPT", ctx.item().failure_count().to_string())
            .env("POOLRUN_ARTIFACTS", ctx.artifacts().root())
            .envs(&self.params.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.params.working_dir {
            process.current_dir(dir);
        }

        let started = Utc::now();
        let mut child = process
            .spawn()
            .map_err(|e| BackendError::Launch(format!("{}: {}", command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Launch("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Launch("stderr not captured".to_string()))?;

        let mut listeners = JoinSet::new();
        listeners.spawn(read_lines(Channel::Stdout, stdout));
        listeners.spawn(read_lines(Channel::Stderr, stderr));

        let exit = match tokio::time::timeout(run.output_timeout(), child.wait()).await {
            Ok(exit) => exit?,
            Err(_) => {
                child.kill().await.ok();
                return Err(BackendError::Timeout(format!(
                    "{} produced no result within {:?}",
                    identity.test,
                    run.output_timeout()
                )));
            }
        };

        let drained = tokio::time::timeout(run.listener_grace(), async {
            let mut output = CapturedOutput::default();
            while let Some(joined) = listeners.join_next().await {
                match joined {
                    Ok((Channel::Stdout, lines)) => output.stdout = lines,
                    Ok((Channel::Stderr, lines)) => output.stderr = lines,
                    Err(e) => warn!("[{}] output listener failed: {}", identity.device, e),
                }
            }
            output
        })
        .await;

        let output = drained.map_err(|_| {
            BackendError::Disconnected(format!(
                "output of {} still open {:?} after exit ({})",
                identity.test,
                run.listener_grace(),
                exit
            ))
        })?;

        let status = self.status_for(exit, &output);
        let mut result = TestResult::new(identity.pool, identity.device, identity.test, status)
            .with_timestamps(started, Utc::now());

        if status.is_failure() {
            let tail = output.tail();
            let trace = if tail.is_empty() {
                format!("{}", exit)
            } else {
                format!("{}\n{}", exit, tail)
            };
            result = result.with_trace(trace);
        }

        if !output.is_empty() {
            match ctx.artifacts().write("output.log", output.log()).await {
                Ok(artifact) => result = result.with_artifact(artifact),
                Err(e) => warn!("failed to save output log: {}", e),
            }
        }

        Ok(result)
    }
}
