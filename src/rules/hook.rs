//! Shell hooks usable at every rule scope (`builtin.hook`).
//!
//! ```toml
//! [[rules.device]]
//! type = "builtin.hook"
//! before = ["adb -s {device} wait-for-device"]
//! after = ["adb -s {device} logcat -d > {output_dir}/logcat-{device}.txt"]
//! ```
//!
//! Placeholders are substituted shell-quoted. Which ones exist depends on
//! the scope, see [`HookVars`].

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{Carried, DeviceContext, PoolContext, Rule, RunContext, TestCaseRunContext};
use crate::config::PluginEntry;

/// Placeholder values a scope exposes to hook commands.
pub trait HookVars {
    fn hook_vars(&self) -> BTreeMap<&'static str, String>;
}

impl HookVars for RunContext {
    fn hook_vars(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("run", self.run_id().to_string()),
            ("output_dir", self.output_dir().display().to_string()),
        ])
    }
}

impl HookVars for PoolContext {
    fn hook_vars(&self) -> BTreeMap<&'static str, String> {
        let mut vars = self.run().hook_vars();
        vars.insert("pool", self.pool().id().to_string());
        vars
    }
}

impl HookVars for DeviceContext {
    fn hook_vars(&self) -> BTreeMap<&'static str, String> {
        let mut vars = self.pool_context().hook_vars();
        vars.insert("device", self.device().id().to_string());
        vars.insert("platform_version", self.device().platform_version.to_string());
        vars
    }
}

impl HookVars for TestCaseRunContext {
    fn hook_vars(&self) -> BTreeMap<&'static str, String> {
        let mut vars = self.device_context().hook_vars();
        let test = self.item().test();
        vars.insert("test", test.to_string());
        vars.insert("class", test.qualified_class());
        vars.insert("method", test.method.clone());
        vars.insert("package", test.package.clone());
        vars.insert("kind", test.kind.clone());
        vars.insert("attempt", self.item().failure_count().to_string());
        vars.insert("artifacts", self.artifacts().root().display().to_string());
        vars
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HookParams {
    #[serde(default)]
    before: Vec<String>,
    #[serde(default)]
    after: Vec<String>,
    #[serde(default = "default_shell")]
    shell: String,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Runs shell commands before and after a scope.
///
/// A non-zero exit status of a `before` command fails the rule, with the
/// usual consequences for the scope. A failing `after` command is logged by
/// the pipeline and leaves the carried value untouched.
#[derive(Debug, Clone)]
pub struct HookRule {
    name: String,
    before: Vec<String>,
    after: Vec<String>,
    shell: String,
}

impl HookRule {
    pub fn from_params(entry: &PluginEntry) -> anyhow::Result<Self> {
        let params: HookParams = entry.parse_params()?;
        if params.before.is_empty() && params.after.is_empty() {
            anyhow::bail!("hook '{}' has neither before nor after commands", entry.label());
        }
        Ok(Self {
            name: entry.label().to_string(),
            before: params.before,
            after: params.after,
            shell: params.shell,
        })
    }

    async fn run_all(&self, commands: &[String], vars: &BTreeMap<&'static str, String>) -> anyhow::Result<()> {
        for template in commands {
            let command = substitute(template, vars);
            debug!("hook '{}': {}", self.name, command);

            let output = Command::new(&self.shell)
                .arg("-c")
                .arg(&command)
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("failed to spawn hook command: {}", command))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                anyhow::bail!(
                    "hook command `{}` exited with {}: {}",
                    command,
                    output.status,
                    stderr.trim()
                );
            }
        }
        Ok(())
    }
}

/// Replaces `{name}` placeholders with shell-quoted values.
pub(crate) fn substitute(template: &str, vars: &BTreeMap<&'static str, String>) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), &shell_words::quote(value))
    })
}

#[async_trait]
impl<C, R> Rule<C, R> for HookRule
where
    C: HookVars + Sync,
    R: Carried,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn before(&self, ctx: &C) -> anyhow::Result<()> {
        let vars = ctx.hook_vars();
        self.run_all(&self.before, &vars).await
    }

    async fn after(&self, ctx: &C, carried: R) -> anyhow::Result<R> {
        let vars = ctx.hook_vars();
        self.run_all(&self.after, &vars).await?;
        Ok(carried)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::fixtures::{attempt, test_item};
    use crate::testcase::TestResult;

    fn hook(before: &[&str], after: &[&str]) -> HookRule {
        let entry = PluginEntry::new("builtin.hook")
            .with_param(
                "before",
                before.iter().map(|s| toml::Value::from(*s)).collect::<Vec<_>>(),
            )
            .with_param(
                "after",
                after.iter().map(|s| toml::Value::from(*s)).collect::<Vec<_>>(),
            );
        HookRule::from_params(&entry).unwrap()
    }

    #[test]
    fn test_substitute_quotes_values() {
        let vars = BTreeMap::from([("device", "emulator 5554".to_string())]);
        assert_eq!(
            substitute("adb -s {device} shell", &vars),
            "adb -s 'emulator 5554' shell"
        );
        assert_eq!(substitute("echo {unknown}", &vars), "echo {unknown}");
    }

    #[test]
    fn test_empty_hook_rejected() {
        assert!(HookRule::from_params(&PluginEntry::new("builtin.hook")).is_err());
    }

    #[tokio::test]
    async fn test_before_runs_with_test_vars() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = attempt(dir.path(), test_item());
        let marker = dir.path().join("marker");
        let command = format!("echo {{test}}@{{device}} > {}", marker.display());
        let rule = hook(&[command.as_str()], &[]);

        Rule::<TestCaseRunContext, TestResult>::before(&rule, &ctx)
            .await
            .unwrap();

        let written = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(written.trim(), "com.example.LoginTest#testValid@dev-1");
    }

    #[tokio::test]
    async fn test_failing_command_fails_rule() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = attempt(dir.path(), test_item());
        let rule = hook(&["exit 3"], &[]);

        let err = Rule::<TestCaseRunContext, TestResult>::before(&rule, &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit 3"));
    }
}
