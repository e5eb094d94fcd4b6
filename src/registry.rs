//! The closed set of pluggable components, keyed by identifier.
//!
//! Every extension point of poolrun (device providers, backends and the
//! rules of each scope) is resolved here from the `type` identifier of a
//! [`PluginEntry`]. The registry is filled once at startup, either with
//! [`PluginRegistry::with_builtins`] or by hand, and is read-only during
//! the run.
//!
//! # Identifiers
//!
//! Identifiers are dotted names with at least two segments, e.g.
//! `builtin.shell` or `acme.screenshot`. Each segment starts with a letter
//! or `_` and continues with letters, digits, `_` or `-`. A malformed or
//! unknown identifier is a [`ConfigError`] raised before any test is
//! scheduled.
//!
//! # Built-in Components
//!
//! | Identifier | Extension point |
//! |------------|-----------------|
//! | `builtin.static`, `builtin.command` | device provider |
//! | `builtin.shell`, `builtin.dry-run` | backend |
//! | `builtin.hook` | rule, every scope |
//! | `builtin.capture-trace`, `builtin.tag-retry` | test-case-run rule |
//! | `builtin.filter`, `builtin.shuffle` | test-case rule |
//!
//! # Registering a Component
//!
//! ```
//! use poolrun::registry::{PluginRegistry, one_rule};
//! use poolrun::rules::TimingRule;
//!
//! let registry = PluginRegistry::with_builtins()
//!     .register_test_case_run_rule("acme.timing", |_ctx, _entry| {
//!         Ok(one_rule(TimingRule::new()))
//!     });
//!
//! assert!(registry.is_registered(
//!     poolrun::registry::ExtensionPoint::TestCaseRunRule,
//!     "acme.timing",
//! ));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::backend::{DryRunBackend, ExecutionBackend, ShellBackend};
use crate::config::{Config, ConfigError, PluginEntry};
use crate::orchestrator::{DeviceSummary, PoolResult, RunResult};
use crate::provider::{CommandProvider, DeviceProvider, StaticProvider};
use crate::rules::{
    CaptureTraceRule, Carried, DeviceContext, FilterRule, HookRule, PoolContext, Rule, RunContext,
    ShuffleRule, TagRetryRule, TestCaseRule, TestCaseRunContext,
};
use crate::testcase::TestResult;

/// The places a plugin can be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionPoint {
    DeviceProvider,
    Backend,
    RunRule,
    PoolRule,
    DeviceRule,
    TestCaseRunRule,
    TestCaseRule,
}

impl fmt::Display for ExtensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExtensionPoint::DeviceProvider => "device provider",
            ExtensionPoint::Backend => "backend",
            ExtensionPoint::RunRule => "run rule",
            ExtensionPoint::PoolRule => "pool rule",
            ExtensionPoint::DeviceRule => "device rule",
            ExtensionPoint::TestCaseRunRule => "test-case-run rule",
            ExtensionPoint::TestCaseRule => "test-case rule",
        })
    }
}

/// Builds the rules of one configured entry for one scope instance.
pub type RuleFactory<C, R> =
    Arc<dyn Fn(&C, &PluginEntry) -> anyhow::Result<Vec<Box<dyn Rule<C, R>>>> + Send + Sync>;

/// Builds the test-case rules of one configured entry for a pool.
pub type TestCaseRuleFactory = Arc<
    dyn Fn(&PoolContext, &PluginEntry) -> anyhow::Result<Vec<Box<dyn TestCaseRule>>> + Send + Sync,
>;

pub type BackendFactory =
    Arc<dyn Fn(&PluginEntry) -> anyhow::Result<Arc<dyn ExecutionBackend>> + Send + Sync>;

pub type DeviceProviderFactory =
    Arc<dyn Fn(&PluginEntry) -> anyhow::Result<Box<dyn DeviceProvider>> + Send + Sync>;

/// Checks the `namespace.name` identifier syntax.
pub fn is_valid_identifier(id: &str) -> bool {
    let segments: Vec<&str> = id.split('.').collect();
    segments.len() >= 2
        && segments.iter().all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

/// Registry of every pluggable component.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    device_providers: BTreeMap<String, DeviceProviderFactory>,
    backends: BTreeMap<String, BackendFactory>,
    run_rules: BTreeMap<String, RuleFactory<RunContext, RunResult>>,
    pool_rules: BTreeMap<String, RuleFactory<PoolContext, PoolResult>>,
    device_rules: BTreeMap<String, RuleFactory<DeviceContext, DeviceSummary>>,
    test_case_run_rules: BTreeMap<String, RuleFactory<TestCaseRunContext, TestResult>>,
    test_case_rules: BTreeMap<String, TestCaseRuleFactory>,
}

fn hook_factory<C, R>() -> RuleFactory<C, R>
where
    C: crate::rules::HookVars + Sync + 'static,
    R: Carried,
{
    Arc::new(
        |_ctx: &C, entry: &PluginEntry| -> anyhow::Result<Vec<Box<dyn Rule<C, R>>>> {
            Ok(one_rule(HookRule::from_params(entry)?))
        },
    )
}

/// Boxes a single rule as a factory result.
pub fn one_rule<C, R>(rule: impl Rule<C, R> + 'static) -> Vec<Box<dyn Rule<C, R>>>
where
    C: Sync,
    R: Carried,
{
    vec![Box::new(rule) as Box<dyn Rule<C, R>>]
}

fn one_test_case_rule(rule: impl TestCaseRule + 'static) -> Vec<Box<dyn TestCaseRule>> {
    vec![Box::new(rule) as Box<dyn TestCaseRule>]
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in component.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new()
            .register_device_provider("builtin.static", |entry| {
                Ok(Box::new(StaticProvider::from_params(entry)?))
            })
            .register_device_provider("builtin.command", |entry| {
                Ok(Box::new(CommandProvider::from_params(entry)?))
            })
            .register_backend("builtin.shell", |entry| {
                Ok(Arc::new(ShellBackend::from_params(entry)?))
            })
            .register_backend("builtin.dry-run", |entry| {
                Ok(Arc::new(DryRunBackend::from_params(entry)?))
            })
            .register_test_case_run_rule("builtin.capture-trace", |_ctx, entry| {
                Ok(one_rule(CaptureTraceRule::from_params(entry)?))
            })
            .register_test_case_run_rule("builtin.tag-retry", |_ctx, _entry| {
                Ok(one_rule(TagRetryRule))
            })
            .register_test_case_rule("builtin.filter", |_ctx, entry| {
                Ok(one_test_case_rule(FilterRule::from_params(entry)?))
            })
            .register_test_case_rule("builtin.shuffle", |_ctx, entry| {
                Ok(one_test_case_rule(ShuffleRule::from_params(entry)?))
            });

        let hook = "builtin.hook".to_string();
        registry.run_rules.insert(hook.clone(), hook_factory());
        registry.pool_rules.insert(hook.clone(), hook_factory());
        registry.device_rules.insert(hook.clone(), hook_factory());
        registry.test_case_run_rules.insert(hook, hook_factory());
        registry
    }

    pub fn register_device_provider<F>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginEntry) -> anyhow::Result<Box<dyn DeviceProvider>> + Send + Sync + 'static,
    {
        self.device_providers.insert(id.into(), Arc::new(factory));
        self
    }

    pub fn register_backend<F>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginEntry) -> anyhow::Result<Arc<dyn ExecutionBackend>> + Send + Sync + 'static,
    {
        self.backends.insert(id.into(), Arc::new(factory));
        self
    }

    pub fn register_run_rule<F>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&RunContext, &PluginEntry) -> anyhow::Result<Vec<Box<dyn Rule<RunContext, RunResult>>>>
            + Send
            + Sync
            + 'static,
    {
        self.run_rules.insert(id.into(), Arc::new(factory));
        self
    }

    pub fn register_pool_rule<F>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PoolContext, &PluginEntry) -> anyhow::Result<Vec<Box<dyn Rule<PoolContext, PoolResult>>>>
            + Send
            + Sync
            + 'static,
    {
        self.pool_rules.insert(id.into(), Arc::new(factory));
        self
    }

    pub fn register_device_rule<F>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(
                &DeviceContext,
                &PluginEntry,
            ) -> anyhow::Result<Vec<Box<dyn Rule<DeviceContext, DeviceSummary>>>>
            + Send
            + Sync
            + 'static,
    {
        self.device_rules.insert(id.into(), Arc::new(factory));
        self
    }

    pub fn register_test_case_run_rule<F>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(
                &TestCaseRunContext,
                &PluginEntry,
            ) -> anyhow::Result<Vec<Box<dyn Rule<TestCaseRunContext, TestResult>>>>
            + Send
            + Sync
            + 'static,
    {
        self.test_case_run_rules.insert(id.into(), Arc::new(factory));
        self
    }

    pub fn register_test_case_rule<F>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PoolContext, &PluginEntry) -> anyhow::Result<Vec<Box<dyn TestCaseRule>>>
            + Send
            + Sync
            + 'static,
    {
        self.test_case_rules.insert(id.into(), Arc::new(factory));
        self
    }

    pub fn is_registered(&self, point: ExtensionPoint, id: &str) -> bool {
        match point {
            ExtensionPoint::DeviceProvider => self.device_providers.contains_key(id),
            ExtensionPoint::Backend => self.backends.contains_key(id),
            ExtensionPoint::RunRule => self.run_rules.contains_key(id),
            ExtensionPoint::PoolRule => self.pool_rules.contains_key(id),
            ExtensionPoint::DeviceRule => self.device_rules.contains_key(id),
            ExtensionPoint::TestCaseRunRule => self.test_case_run_rules.contains_key(id),
            ExtensionPoint::TestCaseRule => self.test_case_rules.contains_key(id),
        }
    }

    /// Resolves every identifier the configuration names.
    ///
    /// Factories are not invoked; parameter errors surface when the
    /// component is instantiated.
    pub fn validate(&self, config: &Config) -> Result<(), ConfigError> {
        let entries = std::iter::once((ExtensionPoint::DeviceProvider, &config.devices))
            .chain(config.backends.iter().map(|e| (ExtensionPoint::Backend, e)))
            .chain(config.rules.run.iter().map(|e| (ExtensionPoint::RunRule, e)))
            .chain(config.rules.pool.iter().map(|e| (ExtensionPoint::PoolRule, e)))
            .chain(config.rules.device.iter().map(|e| (ExtensionPoint::DeviceRule, e)))
            .chain(
                config
                    .rules
                    .test_case_run
                    .iter()
                    .map(|e| (ExtensionPoint::TestCaseRunRule, e)),
            )
            .chain(
                config
                    .rules
                    .test_case
                    .iter()
                    .map(|e| (ExtensionPoint::TestCaseRule, e)),
            );

        for (point, entry) in entries {
            self.check(point, &entry.kind)?;
        }

        let mut labels = std::collections::BTreeSet::new();
        for entry in &config.backends {
            if !labels.insert(entry.label()) {
                return Err(ConfigError::Invalid(format!(
                    "backend name '{}' is used twice; set distinct `name`s",
                    entry.label()
                )));
            }
        }
        Ok(())
    }

    fn check(&self, point: ExtensionPoint, id: &str) -> Result<(), ConfigError> {
        if !is_valid_identifier(id) {
            return Err(ConfigError::MalformedIdentifier {
                point,
                id: id.to_string(),
            });
        }
        if !self.is_registered(point, id) {
            return Err(ConfigError::UnknownPlugin {
                point,
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn lookup<'a, F>(
        &self,
        point: ExtensionPoint,
        factories: &'a BTreeMap<String, F>,
        id: &str,
    ) -> Result<&'a F, ConfigError> {
        self.check(point, id)?;
        factories.get(id).ok_or_else(|| ConfigError::UnknownPlugin {
            point,
            id: id.to_string(),
        })
    }

    pub fn device_provider(&self, entry: &PluginEntry) -> Result<Box<dyn DeviceProvider>, ConfigError> {
        let point = ExtensionPoint::DeviceProvider;
        let factory = self.lookup(point, &self.device_providers, &entry.kind)?;
        factory(entry).map_err(|source| plugin_error(point, entry, source))
    }

    pub fn backend(&self, entry: &PluginEntry) -> Result<Arc<dyn ExecutionBackend>, ConfigError> {
        let point = ExtensionPoint::Backend;
        let factory = self.lookup(point, &self.backends, &entry.kind)?;
        factory(entry).map_err(|source| plugin_error(point, entry, source))
    }

    pub fn run_rules(
        &self,
        ctx: &RunContext,
        entries: &[PluginEntry],
    ) -> Result<Vec<Box<dyn Rule<RunContext, RunResult>>>, ConfigError> {
        self.instantiate(ExtensionPoint::RunRule, &self.run_rules, ctx, entries)
    }

    pub fn pool_rules(
        &self,
        ctx: &PoolContext,
        entries: &[PluginEntry],
    ) -> Result<Vec<Box<dyn Rule<PoolContext, PoolResult>>>, ConfigError> {
        self.instantiate(ExtensionPoint::PoolRule, &self.pool_rules, ctx, entries)
    }

    pub fn device_rules(
        &self,
        ctx: &DeviceContext,
        entries: &[PluginEntry],
    ) -> Result<Vec<Box<dyn Rule<DeviceContext, DeviceSummary>>>, ConfigError> {
        self.instantiate(ExtensionPoint::DeviceRule, &self.device_rules, ctx, entries)
    }

    pub fn test_case_run_rules(
        &self,
        ctx: &TestCaseRunContext,
        entries: &[PluginEntry],
    ) -> Result<Vec<Box<dyn Rule<TestCaseRunContext, TestResult>>>, ConfigError> {
        self.instantiate(
            ExtensionPoint::TestCaseRunRule,
            &self.test_case_run_rules,
            ctx,
            entries,
        )
    }

    pub fn test_case_rules(
        &self,
        ctx: &PoolContext,
        entries: &[PluginEntry],
    ) -> Result<Vec<Box<dyn TestCaseRule>>, ConfigError> {
        let point = ExtensionPoint::TestCaseRule;
        let mut rules = Vec::new();
        for entry in entries {
            let factory = self.lookup(point, &self.test_case_rules, &entry.kind)?;
            rules.extend(factory(ctx, entry).map_err(|source| plugin_error(point, entry, source))?);
        }
        Ok(rules)
    }

    fn instantiate<C, R>(
        &self,
        point: ExtensionPoint,
        factories: &BTreeMap<String, RuleFactory<C, R>>,
        ctx: &C,
        entries: &[PluginEntry],
    ) -> Result<Vec<Box<dyn Rule<C, R>>>, ConfigError>
    where
        C: Sync,
        R: Carried,
    {
        let mut rules = Vec::new();
        for entry in entries {
            let factory = self.lookup(point, factories, &entry.kind)?;
            rules.extend(factory(ctx, entry).map_err(|source| plugin_error(point, entry, source))?);
        }
        Ok(rules)
    }
}

fn plugin_error(point: ExtensionPoint, entry: &PluginEntry, source: anyhow::Error) -> ConfigError {
    ConfigError::Plugin {
        point,
        id: entry.label().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;
    use crate::rules::fixtures::{attempt, test_item};

    #[test]
    fn test_identifier_syntax() {
        assert!(is_valid_identifier("builtin.shell"));
        assert!(is_valid_identifier("acme.team_a.capture-video"));
        assert!(!is_valid_identifier("shell"));
        assert!(!is_valid_identifier("builtin."));
        assert!(!is_valid_identifier(".shell"));
        assert!(!is_valid_identifier("builtin.9lives"));
        assert!(!is_valid_identifier("builtin.sh ell"));
    }

    fn config(extra: &str) -> Config {
        load_config_str(&format!(
            r#"
            [devices]
            type = "builtin.static"

            [suite]
            type = "inline"

            {extra}
            "#
        ))
        .unwrap()
    }

    #[test]
    fn test_validate_accepts_builtins() {
        let config = config(
            r#"
            [[backends]]
            type = "builtin.shell"
            command = "true"

            [[rules.run]]
            type = "builtin.hook"
            before = ["true"]

            [[rules.test_case_run]]
            type = "builtin.capture-trace"

            [[rules.test_case]]
            type = "builtin.shuffle"
            "#,
        );
        PluginRegistry::with_builtins().validate(&config).unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_and_malformed() {
        let registry = PluginRegistry::with_builtins();

        let unknown = config("[[rules.device]]\ntype = \"acme.missing\"");
        assert!(matches!(
            registry.validate(&unknown),
            Err(ConfigError::UnknownPlugin { point: ExtensionPoint::DeviceRule, id }) if id == "acme.missing"
        ));

        let malformed = config("[[backends]]\ntype = \"shell\"");
        assert!(matches!(
            registry.validate(&malformed),
            Err(ConfigError::MalformedIdentifier { point: ExtensionPoint::Backend, .. })
        ));

        // Registered, but at another extension point.
        let misplaced = config("[[rules.device]]\ntype = \"builtin.capture-trace\"");
        assert!(matches!(
            registry.validate(&misplaced),
            Err(ConfigError::UnknownPlugin { .. })
        ));
    }

    #[test]
    fn test_duplicate_backend_names_rejected() {
        let config = config(
            r#"
            [[backends]]
            type = "builtin.dry-run"

            [[backends]]
            type = "builtin.dry-run"
            "#,
        );
        assert!(matches!(
            PluginRegistry::with_builtins().validate(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_factory_errors_name_the_plugin() {
        let registry = PluginRegistry::with_builtins();
        let entry = PluginEntry::new("builtin.shell").with_name("adb");
        let err = match registry.backend(&entry) {
            Err(e) => e,
            Ok(_) => panic!("shell backend without command must fail"),
        };
        assert!(err.to_string().contains("adb"));
    }

    #[test]
    fn test_rules_instantiated_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = attempt(dir.path(), test_item());
        let entries = vec![
            PluginEntry::new("builtin.tag-retry"),
            PluginEntry::new("builtin.hook")
                .with_name("after-hook")
                .with_param("after", vec![toml::Value::from("true")]),
        ];

        let rules = PluginRegistry::with_builtins()
            .test_case_run_rules(&ctx, &entries)
            .unwrap();
        let names: Vec<_> = rules.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["builtin.tag-retry", "after-hook"]);
    }
}
