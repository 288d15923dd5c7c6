use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::ddl::DdlConfig;
use crate::error::ConnectionError;
use crate::options::{IsolationLevel, OptionLayer, RpcPriority};
use crate::session::PoolConfig;

const ENV_PREFIX: &str = "REWIND";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of replays of one transaction after aborts.
    pub max_attempts: u32,
    pub retry_aborts_internally: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_aborts_internally: true,
        }
    }
}

/// Process-wide option defaults, the lowest-precedence option layer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvironmentDefaults {
    pub optimizer_version: Option<String>,
    pub optimizer_statistics_package: Option<String>,
    pub rpc_priority: Option<RpcPriority>,
    pub statement_tag: Option<String>,
    pub transaction_tag: Option<String>,
    pub max_commit_delay_ms: Option<u64>,
    pub isolation_level: Option<IsolationLevel>,
    pub return_commit_stats: Option<bool>,
}

impl EnvironmentDefaults {
    pub fn to_layer(&self) -> OptionLayer {
        OptionLayer {
            optimizer_version: self.optimizer_version.clone(),
            optimizer_statistics_package: self.optimizer_statistics_package.clone(),
            rpc_priority: self.rpc_priority,
            statement_tag: self.statement_tag.clone(),
            transaction_tag: self.transaction_tag.clone(),
            max_commit_delay: self.max_commit_delay_ms.map(Duration::from_millis),
            isolation_level: self.isolation_level,
            return_commit_stats: self.return_commit_stats,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub ddl: DdlConfig,
    pub defaults: EnvironmentDefaults,
    /// Default per-statement timeout. Unset means no timeout.
    pub statement_timeout_ms: Option<u64>,
    pub autocommit: bool,
    pub read_only: bool,
    /// Log format: "compact" or "json".
    pub log_format: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            ddl: DdlConfig::default(),
            defaults: EnvironmentDefaults::default(),
            statement_timeout_ms: None,
            autocommit: true,
            read_only: false,
            log_format: "compact".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `REWIND_*` environment variables
    /// (`REWIND_POOL__MAX_EXCLUSIVE_SESSIONS=4`).
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(None)
    }

    /// Like [`RuntimeConfig::load`], with an optional config file between the
    /// defaults and the environment.
    pub fn load_from(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::build(path, environment())
    }

    fn build(path: Option<&Path>, env: config::Environment) -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let mut builder = config::Config::builder().add_source(
            config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
        );
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(env)
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: RuntimeConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConnectionError> {
        self.pool.validate()?;
        if self.retry.max_attempts == 0 {
            return Err(ConnectionError::Config(
                "retry.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.ddl.poll_interval_ms == 0 {
            return Err(ConnectionError::Config(
                "ddl.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if !matches!(self.log_format.as_str(), "compact" | "json") {
            return Err(ConnectionError::Config(format!(
                "log_format must be \"compact\" or \"json\", got {:?}",
                self.log_format
            )));
        }
        Ok(())
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Immutable snapshot of the environment layer, captured by each
    /// connection when it is created.
    pub fn environment_snapshot(&self) -> Arc<OptionLayer> {
        Arc::new(self.defaults.to_layer())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ExhaustionPolicy;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let mut map = config::Map::new();
        for (key, value) in vars {
            map.insert(key.to_string(), value.to_string());
        }
        environment().source(Some(map))
    }

    #[test]
    fn defaults_are_valid() -> anyhow::Result<()> {
        let cfg = RuntimeConfig::build(None, env(&[]))?;
        assert_eq!(cfg, RuntimeConfig::default());
        assert!(cfg.autocommit);
        assert_eq!(cfg.statement_timeout(), None);
        Ok(())
    }

    #[test]
    fn environment_overrides_nested_keys() -> anyhow::Result<()> {
        let cfg = RuntimeConfig::build(
            None,
            env(&[
                ("REWIND_POOL__MAX_EXCLUSIVE_SESSIONS", "4"),
                ("REWIND_POOL__EXHAUSTION_POLICY", "fail_fast"),
                ("REWIND_RETRY__MAX_ATTEMPTS", "3"),
                ("REWIND_DEFAULTS__OPTIMIZER_VERSION", "20"),
                ("REWIND_STATEMENT_TIMEOUT_MS", "250"),
            ]),
        )?;
        assert_eq!(cfg.pool.max_exclusive_sessions, 4);
        assert_eq!(cfg.pool.exhaustion_policy, ExhaustionPolicy::FailFast);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.statement_timeout(), Some(Duration::from_millis(250)));

        let snapshot = cfg.environment_snapshot();
        assert_eq!(snapshot.optimizer_version.as_deref(), Some("20"));
        Ok(())
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut cfg = RuntimeConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(matches!(cfg.validate(), Err(ConnectionError::Config(_))));

        let mut cfg = RuntimeConfig::default();
        cfg.pool.max_exclusive_sessions = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.log_format = "xml".to_string();
        assert!(cfg.validate().is_err());

        assert!(RuntimeConfig::build(None, env(&[("REWIND_RETRY__MAX_ATTEMPTS", "0")])).is_err());
    }
}
