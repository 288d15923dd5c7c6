//! Request option layers and their resolution.
//!
//! Options come from three layers, lowest to highest precedence:
//! the process environment snapshot captured when a connection is created,
//! the connection's own settings, and a single statement's overrides
//! (programmatic or hint comments). [`resolve`] merges them into the
//! [`EffectiveOptions`] sent with a request.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcPriority {
    #[default]
    Unspecified,
    Low,
    Medium,
    High,
}

impl FromStr for RpcPriority {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        let name = normalized.strip_prefix("PRIORITY_").unwrap_or(&normalized);
        match name {
            "" | "UNSPECIFIED" | "NULL" => Ok(RpcPriority::Unspecified),
            "LOW" => Ok(RpcPriority::Low),
            "MEDIUM" => Ok(RpcPriority::Medium),
            "HIGH" => Ok(RpcPriority::High),
            _ => Err(ConnectionError::InvalidArgument(format!(
                "unknown rpc priority: {s}"
            ))),
        }
    }
}

impl fmt::Display for RpcPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcPriority::Unspecified => "UNSPECIFIED",
            RpcPriority::Low => "LOW",
            RpcPriority::Medium => "MEDIUM",
            RpcPriority::High => "HIGH",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Let the backend pick its default isolation.
    #[default]
    Default,
    Serializable,
    RepeatableRead,
}

impl FromStr for IsolationLevel {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
            .to_ascii_uppercase();
        match normalized.as_str() {
            "" | "DEFAULT" | "ISOLATION_LEVEL_UNSPECIFIED" => Ok(IsolationLevel::Default),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            "REPEATABLE_READ" => Ok(IsolationLevel::RepeatableRead),
            _ => Err(ConnectionError::InvalidArgument(format!(
                "unknown isolation level: {s}"
            ))),
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::Default => "DEFAULT",
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
        };
        f.write_str(name)
    }
}

/// One configuration layer. `None` (or an empty string) means "not set here".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionLayer {
    pub optimizer_version: Option<String>,
    pub optimizer_statistics_package: Option<String>,
    pub rpc_priority: Option<RpcPriority>,
    pub statement_tag: Option<String>,
    pub transaction_tag: Option<String>,
    pub max_commit_delay: Option<Duration>,
    pub isolation_level: Option<IsolationLevel>,
    pub return_commit_stats: Option<bool>,
}

impl OptionLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimizer_version(mut self, version: impl Into<String>) -> Self {
        self.optimizer_version = Some(version.into());
        self
    }

    pub fn with_optimizer_statistics_package(mut self, package: impl Into<String>) -> Self {
        self.optimizer_statistics_package = Some(package.into());
        self
    }

    pub fn with_rpc_priority(mut self, priority: RpcPriority) -> Self {
        self.rpc_priority = Some(priority);
        self
    }

    pub fn with_statement_tag(mut self, tag: impl Into<String>) -> Self {
        self.statement_tag = Some(tag.into());
        self
    }

    pub fn with_transaction_tag(mut self, tag: impl Into<String>) -> Self {
        self.transaction_tag = Some(tag.into());
        self
    }

    pub fn with_max_commit_delay(mut self, delay: Duration) -> Self {
        self.max_commit_delay = Some(delay);
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn with_return_commit_stats(mut self, enabled: bool) -> Self {
        self.return_commit_stats = Some(enabled);
        self
    }

    /// Fill every unset field of `self` from `lower`.
    pub fn or(mut self, lower: &OptionLayer) -> Self {
        fill_str(&mut self.optimizer_version, &lower.optimizer_version);
        fill_str(
            &mut self.optimizer_statistics_package,
            &lower.optimizer_statistics_package,
        );
        fill_str(&mut self.statement_tag, &lower.statement_tag);
        fill_str(&mut self.transaction_tag, &lower.transaction_tag);
        if !is_set_priority(&self.rpc_priority) {
            self.rpc_priority = lower.rpc_priority;
        }
        if !is_set_isolation(&self.isolation_level) {
            self.isolation_level = lower.isolation_level;
        }
        if self.max_commit_delay.is_none() {
            self.max_commit_delay = lower.max_commit_delay;
        }
        if self.return_commit_stats.is_none() {
            self.return_commit_stats = lower.return_commit_stats;
        }
        self
    }
}

/// Fully resolved options for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectiveOptions {
    pub optimizer_version: String,
    pub optimizer_statistics_package: String,
    pub rpc_priority: RpcPriority,
    pub statement_tag: String,
    pub transaction_tag: String,
    pub max_commit_delay: Option<Duration>,
    pub isolation_level: IsolationLevel,
    pub return_commit_stats: bool,
}

impl EffectiveOptions {
    /// Per-request options handed to the backend.
    pub fn request_options(&self, deadline: Option<Instant>) -> RequestOptions {
        RequestOptions {
            priority: self.rpc_priority,
            request_tag: self.statement_tag.clone(),
            transaction_tag: self.transaction_tag.clone(),
            optimizer_version: self.optimizer_version.clone(),
            optimizer_statistics_package: self.optimizer_statistics_package.clone(),
            deadline,
        }
    }
}

/// Options attached to an individual backend call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub priority: RpcPriority,
    pub request_tag: String,
    pub transaction_tag: String,
    pub optimizer_version: String,
    pub optimizer_statistics_package: String,
    /// Backend call deadline derived from the statement timeout.
    pub deadline: Option<Instant>,
}

impl RequestOptions {
    pub fn without_deadline(&self) -> Self {
        Self {
            deadline: None,
            ..self.clone()
        }
    }
}

/// Merge the three layers. Statement overrides win when present and non-empty,
/// then the connection layer, then the environment, then built-in defaults.
pub fn resolve(
    environment: &OptionLayer,
    connection: &OptionLayer,
    statement: &OptionLayer,
) -> EffectiveOptions {
    let merged = statement.clone().or(connection).or(environment);
    EffectiveOptions {
        optimizer_version: merged.optimizer_version.unwrap_or_default(),
        optimizer_statistics_package: merged.optimizer_statistics_package.unwrap_or_default(),
        rpc_priority: merged.rpc_priority.unwrap_or_default(),
        statement_tag: merged.statement_tag.unwrap_or_default(),
        transaction_tag: merged.transaction_tag.unwrap_or_default(),
        max_commit_delay: merged.max_commit_delay,
        isolation_level: merged.isolation_level.unwrap_or_default(),
        return_commit_stats: merged.return_commit_stats.unwrap_or(false),
    }
}

fn fill_str(target: &mut Option<String>, lower: &Option<String>) {
    let empty = target.as_deref().map_or(true, str::is_empty);
    if empty {
        *target = lower.clone().filter(|value| !value.is_empty());
    }
}

fn is_set_priority(value: &Option<RpcPriority>) -> bool {
    matches!(value, Some(priority) if *priority != RpcPriority::Unspecified)
}

fn is_set_isolation(value: &Option<IsolationLevel>) -> bool {
    matches!(value, Some(level) if *level != IsolationLevel::Default)
}
