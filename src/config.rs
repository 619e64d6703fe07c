//! Agent configuration.
//!
//! The binary assembles an [`AgentConfig`] from flags and environment
//! variables; everything below it only sees the validated result.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::compose::{project_name_for_key, ComposeCommand, OutputMode, Project};
use crate::consul::DEFAULT_ADDRESS;
use crate::models::LabelFilter;

pub const DEFAULT_KEY: &str = "executant.yml";
pub const DEFAULT_FILTER: &str = "executant.enabled=true";
pub const DEFAULT_WORK_DIR: &str = "/var/lib/executant";

/// Configuration errors, reported before anything is started.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("At least one key must be configured")]
    NoKeys,

    #[error("Keys must not be empty")]
    EmptyKey,

    #[error("Key '{0}' is configured more than once")]
    DuplicateKey(String),

    #[error("Keys '{first}' and '{second}' both map to project '{project}'")]
    ProjectCollision {
        first: String,
        second: String,
        project: String,
    },

    #[error("At least one filter label must be configured")]
    NoFilters,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Delays driving the watch loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Upper bound of a single blocking read.
    pub wait_time: Duration,
    /// Pause after the control plane could not be reached.
    pub transport_backoff: Duration,
    /// Pause after a key was found missing.
    pub not_found_backoff: Duration,
    /// Pause after a value failed to parse.
    pub parse_error_backoff: Duration,
    /// Interval between leader probes at startup.
    pub readiness_interval: Duration,
    /// How long shutdown waits for watchers to finish an in-flight action.
    pub shutdown_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(60),
            transport_backoff: Duration::from_secs(30),
            not_found_backoff: Duration::from_secs(15),
            parse_error_backoff: Duration::from_secs(15),
            readiness_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl Timings {
    fn validate(&self) -> Result<(), ConfigError> {
        let named = [
            ("wait time", self.wait_time),
            ("transport backoff", self.transport_backoff),
            ("not-found backoff", self.not_found_backoff),
            ("parse-error backoff", self.parse_error_backoff),
            ("readiness interval", self.readiness_interval),
        ];
        match named.iter().find(|(_, d)| d.is_zero()) {
            Some((name, _)) => Err(ConfigError::ZeroDuration(*name)),
            None => Ok(()),
        }
    }
}

/// Connection settings for the Consul agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsulSettings {
    pub address: String,
    pub token: Option<String>,
    pub datacenter: Option<String>,
}

impl Default for ConsulSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            token: None,
            datacenter: None,
        }
    }
}

/// Everything the supervisor needs to run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Watched keys, in the order teardown runs at shutdown.
    pub keys: Vec<String>,
    pub filter: LabelFilter,
    /// Root under which each key gets its own project directory.
    pub work_dir: PathBuf,
    pub consul: ConsulSettings,
    pub compose: ComposeCommand,
    pub output: OutputMode,
    pub timings: Timings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            keys: vec![DEFAULT_KEY.to_string()],
            filter: LabelFilter::new([DEFAULT_FILTER]),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            consul: ConsulSettings::default(),
            compose: ComposeCommand::default(),
            output: OutputMode::default(),
            timings: Timings::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keys.is_empty() {
            return Err(ConfigError::NoKeys);
        }

        let mut projects: HashMap<String, &str> = HashMap::new();
        for key in &self.keys {
            if key.trim().is_empty() {
                return Err(ConfigError::EmptyKey);
            }
            let project = project_name_for_key(key);
            if let Some(first) = projects.insert(project.clone(), key.as_str()) {
                return Err(if first == key.as_str() {
                    ConfigError::DuplicateKey(key.clone())
                } else {
                    ConfigError::ProjectCollision {
                        first: first.to_string(),
                        second: key.clone(),
                        project,
                    }
                });
            }
        }

        if self.filter.is_empty() {
            return Err(ConfigError::NoFilters);
        }

        self.timings.validate()
    }

    /// Each key paired with its project, in configuration order.
    pub fn projects(&self) -> Vec<(String, Project)> {
        self.keys
            .iter()
            .map(|key| (key.clone(), Project::for_key(&self.work_dir, key)))
            .collect()
    }

    /// Log the effective configuration.
    pub fn log_summary(&self) {
        let filters: Vec<_> = self.filter.labels().collect();
        tracing::info!("{:>20}: {:?}", "EXECUTANT_KEYS", self.keys);
        tracing::info!("{:>20}: {:?}", "EXECUTANT_FILTERS", filters);
        tracing::info!("{:>20}: {}", "EXECUTANT_WORK_DIR", self.work_dir.display());
        tracing::info!("{:>20}: {}", "CONSUL_HTTP_ADDR", self.consul.address);
        if let Some(ref dc) = self.consul.datacenter {
            tracing::info!("{:>20}: {}", "CONSUL_DATACENTER", dc);
        }
        tracing::info!("{:>20}: {}", "COMPOSE_COMMAND", self.compose);
        tracing::debug!("{:>20}: {:?}", "TIMINGS", self.timings);
    }
}

/// Split a comma-separated list, trimming entries and dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
