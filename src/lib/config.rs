//! ## Orchestrator Configuration Module
//!
//! Defines [`OrchestratorConfig`], deserialized from a TOML file through `ext_config`.
//!
//! This module handles:
//! - Pools merged over the built-in catalog ([`PoolConfig`])
//! - Worker binaries keyed by algorithm and platform ([`BinaryConfig`])
//! - Jobs started as soon as the service is up
//! - Stop grace period, subscriber queue bound and thread limit
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    error::{OrchestratorError, OrchestratorResult},
    job::JobRequest,
};

const DEFAULT_STOP_GRACE_PERIOD_SECS: u64 = 10;
const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

/// Configuration for the orchestrator.
#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Pools added to, or replacing, the built-in catalog.
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    /// Worker binaries available on this host.
    #[serde(default)]
    pub binaries: Vec<BinaryConfig>,
    /// Jobs started when the service comes up.
    #[serde(default)]
    pub jobs: Vec<JobRequest>,
    /// Upper bound for `threads` in a job request. Defaults to the host's parallelism.
    #[serde(default)]
    pub max_threads: Option<u32>,
    /// Seconds a worker gets to exit after the graceful stop signal before it is killed.
    #[serde(default = "default_stop_grace_period_secs")]
    pub stop_grace_period_secs: u64,
    /// Events buffered per subscriber before that subscriber is dropped.
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    /// The path to the log file.
    #[serde(default)]
    log_file: Option<PathBuf>,
}

fn default_stop_grace_period_secs() -> u64 {
    DEFAULT_STOP_GRACE_PERIOD_SECS
}

fn default_subscriber_queue_capacity() -> usize {
    DEFAULT_SUBSCRIBER_QUEUE_CAPACITY
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            binaries: Vec::new(),
            jobs: Vec::new(),
            max_threads: None,
            stop_grace_period_secs: DEFAULT_STOP_GRACE_PERIOD_SECS,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            log_file: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn set_log_dir(&mut self, log_dir: Option<PathBuf>) {
        if let Some(dir) = log_dir {
            self.log_file = Some(dir);
        }
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    /// The effective thread limit for job requests.
    pub fn max_threads(&self) -> u32 {
        self.max_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        })
    }

    /// Rejects values the orchestrator cannot run with.
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.subscriber_queue_capacity == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "subscriber_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_threads == Some(0) {
            return Err(OrchestratorError::InvalidConfig(
                "max_threads must be at least 1".to_string(),
            ));
        }
        if let Some(binary) = self.binaries.iter().find(|b| b.algorithm.trim().is_empty()) {
            return Err(OrchestratorError::InvalidConfig(format!(
                "binary `{}` has no algorithm",
                binary.path.display()
            )));
        }
        Ok(())
    }
}

/// A pool entry of the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    pub id: String,
    /// Display name. Defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    pub algorithm: String,
    #[serde(default)]
    pub credential_format: CredentialFormatConfig,
}

/// Serialized form of a pool's credential rule.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialFormatConfig {
    Concat {
        #[serde(default = "default_separator")]
        separator: String,
        #[serde(default = "default_password")]
        password: String,
    },
    WalletOnly {
        #[serde(default = "default_password")]
        password: String,
    },
    /// `{wallet}` and `{worker}` are substituted in both fields.
    Template { user: String, password: String },
}

impl Default for CredentialFormatConfig {
    fn default() -> Self {
        CredentialFormatConfig::Concat {
            separator: default_separator(),
            password: default_password(),
        }
    }
}

fn default_separator() -> String {
    ".".to_string()
}

fn default_password() -> String {
    "x".to_string()
}

/// A worker binary available on this host.
#[derive(Debug, Deserialize, Clone)]
pub struct BinaryConfig {
    pub algorithm: String,
    /// `os-arch`, e.g. `linux-x86_64`. Defaults to the host platform.
    #[serde(default)]
    pub platform: Option<String>,
    pub path: PathBuf,
}

impl BinaryConfig {
    pub fn new(algorithm: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            platform: None,
            path: path.into(),
        }
    }
}
