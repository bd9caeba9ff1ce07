//! Process configuration: the cluster name, which resource kinds to sync and
//! how, plus queue/retry tuning. Loaded from YAML or JSON, then overridden by
//! `KSYNC_*` environment variables.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{KindDescriptor, SyncError, SyncResult, SyncStrategy};

pub const DEFAULT_QUEUE_SIZE: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub cluster: String,
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_watch_restart_ms")]
    pub watch_restart_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
    /// Informational; the dynamic client only needs the plural resource name.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub strategy: SyncStrategy,
    /// List, then fetch each object individually, before watching. For kinds
    /// whose list responses omit object bodies.
    #[serde(default)]
    pub list_first: bool,
}

impl ResourceConfig {
    pub fn kind_descriptor(&self) -> KindDescriptor {
        KindDescriptor::new(self.group.clone(), self.version.clone(), self.resource.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: default_queue_capacity(), cooldown_ms: default_cooldown_ms() }
    }
}

impl QueueConfig {
    pub fn cooldown(&self) -> Duration { Duration::from_millis(self.cooldown_ms) }
}

/// Exponential backoff for cluster reads/writes. There is no elapsed-time cap;
/// retries end on success, a permanent error, or cancellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_queue_capacity() -> usize { DEFAULT_QUEUE_SIZE }
fn default_cooldown_ms() -> u64 { 1000 }
fn default_initial_interval_ms() -> u64 { 500 }
fn default_max_interval_ms() -> u64 { 60_000 }
fn default_multiplier() -> f64 { 1.5 }
fn default_watch_restart_ms() -> u64 { 2000 }

impl FromStr for Config {
    type Err = SyncError;

    /// YAML is a superset of JSON, so one parser covers both formats.
    fn from_str(s: &str) -> SyncResult<Self> {
        serde_yaml::from_str(s).map_err(|e| SyncError::Config(format!("parsing config: {}", e)))
    }
}

impl Config {
    /// Read, apply environment overrides, validate.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("reading {}: {}", path.display(), e)))?;
        let mut cfg: Config = raw.parse()?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cluster) = lookup("KSYNC_CLUSTER").filter(|s| !s.is_empty()) {
            self.cluster = cluster;
        }
        if let Some(cap) = lookup("KSYNC_QUEUE_CAP").and_then(|s| s.parse::<usize>().ok()) {
            self.queue.capacity = cap;
        }
        if let Some(ms) = lookup("KSYNC_COOLDOWN_MS").and_then(|s| s.parse::<u64>().ok()) {
            self.queue.cooldown_ms = ms;
        }
        if let Some(ms) = lookup("KSYNC_WATCH_RESTART_MS").and_then(|s| s.parse::<u64>().ok()) {
            self.watch_restart_delay_ms = ms;
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.cluster.trim().is_empty() {
            return Err(SyncError::Config("cluster name is empty".into()));
        }
        if self.resources.is_empty() {
            return Err(SyncError::Config("no resources configured".into()));
        }
        if self.queue.capacity == 0 {
            return Err(SyncError::Config("queue capacity must be positive".into()));
        }
        let mut seen = HashSet::new();
        for r in &self.resources {
            if r.version.is_empty() || r.resource.is_empty() {
                return Err(SyncError::Config(format!("resource {:?} needs version and resource", r)));
            }
            let key = r.kind_descriptor().to_string();
            if !seen.insert(key.clone()) {
                return Err(SyncError::Config(format!("duplicate resource {}", key)));
            }
        }
        Ok(())
    }

    pub fn watch_restart_delay(&self) -> Duration { Duration::from_millis(self.watch_restart_delay_ms) }
}
