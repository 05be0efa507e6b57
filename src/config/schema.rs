use crate::dispatch::indexing::{DEFAULT_INDEXING_DELAY, DEFAULT_MAX_BATCH};
use crate::dispatch::neuron::DEFAULT_SYSTEM_OWNER;
use crate::error::ConfigError;
use crate::queue::DEFAULT_SCHEDULER_THREADS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Path the config was loaded from, if any - not serialized
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub message: MessageConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub services: ServicesConfig,

    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

// ── Message broker ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageConfig {
    /// Broker host name, `host:port`, or a full `amqp://` URI.
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Queue this broker consumes from.
    #[serde(default)]
    pub receive_queue: String,
    #[serde(default)]
    pub success_exchange: Option<String>,
    #[serde(default)]
    pub error_exchange: Option<String>,
    /// Workstation exchange used by the agent broker.
    #[serde(default)]
    pub forward_exchange: Option<String>,
    #[serde(default)]
    pub routing_key: String,
    /// Counted connect attempts; zero or negative retries forever.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: i32,
    #[serde(default = "default_retry_pause_ms")]
    pub retry_pause_ms: u64,
    /// Delivery workers; zero uses the transport default of one.
    #[serde(default)]
    pub consumer_threads: usize,
    #[serde(default = "default_true")]
    pub auto_ack: bool,
}

fn default_connect_retries() -> i32 {
    3
}

fn default_retry_pause_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            password: String::new(),
            receive_queue: String::new(),
            success_exchange: None,
            error_exchange: None,
            forward_exchange: None,
            routing_key: String::new(),
            connect_retries: default_connect_retries(),
            retry_pause_ms: default_retry_pause_ms(),
            consumer_threads: 0,
            auto_ack: default_true(),
        }
    }
}

// ── Backup ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default = "default_backup_interval_ms")]
    pub interval_ms: u64,
    /// Path prefix; the weekday name is appended.
    #[serde(default)]
    pub location: Option<String>,
}

fn default_backup_interval_ms() -> u64 {
    86_400_000
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            queue: None,
            interval_ms: default_backup_interval_ms(),
            location: None,
        }
    }
}

impl BackupConfig {
    /// Both a queue and a location are needed for snapshots to run.
    pub fn enabled(&self) -> Option<(&str, &str)> {
        let queue = self.queue.as_deref().filter(|q| !q.trim().is_empty())?;
        let location = self.location.as_deref().filter(|l| !l.trim().is_empty())?;
        Some((queue, location))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

// ── REST services ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub persistence_server: Option<String>,
    #[serde(default)]
    pub indexing_server: Option<String>,
    #[serde(default)]
    pub agent_server: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Shared owner whose neurons anyone may claim.
    #[serde(default = "default_system_owner")]
    pub system_owner: String,
}

fn default_system_owner() -> String {
    DEFAULT_SYSTEM_OWNER.into()
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            persistence_server: None,
            indexing_server: None,
            agent_server: None,
            api_key: None,
            system_owner: default_system_owner(),
        }
    }
}

// ── Indexing flush ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Grace period during which repeated work is coalesced.
    #[serde(default = "default_indexing_secs")]
    pub delay_secs: u64,
    #[serde(default = "default_indexing_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_indexing_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

fn default_indexing_secs() -> u64 {
    DEFAULT_INDEXING_DELAY.as_secs()
}

fn default_max_batch() -> usize {
    DEFAULT_MAX_BATCH
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_indexing_secs(),
            flush_interval_secs: default_indexing_secs(),
            initial_delay_secs: default_indexing_secs(),
            max_batch: default_max_batch(),
        }
    }
}

// ── Periodic scheduler ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_threads")]
    pub threads: usize,
}

fn default_scheduler_threads() -> usize {
    DEFAULT_SCHEDULER_THREADS
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: default_scheduler_threads(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.message.host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "message.host is required (--ms or NEURONBROKER_MESSAGE_HOST)".into(),
            ));
        }
        if self.message.receive_queue.trim().is_empty() {
            return Err(ConfigError::Validation(
                "message.receive_queue is required (--rec)".into(),
            ));
        }
        if self.indexing.max_batch == 0 {
            return Err(ConfigError::Validation(
                "indexing.max_batch must be >= 1".into(),
            ));
        }
        if self.scheduler.threads == 0 {
            return Err(ConfigError::Validation(
                "scheduler.threads must be >= 1".into(),
            ));
        }
        if self.backup.queue.is_some() != self.backup.location.is_some() {
            tracing::warn!("Backup needs both a queue and a location; snapshots are disabled");
        }
        Ok(())
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.message.retry_pause_ms)
    }
}
