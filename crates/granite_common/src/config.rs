use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::ColumnSchema;

/// Top-level tablet server configuration (`granite.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraniteConfig {
    pub server: ServerConfig,
    pub tablet: TabletConfig,
    pub consensus: ConsensusConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub retention: RetentionConfig,
    pub log_gc: LogGcConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("invalid config: {0}")]
    Parse(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl GraniteConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: GraniteConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tablet.prepare_pool_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "tablet.prepare_pool_threads",
                reason: "must be at least 1".into(),
            });
        }
        if self.consensus.log_segment_entries == 0 {
            return Err(ConfigError::Invalid {
                field: "consensus.log_segment_entries",
                reason: "must be at least 1".into(),
            });
        }
        if self.tablet.consensus_backoff_max_exponent > 16 {
            return Err(ConfigError::Invalid {
                field: "tablet.consensus_backoff_max_exponent",
                reason: "must not exceed 16".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Identity of this tablet server in raft configurations.
    pub node_id: String,
    /// Prometheus exporter listen address. Empty disables the exporter.
    pub metrics_addr: String,
    /// Tables registered with the local catalog at startup.
    pub tables: Vec<HostedTableConfig>,
    /// Tablets opened at startup.
    pub tablets: Vec<HostedTabletConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: "ts-1".into(),
            metrics_addr: String::new(),
            tables: Vec::new(),
            tablets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedTableConfig {
    pub table_id: String,
    pub columns: Vec<ColumnSchema>,
}

/// One tablet hosted by this server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedTabletConfig {
    pub tablet_id: String,
    pub table_id: String,
    /// `true` for a transaction status tablet.
    #[serde(default)]
    pub transaction_status: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletConfig {
    /// Worker threads in the shared prepare pool.
    pub prepare_pool_threads: usize,
    /// Queued prepares beyond which new operations are rejected (ServiceUnavailable).
    pub prepare_queue_capacity: usize,
    /// Upper bound of operations tracked per tablet (0 = unlimited).
    pub max_in_flight_operations: usize,
    /// Poll interval of WaitUntilShutdown in milliseconds.
    pub shutdown_poll_interval_ms: u64,
    /// Interval between "still waiting" warnings during shutdown, in milliseconds.
    pub shutdown_report_interval_ms: u64,
    /// Wait after which shutdown logs at error level, in milliseconds.
    pub shutdown_max_wait_ms: u64,
    /// Cap of the `1 << exp` millisecond backoff of WaitUntilConsensusRunning.
    pub consensus_backoff_max_exponent: u32,
    /// How long a schema change waits for in-flight writes to drain, in milliseconds.
    pub write_pause_timeout_ms: u64,
    /// Default deadline of reads that do not carry one, in milliseconds.
    pub default_read_timeout_ms: u64,
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            prepare_pool_threads: 4,
            prepare_queue_capacity: 10_000,
            max_in_flight_operations: 0,
            shutdown_poll_interval_ms: 10,
            shutdown_report_interval_ms: 5_000,
            shutdown_max_wait_ms: 30_000,
            consensus_backoff_max_exponent: 8,
            write_pause_timeout_ms: 1_000,
            default_read_timeout_ms: 5_000,
        }
    }
}

impl TabletConfig {
    pub fn shutdown_poll_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_interval_ms.max(1))
    }

    pub fn shutdown_report_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_report_interval_ms)
    }

    pub fn shutdown_max_wait(&self) -> Duration {
        Duration::from_millis(self.shutdown_max_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Interval between leader heartbeats, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Length of the majority-replicated leader lease, in milliseconds.
    pub leader_lease_duration_ms: u64,
    /// When false, the lease is unbounded and safe time is not capped by it.
    pub leader_leases_enabled: bool,
    /// Entries per log segment; GC reclaims whole segments.
    pub log_segment_entries: usize,
    /// How long replicated client request ids are remembered, in seconds.
    pub retryable_request_timeout_secs: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 50,
            leader_lease_duration_ms: 2_000,
            leader_leases_enabled: true,
            log_segment_entries: 64,
            retryable_request_timeout_secs: 120,
        }
    }
}

impl ConsensusConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn leader_lease_duration(&self) -> Duration {
        Duration::from_millis(self.leader_lease_duration_ms)
    }

    pub fn retryable_request_timeout(&self) -> Duration {
        Duration::from_secs(self.retryable_request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Approximate memtable size that triggers a flush, in bytes (0 = manual flush only).
    pub memtable_flush_bytes: usize,
    /// Number of immutable files that triggers a background compaction.
    pub compaction_trigger_files: usize,
    /// Entries merged between two preemption checkpoints of a compaction.
    pub compaction_chunk_entries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            memtable_flush_bytes: 4 * 1024 * 1024,
            compaction_trigger_files: 4,
            compaction_chunk_entries: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrently running compaction tasks across all tablets.
    pub max_running_compactions: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_running_compactions: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// MVCC history kept below the current time, in seconds.
    pub history_retention_secs: u64,
    /// Minimum interval between two history cutoff propagations, in milliseconds.
    pub history_cutoff_propagation_interval_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            history_retention_secs: 900,
            history_cutoff_propagation_interval_ms: 180_000,
        }
    }
}

impl RetentionConfig {
    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_secs)
    }

    pub fn propagation_interval(&self) -> Duration {
        Duration::from_millis(self.history_cutoff_propagation_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogGcConfig {
    /// Enable the periodic log GC runner.
    pub enabled: bool,
    /// Interval between log GC passes, in milliseconds.
    pub interval_ms: u64,
}

impl Default for LogGcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_000,
        }
    }
}
