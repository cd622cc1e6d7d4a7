//! Configuration type definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PartitionError;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration.
    pub source: SourceConfig,

    /// Partition databases; the index of an entry is the partition index.
    pub partitions: Vec<PartitionConfig>,

    /// Distribution behavior configuration.
    #[serde(default)]
    pub distribution: DistributionConfig,
}

impl Config {
    /// Number of partitions (`N`).
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Concurrent transfer jobs. Defaults to the partition count clamped to 2..=8.
    pub fn workers(&self) -> usize {
        self.distribution
            .workers
            .unwrap_or_else(|| self.num_partitions().clamp(2, 8))
    }
}

/// Source database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// CDM schema (default: "omopcdm"). Partitions use the same schema name.
    #[serde(default = "default_cdm_schema")]
    pub schema: String,

    /// SSL mode (default: "disable").
    #[serde(default = "default_disable")]
    pub ssl_mode: String,

    /// Pool size for the source (default: workers + 2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// One partition database.
#[derive(Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode (default: "disable").
    #[serde(default = "default_disable")]
    pub ssl_mode: String,
}

impl PartitionConfig {
    /// `host:port/database`, used in logs and reports.
    pub fn location(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

impl fmt::Debug for PartitionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// How split tables are divided among partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributionPolicy {
    /// Contiguous ordinal blocks of equal size.
    #[default]
    Uniform,
    /// Subjects assigned by a stable hash of the subject id.
    Hash,
    /// Subjects dealt out in ascending id order.
    RoundRobin,
}

impl fmt::Display for DistributionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DistributionPolicy::Uniform => "uniform",
            DistributionPolicy::Hash => "hash",
            DistributionPolicy::RoundRobin => "round_robin",
        };
        f.write_str(name)
    }
}

impl FromStr for DistributionPolicy {
    type Err = PartitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "uniform" => Ok(DistributionPolicy::Uniform),
            "hash" => Ok(DistributionPolicy::Hash),
            "round_robin" | "roundrobin" => Ok(DistributionPolicy::RoundRobin),
            other => Err(PartitionError::Config(format!(
                "Invalid distribution policy '{}'. Valid values: uniform, hash, round_robin",
                other
            ))),
        }
    }
}

/// What happens to existing rows in a partition table before import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    /// Empty the planned tables once before loading, so reruns replace.
    #[default]
    Truncate,
    /// Keep existing rows.
    Append,
}

/// A child table that inherits its split from a parent through a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOverrideConfig {
    /// Child table (`name` or `schema.name`).
    pub table: String,
    /// Parent table carrying the subject column.
    pub parent_table: String,
    pub child_key: String,
    pub parent_key: String,
    #[serde(default = "default_subject_column")]
    pub parent_subject_column: String,
}

/// Distribution behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    #[serde(default)]
    pub policy: DistributionPolicy,

    /// Row count above which a lookup table with a hashable key is split
    /// instead of replicated (default: 1,000,000).
    #[serde(default = "default_large_table_threshold")]
    pub large_table_threshold: u64,

    /// Table holding one row per subject (default: "person").
    #[serde(default = "default_subject_table")]
    pub subject_table: String,

    /// Subject id column (default: "person_id").
    #[serde(default = "default_subject_column")]
    pub subject_column: String,

    /// Substring identifying hashable key columns (default: "concept_id").
    #[serde(default = "default_hash_key_pattern")]
    pub hash_key_pattern: String,

    #[serde(default = "default_join_overrides")]
    pub join_overrides: Vec<JoinOverrideConfig>,

    /// Tables to include (glob patterns over table names).
    #[serde(default)]
    pub include_tables: Vec<String>,

    /// Tables to exclude (glob patterns over table names).
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Concurrent transfer jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    #[serde(default)]
    pub target_mode: TargetMode,

    /// Stop scheduling new jobs after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,

    /// Run validation after the transfer phase (default: true).
    #[serde(default = "default_true")]
    pub validate_after_run: bool,

    /// Source rows per table looked up in the partitions during validation
    /// (default: 100, 0 disables the lookup).
    #[serde(default = "default_validation_sample_rows")]
    pub validation_sample_rows: usize,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            policy: DistributionPolicy::default(),
            large_table_threshold: default_large_table_threshold(),
            subject_table: default_subject_table(),
            subject_column: default_subject_column(),
            hash_key_pattern: default_hash_key_pattern(),
            join_overrides: default_join_overrides(),
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            workers: None,
            target_mode: TargetMode::default(),
            run_timeout_secs: None,
            validate_after_run: true,
            validation_sample_rows: default_validation_sample_rows(),
        }
    }
}

fn default_pg_port() -> u16 {
    5432
}

fn default_cdm_schema() -> String {
    "omopcdm".to_string()
}

fn default_disable() -> String {
    "disable".to_string()
}

fn default_large_table_threshold() -> u64 {
    1_000_000
}

fn default_validation_sample_rows() -> usize {
    crate::validate::DEFAULT_SAMPLE_ROWS
}

fn default_subject_table() -> String {
    "person".to_string()
}

fn default_subject_column() -> String {
    "person_id".to_string()
}

fn default_hash_key_pattern() -> String {
    "concept_id".to_string()
}

fn default_join_overrides() -> Vec<JoinOverrideConfig> {
    vec![JoinOverrideConfig {
        table: "episode_event".to_string(),
        parent_table: "episode".to_string(),
        child_key: "episode_id".to_string(),
        parent_key: "episode_id".to_string(),
        parent_subject_column: default_subject_column(),
    }]
}

fn default_true() -> bool {
    true
}
