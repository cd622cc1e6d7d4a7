//! Partitioning orchestrator - main workflow coordinator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collaborators::{ConfiguredPartitions, ProvisionPartitions};
use crate::config::{Config, DistributionPolicy, TableFilter};
use crate::core::{PartitionSink, SourceDatabase, TableMetadata, TableRef};
use crate::drivers::{PgPartition, PgSource};
use crate::error::{
    PartitionError, Result, EXIT_CANCELLED, EXIT_TRANSFER_ERROR, EXIT_VALIDATION_FAILED,
};
use crate::graph::{build_graph, DependencyGraph};
use crate::plan::{build_plan, DistributionPlan, SkippedTable};
use crate::rules::{MetadataCollector, RuleSettings};
use crate::transfer::{FailedJob, PendingJob, TransferEngine};
use crate::validate::{ValidationEngine, ValidationReport};

/// Drives a distribution run against one source and its partitions.
pub struct Partitioner {
    config: Config,
    settings: RuleSettings,
    filter: TableFilter,
    source: Arc<dyn SourceDatabase>,
    partitions: Vec<Arc<dyn PartitionSink>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// At least one job failed.
    Failed,
    /// Every job ran but the partitions do not match the prediction.
    ValidationFailed,
    Cancelled,
}

/// Result of a distribution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique run identifier.
    pub run_id: String,

    pub status: RunStatus,

    pub policy: DistributionPolicy,

    pub partitions: usize,

    /// SHA256 of the configuration the run used.
    pub config_hash: String,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub tables_planned: usize,

    pub jobs_total: usize,

    pub jobs_completed: usize,

    pub rows_transferred: u64,

    pub bytes_transferred: u64,

    pub failed_jobs: Vec<FailedJob>,

    /// Jobs never started because the run was cancelled.
    pub not_started: Vec<PendingJob>,

    pub skipped_tables: Vec<SkippedTable>,

    /// Present when validation ran after the transfer.
    pub validation: Option<ValidationReport>,

    /// Why post-run validation could not produce a report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
}

impl RunResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Completed => 0,
            RunStatus::Failed => EXIT_TRANSFER_ERROR,
            RunStatus::ValidationFailed => EXIT_VALIDATION_FAILED,
            RunStatus::Cancelled => EXIT_CANCELLED,
        }
    }
}

/// Connectivity of one database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub location: String,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source: EndpointHealth,
    pub partitions: Vec<EndpointHealth>,
    pub healthy: bool,
}

/// Metadata and rule of one table, independent of the policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableAnalysis {
    pub table: TableRef,
    pub rule: String,
    pub replicated: bool,
    #[serde(flatten)]
    pub metadata: TableMetadata,
    /// Tables this one references.
    pub references: Vec<TableRef>,
    /// Rows each partition currently holds, by partition index. `None` where
    /// the count failed.
    pub partition_rows: Vec<Option<u64>>,
}

/// Output of [`Partitioner::analyze`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaAnalysis {
    pub schema: String,
    pub subject_table: TableRef,
    pub tables: Vec<TableAnalysis>,
    pub skipped: Vec<SkippedTable>,
    pub waves: Vec<Vec<TableRef>>,
}

impl Partitioner {
    /// Build connection pools for the configured source and partitions.
    ///
    /// No connection is opened here; operations that need the databases
    /// check them first.
    pub async fn new(config: Config) -> Result<Self> {
        let workers = config.workers();
        let provisioner = ConfiguredPartitions::new(config.partitions.clone());
        let provisioned = provisioner.provision(config.num_partitions()).await?;

        // Every running job holds one export stream; catalog queries need one more.
        let source_conns = config.source.max_connections.unwrap_or(workers + 2);
        let source = PgSource::lazy(&config.source, source_conns)?;

        let mut partitions: Vec<Arc<dyn PartitionSink>> = Vec::with_capacity(provisioned.len());
        for partition in &provisioned {
            let sink = PgPartition::lazy(partition.index, &partition.connection, workers + 1)?;
            partitions.push(Arc::new(sink));
        }

        Self::from_parts(config, Arc::new(source), partitions)
    }

    /// Use already constructed databases. `partitions[i]` must have index `i`.
    pub fn from_parts(
        config: Config,
        source: Arc<dyn SourceDatabase>,
        partitions: Vec<Arc<dyn PartitionSink>>,
    ) -> Result<Self> {
        if partitions.len() != config.num_partitions() {
            return Err(PartitionError::Config(format!(
                "{} partitions configured but {} supplied",
                config.num_partitions(),
                partitions.len()
            )));
        }
        if let Some((i, p)) = partitions.iter().enumerate().find(|(i, p)| p.index() != *i) {
            return Err(PartitionError::Config(format!(
                "partition at position {} reports index {}",
                i,
                p.index()
            )));
        }

        let settings = RuleSettings::from_config(&config)?;
        let filter = config.table_filter()?;
        Ok(Self {
            config,
            settings,
            filter,
            source,
            partitions,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the dependency graph of the source schema.
    pub async fn graph(&self) -> Result<DependencyGraph> {
        build_graph(self.source.as_ref(), &self.settings.schema).await
    }

    /// Graphviz rendering labelled with each table's split rule. With an
    /// anchor only the anchor and the tables that reach it are drawn.
    pub async fn graph_dot(&self, anchor: Option<&TableRef>) -> Result<String> {
        let graph = self.graph().await?;
        let plan = self.plan_with(&graph, self.config.distribution.policy).await?;
        let labels = plan.rule_labels();
        match anchor {
            Some(anchor) => {
                let related = graph.related_tables(anchor);
                if related.is_empty() {
                    return Err(PartitionError::Config(format!(
                        "{} is not a table of schema {}",
                        anchor, self.settings.schema
                    )));
                }
                Ok(graph.subgraph(&related).to_dot(&labels))
            }
            None => Ok(graph.to_dot(&labels)),
        }
    }

    /// Plan the jobs of a run under `policy` without transferring anything.
    pub async fn plan(&self, policy: DistributionPolicy) -> Result<DistributionPlan> {
        let graph = self.graph().await?;
        self.plan_with(&graph, policy).await
    }

    async fn plan_with(
        &self,
        graph: &DependencyGraph,
        policy: DistributionPolicy,
    ) -> Result<DistributionPlan> {
        build_plan(
            self.source.as_ref(),
            graph,
            &self.settings,
            &self.filter,
            policy,
            self.partitions.len(),
        )
        .await
    }

    /// Table metadata, split rules and current partition row counts.
    pub async fn analyze(&self) -> Result<SchemaAnalysis> {
        let graph = self.graph().await?;
        let collector = MetadataCollector::new(self.source.as_ref(), &graph, &self.settings);

        let mut tables = Vec::new();
        let mut skipped = Vec::new();
        for table in graph.tables().filter(|t| self.filter.matches(t)) {
            match collector.resolve(table).await {
                Ok((metadata, rule)) => tables.push(TableAnalysis {
                    table: table.clone(),
                    replicated: rule.is_replicated(),
                    rule: rule.to_string(),
                    metadata,
                    references: graph.references(table).cloned().collect(),
                    partition_rows: self.partition_rows(table).await,
                }),
                Err(e) => {
                    warn!("Skipping {}: {}", table, e);
                    skipped.push(SkippedTable {
                        table: table.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let waves = graph
            .load_waves()
            .into_iter()
            .map(|wave| {
                wave.into_iter()
                    .filter(|t| self.filter.matches(t))
                    .collect::<Vec<_>>()
            })
            .filter(|wave| !wave.is_empty())
            .collect();

        Ok(SchemaAnalysis {
            schema: self.settings.schema.clone(),
            subject_table: self.settings.subject_table.clone(),
            tables,
            skipped,
            waves,
        })
    }

    async fn partition_rows(&self, table: &TableRef) -> Vec<Option<u64>> {
        let mut counts = Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            match partition.row_count(table).await {
                Ok(rows) => counts.push(Some(rows)),
                Err(e) => {
                    warn!("{} partition {}: {}", table, partition.index(), e);
                    counts.push(None);
                }
            }
        }
        counts
    }

    /// Compare the partitions against the source under `policy`.
    pub async fn validate(&self, policy: DistributionPolicy) -> Result<ValidationReport> {
        let engine = ValidationEngine::new(
            self.source.as_ref(),
            &self.partitions,
            &self.settings,
            &self.filter,
        )
        .with_sample_rows(self.config.distribution.validation_sample_rows);
        let report = engine.validate(policy).await?;
        if report.is_success() {
            info!("Validation passed: {}", report.summary());
        } else {
            warn!("Validation failed: {}", report.summary());
        }
        Ok(report)
    }

    /// Ping the source and every partition.
    pub async fn health_check(&self) -> HealthCheckResult {
        let source = check_endpoint(
            format!(
                "{}:{}/{}",
                self.config.source.host, self.config.source.port, self.config.source.database
            ),
            self.source.ping(),
        )
        .await;

        let mut partitions = Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            partitions.push(check_endpoint(partition.describe(), partition.ping()).await);
        }

        let healthy = source.connected && partitions.iter().all(|p| p.connected);
        HealthCheckResult {
            source,
            partitions,
            healthy,
        }
    }

    /// Run the distribution.
    ///
    /// Failed jobs do not stop the run; they are listed in the result. After
    /// `cancel` fires (or the configured run timeout passes) no new job
    /// starts and running jobs finish.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let policy = self.config.distribution.policy;
        let workers = self.config.workers();

        info!(
            "Starting distribution run {} (policy: {}, partitions: {}, workers: {})",
            run_id,
            policy,
            self.partitions.len(),
            workers
        );

        // Phase 1: Check connectivity
        info!("Phase 1: Checking connections");
        self.require_connections().await?;

        // Phase 2: Build graph and plan
        info!("Phase 2: Building dependency graph and planning jobs");
        let graph = self.graph().await?;
        let plan = self.plan_with(&graph, policy).await?;
        info!(
            "Planned {} jobs for {} tables in {} waves ({} tables skipped)",
            plan.job_count(),
            plan.tables.len(),
            plan.waves.len(),
            plan.skipped.len()
        );

        // Phase 3: Transfer data
        info!(
            "Phase 3: Transferring data (mode: {:?})",
            self.config.distribution.target_mode
        );
        let run_cancel = cancel.child_token();
        let watchdog = self.config.distribution.run_timeout_secs.map(|secs| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                warn!("Run timeout of {}s reached, no new jobs will start", secs);
                token.cancel();
            })
        });

        let engine = Arc::new(TransferEngine::new(
            Arc::clone(&self.source),
            self.partitions.clone(),
            self.config.distribution.target_mode,
        ));
        let planned: Vec<TableRef> = plan.tables.iter().map(|t| t.table.clone()).collect();
        engine.prepare(&planned).await?;
        let summary = engine
            .run_waves(plan.job_waves(), workers, run_cancel)
            .await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        // Phase 4: Validate
        let mut validation_error = None;
        let validation = if summary.cancelled {
            warn!("Skipping validation of a cancelled run");
            None
        } else if self.config.distribution.validate_after_run {
            info!("Phase 4: Validating partitions");
            match self.validate(policy).await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("Validation could not run: {}", e);
                    validation_error = Some(e.to_string());
                    None
                }
            }
        } else {
            None
        };

        let status = if summary.cancelled {
            RunStatus::Cancelled
        } else if !summary.failed.is_empty() {
            RunStatus::Failed
        } else if validation_error.is_some()
            || validation.as_ref().is_some_and(|r| !r.is_success())
        {
            RunStatus::ValidationFailed
        } else {
            RunStatus::Completed
        };

        let completed_at = Utc::now();
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let result = RunResult {
            run_id,
            status,
            policy,
            partitions: self.partitions.len(),
            config_hash: self.config.hash(),
            started_at,
            completed_at,
            duration_seconds,
            tables_planned: plan.tables.len(),
            jobs_total: plan.job_count(),
            jobs_completed: summary.completed.len(),
            rows_transferred: summary.rows(),
            bytes_transferred: summary.bytes(),
            failed_jobs: summary.failed,
            not_started: summary.not_started,
            skipped_tables: plan.skipped,
            validation,
            validation_error,
        };

        info!(
            "Run {:?}: {}/{} jobs, {} rows in {:.1}s",
            result.status,
            result.jobs_completed,
            result.jobs_total,
            result.rows_transferred,
            result.duration_seconds
        );
        Ok(result)
    }

    /// Fail with the first unreachable database.
    async fn require_connections(&self) -> Result<()> {
        self.source.ping().await?;
        for partition in &self.partitions {
            partition.ping().await.map_err(|e| {
                PartitionError::pool(
                    e,
                    format!("partition {} ({})", partition.index(), partition.describe()),
                )
            })?;
        }
        Ok(())
    }

    /// Release pooled connections.
    pub fn close(&self) {
        self.source.close();
        for partition in &self.partitions {
            partition.close();
        }
    }
}

async fn check_endpoint<F>(location: String, ping: F) -> EndpointHealth
where
    F: std::future::Future<Output = Result<()>>,
{
    let start = Instant::now();
    let outcome = ping.await;
    let latency_ms = start.elapsed().as_millis() as u64;
    match outcome {
        Ok(()) => EndpointHealth {
            location,
            connected: true,
            latency_ms,
            error: None,
        },
        Err(e) => EndpointHealth {
            location,
            connected: false,
            latency_ms,
            error: Some(e.to_string()),
        },
    }
}
