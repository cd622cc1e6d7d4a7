//! # omop-partition
//!
//! Split an OMOP CDM PostgreSQL database into N schema-identical partitions.
//!
//! This library provides:
//!
//! - **Dependency analysis** of the foreign keys of the source schema
//! - **Split rules** per table: replication, ordinal ranges, hash split and
//!   join-derived placement through a parent table
//! - **Distribution policies** (uniform, hash, round robin) that turn rules
//!   into disjoint transfer jobs
//! - **Bulk transfer** with binary `COPY` from the source into each partition
//! - **Validation** of per-partition counts and row conservation
//!
//! ## Example
//!
//! ```rust,no_run
//! use omop_partition::{Config, Partitioner};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let partitioner = Partitioner::new(config).await?;
//!     let result = partitioner.run(CancellationToken::new()).await?;
//!     println!("Distributed {} rows", result.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod collaborators;
pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod plan;
pub mod rules;
pub mod transfer;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use collaborators::{
    ArtifactRef, ConfiguredPartitions, PackagePartitionAsArtifact, Partition, ProvisionPartitions,
    PublishArtifact, TeardownPartitions, Visibility,
};
pub use config::{Config, DistributionPolicy, PartitionConfig, SourceConfig, TargetMode};
pub use crate::core::{
    CatalogSource, CopySource, PartitionSink, SourceDatabase, TableMetadata, TableRef,
};
pub use error::{PartitionError, Result};
pub use graph::{build_graph, DependencyGraph};
pub use orchestrator::{HealthCheckResult, Partitioner, RunResult, RunStatus, SchemaAnalysis};
pub use plan::{build_plan, DistributionPlan, RowSelection, TransferJob};
pub use rules::{RuleSettings, SplitRule};
pub use transfer::{TransferEngine, TransferStats, TransferSummary};
pub use validate::{ValidationEngine, ValidationReport};
