//! Interfaces to the systems around a distribution run.
//!
//! Creating database instances, packaging a populated partition and
//! publishing it to a registry are done by external tooling. The core only
//! talks to them through these traits. [`ConfiguredPartitions`] is the
//! provisioner used by the CLI: the partitions already exist and are listed
//! in the configuration.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::PartitionConfig;
use crate::error::{PartitionError, Result};

/// A partition database ready to receive rows.
#[derive(Debug, Clone)]
pub struct Partition {
    pub index: usize,
    pub connection: PartitionConfig,
}

/// Reference to a packaged partition (an image name, a dump path, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub partition: usize,
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Public,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Private => write!(f, "private"),
            Visibility::Public => write!(f, "public"),
        }
    }
}

#[async_trait]
pub trait ProvisionPartitions: Send + Sync {
    /// Return `n` partitions with indices `0..n`, schema already in place.
    async fn provision(&self, n: usize) -> Result<Vec<Partition>>;
}

#[async_trait]
pub trait TeardownPartitions: Send + Sync {
    async fn teardown(&self, partitions: &[Partition]) -> Result<()>;
}

#[async_trait]
pub trait PackagePartitionAsArtifact: Send + Sync {
    async fn package(&self, partition: &Partition) -> Result<ArtifactRef>;
}

#[async_trait]
pub trait PublishArtifact: Send + Sync {
    async fn publish(&self, artifact: &ArtifactRef, visibility: Visibility) -> Result<()>;
}

/// Partitions that already exist, as listed in the configuration.
#[derive(Debug, Clone)]
pub struct ConfiguredPartitions {
    partitions: Vec<PartitionConfig>,
}

impl ConfiguredPartitions {
    pub fn new(partitions: Vec<PartitionConfig>) -> Self {
        Self { partitions }
    }
}

#[async_trait]
impl ProvisionPartitions for ConfiguredPartitions {
    async fn provision(&self, n: usize) -> Result<Vec<Partition>> {
        if n != self.partitions.len() {
            return Err(PartitionError::Config(format!(
                "{} partitions requested but {} are configured",
                n,
                self.partitions.len()
            )));
        }
        Ok(self
            .partitions
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, connection)| Partition { index, connection })
            .collect())
    }
}

#[async_trait]
impl TeardownPartitions for ConfiguredPartitions {
    async fn teardown(&self, partitions: &[Partition]) -> Result<()> {
        // Configured databases are not owned by this process.
        info!("Leaving {} configured partitions in place", partitions.len());
        Ok(())
    }
}

/// Package every partition and publish the artifacts, in index order.
/// Stops at the first failure.
pub async fn publish_partitions(
    partitions: &[Partition],
    packager: &dyn PackagePartitionAsArtifact,
    publisher: &dyn PublishArtifact,
    visibility: Visibility,
) -> Result<Vec<ArtifactRef>> {
    let mut published = Vec::with_capacity(partitions.len());
    for partition in partitions {
        let artifact = packager.package(partition).await?;
        publisher.publish(&artifact, visibility).await?;
        info!(
            "Published partition {} as {} ({})",
            partition.index, artifact.reference, visibility
        );
        published.push(artifact);
    }
    Ok(published)
}
