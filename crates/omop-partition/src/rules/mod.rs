//! Split-rule resolution.
//!
//! Every table gets exactly one [`SplitRule`] per run, chosen from its
//! [`TableMetadata`] and the configured join overrides.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::core::{CatalogSource, TableMetadata, TableRef};
use crate::error::{PartitionError, Result};
use crate::graph::DependencyGraph;

/// How a table's rows are divided among partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum SplitRule {
    /// Every partition receives every row.
    FullReplicate,
    /// Rows ordered by `order_column` and divided into partition slices.
    OrdinalRange { order_column: String },
    /// Rows assigned by a stable hash of `key_column`.
    HashSplit { key_column: String },
    /// Rows follow the partition of their parent row's subject.
    JoinDerived {
        parent_table: TableRef,
        child_key: String,
        parent_key: String,
        parent_subject_column: String,
    },
}

impl SplitRule {
    pub fn is_replicated(&self) -> bool {
        matches!(self, SplitRule::FullReplicate)
    }
}

impl fmt::Display for SplitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitRule::FullReplicate => write!(f, "full_replicate"),
            SplitRule::OrdinalRange { order_column } => {
                write!(f, "ordinal_range({})", order_column)
            }
            SplitRule::HashSplit { key_column } => write!(f, "hash_split({})", key_column),
            SplitRule::JoinDerived {
                parent_table,
                child_key,
                parent_key,
                parent_subject_column,
            } => write!(
                f,
                "join_derived({}.{} on {} = {})",
                parent_table, parent_subject_column, child_key, parent_key
            ),
        }
    }
}

/// A configured parent link for a table without its own subject column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOverride {
    pub parent_table: TableRef,
    pub child_key: String,
    pub parent_key: String,
    pub parent_subject_column: String,
}

/// Inputs to rule resolution that come from configuration.
#[derive(Debug, Clone)]
pub struct RuleSettings {
    pub schema: String,
    pub subject_table: TableRef,
    pub subject_column: String,
    pub large_table_threshold: u64,
    pub hash_key_pattern: String,
    pub overrides: BTreeMap<TableRef, JoinOverride>,
}

impl RuleSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let schema = config.source.schema.clone();
        let dist = &config.distribution;

        let mut overrides = BTreeMap::new();
        for link in &dist.join_overrides {
            let table = TableRef::parse_with_default(&link.table, &schema)?;
            let parent_table = TableRef::parse_with_default(&link.parent_table, &schema)?;
            overrides.insert(
                table,
                JoinOverride {
                    parent_table,
                    child_key: link.child_key.clone(),
                    parent_key: link.parent_key.clone(),
                    parent_subject_column: link.parent_subject_column.clone(),
                },
            );
        }

        Ok(Self {
            subject_table: config.subject_table()?,
            subject_column: dist.subject_column.clone(),
            large_table_threshold: dist.large_table_threshold,
            hash_key_pattern: dist.hash_key_pattern.clone(),
            overrides,
            schema,
        })
    }
}

/// Pick the split rule for one table.
///
/// Precedence: join override, subject linkage, large hashable lookup,
/// replication.
pub fn resolve(
    table: &TableRef,
    metadata: &TableMetadata,
    graph: &DependencyGraph,
    settings: &RuleSettings,
) -> Result<SplitRule> {
    if let Some(link) = settings.overrides.get(table) {
        if !graph.contains(&link.parent_table) {
            return Err(PartitionError::rule(
                table,
                format!(
                    "join override parent {} is not a table of the schema",
                    link.parent_table
                ),
            ));
        }
        return Ok(SplitRule::JoinDerived {
            parent_table: link.parent_table.clone(),
            child_key: link.child_key.clone(),
            parent_key: link.parent_key.clone(),
            parent_subject_column: link.parent_subject_column.clone(),
        });
    }

    if metadata.has_subject_id_column {
        return Ok(SplitRule::OrdinalRange {
            order_column: settings.subject_column.clone(),
        });
    }

    if metadata.is_reachable_from_subject_table {
        let order_column = metadata
            .primary_key
            .first()
            .cloned()
            .unwrap_or_else(|| "ctid".to_string());
        return Ok(SplitRule::OrdinalRange { order_column });
    }

    if metadata.row_count > settings.large_table_threshold {
        if let Some(key) = &metadata.hashable_key_column {
            return Ok(SplitRule::HashSplit {
                key_column: key.clone(),
            });
        }
    }

    Ok(SplitRule::FullReplicate)
}

/// Runs the per-table metadata queries against the source.
pub struct MetadataCollector<'a, S: ?Sized> {
    source: &'a S,
    graph: &'a DependencyGraph,
    settings: &'a RuleSettings,
}

impl<'a, S> MetadataCollector<'a, S>
where
    S: CatalogSource + ?Sized,
{
    pub fn new(source: &'a S, graph: &'a DependencyGraph, settings: &'a RuleSettings) -> Self {
        Self {
            source,
            graph,
            settings,
        }
    }

    /// Collect metadata for one table. Any query failure is a
    /// `RuleResolution` error for this table only.
    pub async fn collect(&self, table: &TableRef) -> Result<TableMetadata> {
        let columns = self
            .source
            .columns(table)
            .await
            .map_err(|e| PartitionError::rule(table, format!("listing columns: {}", e)))?;
        let primary_key = self
            .source
            .primary_key(table)
            .await
            .map_err(|e| PartitionError::rule(table, format!("reading primary key: {}", e)))?;
        let row_count = self
            .source
            .row_count(table)
            .await
            .map_err(|e| PartitionError::rule(table, format!("counting rows: {}", e)))?;

        let subject_column = &self.settings.subject_column;
        let has_subject_id_column = columns.iter().any(|c| &c.name == subject_column);
        let hashable_key_column = columns
            .iter()
            .find(|c| {
                &c.name != subject_column
                    && c.name.contains(&self.settings.hash_key_pattern)
                    && c.is_integer()
            })
            .map(|c| c.name.clone());
        let is_reachable_from_subject_table = table != &self.settings.subject_table
            && self.graph.has_path(table, &self.settings.subject_table);

        let metadata = TableMetadata {
            row_count,
            has_subject_id_column,
            is_reachable_from_subject_table,
            hashable_key_column,
            primary_key,
        };
        debug!("Metadata for {}: {:?}", table, metadata);
        Ok(metadata)
    }

    /// Collect metadata and resolve the rule in one step.
    pub async fn resolve(&self, table: &TableRef) -> Result<(TableMetadata, SplitRule)> {
        let metadata = self.collect(table).await?;
        let rule = resolve(table, &metadata, self.graph, self.settings)?;
        if let SplitRule::JoinDerived {
            parent_table,
            parent_key,
            ..
        } = &rule
        {
            self.require_unique_parent_key(table, parent_table, parent_key)
                .await?;
        }
        Ok((metadata, rule))
    }

    /// The child keeps rows without a parent (outer join), so the parent key
    /// must match at most one parent row or child rows would be duplicated.
    async fn require_unique_parent_key(
        &self,
        table: &TableRef,
        parent_table: &TableRef,
        parent_key: &str,
    ) -> Result<()> {
        let parent_pk = self.source.primary_key(parent_table).await.map_err(|e| {
            PartitionError::rule(table, format!("reading primary key of {}: {}", parent_table, e))
        })?;
        if parent_pk.len() != 1 || parent_pk[0] != parent_key {
            return Err(PartitionError::rule(
                table,
                format!(
                    "join key {}.{} is not the single-column primary key of {} ({})",
                    parent_table,
                    parent_key,
                    parent_table,
                    if parent_pk.is_empty() {
                        "none".to_string()
                    } else {
                        parent_pk.join(", ")
                    }
                ),
            ));
        }
        Ok(())
    }
}
