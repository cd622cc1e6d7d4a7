//! Distribution planning: turn each table's split rule into transfer jobs.
//!
//! A [`Planner`] is a stateless strategy selected by [`DistributionPolicy`].
//! For a split table the jobs it produces are disjoint and together cover
//! every source row; for a replicated table every job selects every row.

mod bucket;
mod hash;
mod round_robin;
mod selection;
mod uniform;

pub use bucket::{bucket_for, bucket_of, bucket_sql, FIBONACCI_MULTIPLIER};
pub use hash::HashPlanner;
pub use round_robin::RoundRobinPlanner;
pub use selection::{BucketAssignment, ColumnRef, ParentJoin, RowFilter, RowSelection};
pub use uniform::UniformPlanner;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use crate::config::DistributionPolicy;
use crate::config::TableFilter;
use crate::core::{CatalogSource, TableMetadata, TableRef};
use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::rules::{MetadataCollector, RuleSettings, SplitRule};

/// Copy one row selection of one table into one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferJob {
    pub table: TableRef,
    pub partition_index: usize,
    pub selection: RowSelection,
}

/// Run-wide inputs every planner needs.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub partitions: usize,
    pub subject_table: TableRef,
    pub subject_column: String,
}

/// Strategy turning a split rule into per-partition jobs.
pub trait Planner: Send + Sync {
    fn policy(&self) -> DistributionPolicy;

    /// Exactly one job per partition.
    fn plan_jobs(
        &self,
        table: &TableRef,
        rule: &SplitRule,
        metadata: &TableMetadata,
        ctx: &PlanContext,
    ) -> Vec<TransferJob>;
}

/// The planner for a policy.
pub fn planner_for(policy: DistributionPolicy) -> Box<dyn Planner> {
    match policy {
        DistributionPolicy::Uniform => Box::new(UniformPlanner),
        DistributionPolicy::Hash => Box::new(HashPlanner),
        DistributionPolicy::RoundRobin => Box::new(RoundRobinPlanner),
    }
}

/// `(offset, limit)` of partition `index` when `total` rows are cut into
/// `partitions` contiguous blocks; the first `total % partitions` blocks get
/// one extra row.
pub fn block_bounds(total: u64, partitions: usize, index: usize) -> (u64, u64) {
    let n = partitions as u64;
    let i = index as u64;
    let base = total / n;
    let remainder = total % n;
    let offset = i * base + i.min(remainder);
    let limit = base + u64::from(i < remainder);
    (offset, limit)
}

fn jobs_from(
    table: &TableRef,
    partitions: usize,
    mut selection_for: impl FnMut(usize) -> RowSelection,
) -> Vec<TransferJob> {
    (0..partitions)
        .map(|index| TransferJob {
            table: table.clone(),
            partition_index: index,
            selection: selection_for(index),
        })
        .collect()
}

pub(crate) fn replicate_jobs(table: &TableRef, partitions: usize) -> Vec<TransferJob> {
    jobs_from(table, partitions, |_| RowSelection::all())
}

pub(crate) fn block_jobs(
    table: &TableRef,
    partitions: usize,
    total: u64,
    join: Option<ParentJoin>,
    order_by: Vec<ColumnRef>,
) -> Vec<TransferJob> {
    jobs_from(table, partitions, |index| {
        let (offset, limit) = block_bounds(total, partitions, index);
        RowSelection {
            join: join.clone(),
            filter: RowFilter::Block {
                order_by: order_by.clone(),
                offset,
                limit,
            },
        }
    })
}

pub(crate) fn bucket_jobs(
    table: &TableRef,
    partitions: usize,
    join: Option<ParentJoin>,
    key: ColumnRef,
    assignment: BucketAssignment,
) -> Vec<TransferJob> {
    jobs_from(table, partitions, |index| RowSelection {
        join: join.clone(),
        filter: RowFilter::Bucket {
            key: key.clone(),
            assignment: assignment.clone(),
            partitions,
            index,
        },
    })
}

/// Total order for ordinal blocks: the order column, then the remaining
/// primary key columns, then `ctid` when there is no primary key.
pub(crate) fn ordinal_order(order_column: &str, metadata: &TableMetadata) -> Vec<ColumnRef> {
    let mut order = vec![ColumnRef::Child(order_column.to_string())];
    if order_column == "ctid" {
        return order;
    }
    if metadata.primary_key.is_empty() {
        order.push(ColumnRef::Child("ctid".to_string()));
    } else {
        order.extend(
            metadata
                .primary_key
                .iter()
                .filter(|c| c.as_str() != order_column)
                .map(|c| ColumnRef::Child(c.clone())),
        );
    }
    order
}

pub(crate) fn parent_join(rule: &SplitRule) -> Option<ParentJoin> {
    match rule {
        SplitRule::JoinDerived {
            parent_table,
            child_key,
            parent_key,
            ..
        } => Some(ParentJoin {
            parent_table: parent_table.clone(),
            child_key: child_key.clone(),
            parent_key: parent_key.clone(),
        }),
        _ => None,
    }
}

/// Shared by the hash and round-robin planners: subject-linked rows follow
/// `assignment` of their subject id.
pub(crate) fn subject_bucket_jobs(
    table: &TableRef,
    rule: &SplitRule,
    metadata: &TableMetadata,
    ctx: &PlanContext,
    assignment: BucketAssignment,
) -> Vec<TransferJob> {
    let n = ctx.partitions;
    match rule {
        SplitRule::FullReplicate => replicate_jobs(table, n),
        SplitRule::HashSplit { key_column } => bucket_jobs(
            table,
            n,
            None,
            ColumnRef::Child(key_column.clone()),
            BucketAssignment::Hash,
        ),
        SplitRule::OrdinalRange { .. } if metadata.has_subject_id_column => bucket_jobs(
            table,
            n,
            None,
            ColumnRef::Child(ctx.subject_column.clone()),
            assignment,
        ),
        SplitRule::OrdinalRange { order_column } => {
            warn!(
                "{} has no {} column; falling back to uniform blocks ordered by {}",
                table, ctx.subject_column, order_column
            );
            block_jobs(
                table,
                n,
                metadata.row_count,
                None,
                ordinal_order(order_column, metadata),
            )
        }
        SplitRule::JoinDerived {
            parent_subject_column,
            ..
        } => bucket_jobs(
            table,
            n,
            parent_join(rule),
            ColumnRef::Parent(parent_subject_column.clone()),
            assignment,
        ),
    }
}

/// A table that could not be planned, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTable {
    pub table: TableRef,
    pub reason: String,
}

/// One planned table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTable {
    pub table: TableRef,
    pub rule: SplitRule,
    pub metadata: TableMetadata,
    pub jobs: Vec<TransferJob>,
}

/// The full set of jobs for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionPlan {
    pub policy: DistributionPolicy,
    pub partitions: usize,
    /// Planned tables in load-wave order.
    pub tables: Vec<PlannedTable>,
    pub skipped: Vec<SkippedTable>,
    /// Load waves restricted to the planned tables.
    pub waves: Vec<Vec<TableRef>>,
}

impl DistributionPlan {
    pub fn job_count(&self) -> usize {
        self.tables.iter().map(|t| t.jobs.len()).sum()
    }

    pub fn table(&self, table: &TableRef) -> Option<&PlannedTable> {
        self.tables.iter().find(|t| &t.table == table)
    }

    /// Jobs grouped by load wave.
    pub fn job_waves(&self) -> Vec<Vec<TransferJob>> {
        self.waves
            .iter()
            .map(|wave| {
                wave.iter()
                    .filter_map(|table| self.table(table))
                    .flat_map(|planned| planned.jobs.iter().cloned())
                    .collect()
            })
            .collect()
    }

    /// `table -> rule` labels for graph rendering.
    pub fn rule_labels(&self) -> BTreeMap<TableRef, String> {
        self.tables
            .iter()
            .map(|t| (t.table.clone(), t.rule.to_string()))
            .collect()
    }
}

/// Resolve every selected table of `graph` and plan its jobs.
///
/// Tables whose metadata cannot be collected are recorded as skipped.
pub async fn build_plan<S>(
    source: &S,
    graph: &DependencyGraph,
    settings: &RuleSettings,
    filter: &TableFilter,
    policy: DistributionPolicy,
    partitions: usize,
) -> Result<DistributionPlan>
where
    S: CatalogSource + ?Sized,
{
    let planner = planner_for(policy);
    let collector = MetadataCollector::new(source, graph, settings);
    let ctx = PlanContext {
        partitions,
        subject_table: settings.subject_table.clone(),
        subject_column: settings.subject_column.clone(),
    };

    let mut planned = Vec::new();
    let mut skipped = Vec::new();
    for table in graph.tables().filter(|t| filter.matches(t)) {
        match collector.resolve(table).await {
            Ok((metadata, rule)) => {
                let jobs = planner.plan_jobs(table, &rule, &metadata, &ctx);
                info!(
                    "{}: {} ({} rows, {} jobs)",
                    table,
                    rule,
                    metadata.row_count,
                    jobs.len()
                );
                planned.push(PlannedTable {
                    table: table.clone(),
                    rule,
                    metadata,
                    jobs,
                });
            }
            Err(e) => {
                warn!("Skipping {}: {}", table, e);
                skipped.push(SkippedTable {
                    table: table.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    let selected: BTreeSet<&TableRef> = planned.iter().map(|t| &t.table).collect();
    let waves: Vec<Vec<TableRef>> = graph
        .load_waves()
        .into_iter()
        .map(|wave| wave.into_iter().filter(|t| selected.contains(t)).collect())
        .filter(|wave: &Vec<TableRef>| !wave.is_empty())
        .collect();

    let order: Vec<&TableRef> = waves.iter().flatten().collect();
    planned.sort_by_key(|p| order.iter().position(|t| *t == &p.table));

    Ok(DistributionPlan {
        policy,
        partitions,
        tables: planned,
        skipped,
        waves,
    })
}
