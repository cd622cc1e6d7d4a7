//! Post-run validation.
//!
//! The validator does not trust the run that produced the partitions: it
//! rebuilds the graph, metadata and rules from the source, derives the row
//! count every partition should hold and compares it with what the partition
//! actually holds.
//!
//! - **Per partition**: expected vs actual rows for every `(table, partition)`
//! - **Global**: split tables sum to the source total; replicated tables hold
//!   the source total everywhere
//! - **Schema**: each partition exposes the source's tables, columns and key
//!   constraints
//! - **Sampled rows**: a random sample of each source table is looked up by
//!   row fingerprint where the plan put it
//! - **NULL subjects**: rows without a subject id are reported as warnings
//!
//! Nothing short of a failing source catalog stops validation early.

mod report;

pub use report::{
    CountMismatch, IntegrityFinding, NullSubjectFinding, PartitionCount, SchemaFinding,
    SchemaIssue, TableValidation, ValidationReport,
};

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{DistributionPolicy, TableFilter};
use crate::core::{CatalogSource, PartitionSink, TableRef};
use crate::error::Result;
use crate::graph::build_graph;
use crate::plan::{build_plan, PlannedTable, RowFilter, TransferJob};
use crate::rules::RuleSettings;

/// Rows sampled per table for the integrity check.
pub const DEFAULT_SAMPLE_ROWS: usize = 100;

/// Compares partitions against the source.
pub struct ValidationEngine<'a, S: ?Sized> {
    source: &'a S,
    partitions: &'a [Arc<dyn PartitionSink>],
    settings: &'a RuleSettings,
    filter: &'a TableFilter,
    sample_rows: usize,
}

impl<'a, S> ValidationEngine<'a, S>
where
    S: CatalogSource + ?Sized,
{
    pub fn new(
        source: &'a S,
        partitions: &'a [Arc<dyn PartitionSink>],
        settings: &'a RuleSettings,
        filter: &'a TableFilter,
    ) -> Self {
        Self {
            source,
            partitions,
            settings,
            filter,
            sample_rows: DEFAULT_SAMPLE_ROWS,
        }
    }

    /// Rows sampled per table; 0 skips the integrity check.
    pub fn with_sample_rows(mut self, rows: usize) -> Self {
        self.sample_rows = rows;
        self
    }

    /// Validate the partitions as distributed under `policy`.
    pub async fn validate(&self, policy: DistributionPolicy) -> Result<ValidationReport> {
        let n = self.partitions.len();
        let graph = build_graph(self.source, &self.settings.schema).await?;
        let plan = build_plan(self.source, &graph, self.settings, self.filter, policy, n).await?;

        let mut report = ValidationReport::new(policy, n);
        report.skipped = plan.skipped.clone();

        let selected: Vec<TableRef> = graph
            .tables()
            .filter(|t| self.filter.matches(t))
            .cloned()
            .collect();
        self.check_schema(&selected, &mut report).await;

        for planned in &plan.tables {
            let validation = self.check_table(planned).await;
            if !validation.conserves_rows() {
                warn!(
                    "{}: partitions hold {} rows in total, source has {}",
                    planned.table,
                    validation.actual_total(),
                    validation.source_total
                );
                report.global_mismatches.push(planned.table.clone());
            }
            report.tables.insert(planned.table.clone(), validation);

            if self.sample_rows > 0 {
                self.check_integrity(planned, &mut report).await;
            }

            if planned.metadata.has_subject_id_column {
                self.check_null_subjects(&planned.table, &mut report).await;
            }
        }

        for m in report.mismatches() {
            match &m.error {
                Some(e) => warn!("{} partition {}: {}", m.table, m.partition, e),
                None => warn!(
                    "{} partition {}: expected {} rows, found {}",
                    m.table, m.partition, m.expected, m.actual
                ),
            }
        }
        info!("Validation: {}", report.summary());
        Ok(report)
    }

    async fn check_table(&self, planned: &PlannedTable) -> TableValidation {
        let mut validation = TableValidation {
            rule: planned.rule.to_string(),
            replicated: planned.rule.is_replicated(),
            source_total: planned.metadata.row_count,
            partitions: Default::default(),
        };

        for job in &planned.jobs {
            let count = self.check_job(planned, job).await;
            validation.partitions.insert(job.partition_index, count);
        }
        validation
    }

    async fn check_job(&self, planned: &PlannedTable, job: &TransferJob) -> PartitionCount {
        let mut errors = Vec::new();

        let expected = match self.expected_rows(planned, job).await {
            Ok(n) => n,
            Err(e) => {
                errors.push(format!("expected count: {}", e));
                0
            }
        };

        let actual = match self.partitions.get(job.partition_index) {
            Some(partition) => match partition.row_count(&job.table).await {
                Ok(n) => n,
                Err(e) => {
                    errors.push(format!("actual count: {}", e));
                    0
                }
            },
            None => {
                errors.push(format!("partition {} is not configured", job.partition_index));
                0
            }
        };

        PartitionCount {
            expected,
            actual,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
        }
    }

    /// Rows `job` should have put into its partition.
    async fn expected_rows(&self, planned: &PlannedTable, job: &TransferJob) -> Result<u64> {
        let total = planned.metadata.row_count;
        match &job.selection.filter {
            RowFilter::All => Ok(total),
            RowFilter::Block { offset, limit, .. } => {
                Ok((*limit).min(total.saturating_sub(*offset)))
            }
            RowFilter::Bucket { .. } => self.source.count_selected(&job.table, &job.selection).await,
        }
    }

    async fn check_schema(&self, tables: &[TableRef], report: &mut ValidationReport) {
        let expected: BTreeSet<&TableRef> = tables.iter().collect();

        for partition in self.partitions {
            let index = partition.index();
            let present = match partition.list_tables(&self.settings.schema).await {
                Ok(tables) => tables,
                Err(e) => {
                    report.schema_findings.push(SchemaFinding {
                        partition: index,
                        issue: SchemaIssue::Unreadable,
                        table: None,
                        detail: Some(e.to_string()),
                    });
                    continue;
                }
            };
            let present: BTreeSet<&TableRef> = present.iter().collect();

            for table in expected.difference(&present) {
                report.schema_findings.push(finding(index, SchemaIssue::MissingTable, table, None));
            }
            for table in present.difference(&expected) {
                if self.filter.matches(table) {
                    report
                        .schema_findings
                        .push(finding(index, SchemaIssue::ExtraTable, table, None));
                }
            }

            for table in expected.intersection(&present) {
                if self.check_columns(partition.as_ref(), table, report).await {
                    self.check_constraints(partition.as_ref(), table, report).await;
                }
            }
        }

        for f in &report.schema_findings {
            warn!(
                "Partition {}: {:?} {}{}",
                f.partition,
                f.issue,
                f.table.as_ref().map(|t| t.to_string()).unwrap_or_default(),
                f.detail.as_ref().map(|d| format!(" ({})", d)).unwrap_or_default()
            );
        }
    }

    /// False when either side's columns could not be read.
    async fn check_columns(
        &self,
        partition: &dyn PartitionSink,
        table: &TableRef,
        report: &mut ValidationReport,
    ) -> bool {
        let index = partition.index();
        let (source, target) = match (
            self.source.columns(table).await,
            partition.columns(table).await,
        ) {
            (Ok(s), Ok(t)) => (s, t),
            (Err(e), _) | (_, Err(e)) => {
                report.schema_findings.push(finding(
                    index,
                    SchemaIssue::Unreadable,
                    table,
                    Some(e.to_string()),
                ));
                return false;
            }
        };

        let source: Vec<&str> = source.iter().map(|c| c.name.as_str()).collect();
        let target: Vec<&str> = target.iter().map(|c| c.name.as_str()).collect();
        for column in source.iter().filter(|c| !target.contains(c)) {
            report.schema_findings.push(finding(
                index,
                SchemaIssue::MissingColumn,
                table,
                Some(column.to_string()),
            ));
        }
        for column in target.iter().filter(|c| !source.contains(c)) {
            report.schema_findings.push(finding(
                index,
                SchemaIssue::ExtraColumn,
                table,
                Some(column.to_string()),
            ));
        }
        true
    }

    async fn check_constraints(
        &self,
        partition: &dyn PartitionSink,
        table: &TableRef,
        report: &mut ValidationReport,
    ) {
        let index = partition.index();
        let (source, target) = match (
            self.source.constraints(table).await,
            partition.constraints(table).await,
        ) {
            (Ok(s), Ok(t)) => (s, t),
            (Err(e), _) | (_, Err(e)) => {
                report.schema_findings.push(finding(
                    index,
                    SchemaIssue::Unreadable,
                    table,
                    Some(e.to_string()),
                ));
                return;
            }
        };

        for constraint in source.iter().filter(|c| !target.iter().any(|t| t.same_shape(c))) {
            report.schema_findings.push(finding(
                index,
                SchemaIssue::MissingConstraint,
                table,
                Some(constraint.to_string()),
            ));
        }
        for constraint in target.iter().filter(|c| !source.iter().any(|s| s.same_shape(c))) {
            report.schema_findings.push(finding(
                index,
                SchemaIssue::ExtraConstraint,
                table,
                Some(constraint.to_string()),
            ));
        }
    }

    /// Look up a sample of source rows in the partitions holding the table.
    async fn check_integrity(&self, planned: &PlannedTable, report: &mut ValidationReport) {
        let table = &planned.table;
        let sample = match self.source.sample_rows(table, self.sample_rows).await {
            Ok(sample) => sample,
            Err(e) => {
                warn!("{}: could not sample source rows: {}", table, e);
                report.integrity.push(IntegrityFinding {
                    table: table.clone(),
                    partition: None,
                    sampled: 0,
                    missing: 0,
                    error: Some(format!("source sample: {}", e)),
                });
                return;
            }
        };
        let sampled: BTreeSet<&str> = sample.iter().map(String::as_str).collect();
        if sampled.is_empty() {
            return;
        }

        let replicated = planned.rule.is_replicated();
        let mut found_anywhere = BTreeSet::new();
        let mut complete = true;
        for job in &planned.jobs {
            // A partition missing from the list already fails the count check.
            let Some(partition) = self.partitions.get(job.partition_index) else {
                complete = false;
                continue;
            };
            match partition.matching_rows(table, &sample).await {
                Ok(found) => {
                    let missing = sampled.iter().filter(|f| !found.contains(**f)).count();
                    if replicated && missing > 0 {
                        report.integrity.push(IntegrityFinding {
                            table: table.clone(),
                            partition: Some(job.partition_index),
                            sampled: sampled.len(),
                            missing,
                            error: None,
                        });
                    }
                    found_anywhere.extend(found);
                }
                Err(e) => {
                    complete = false;
                    report.integrity.push(IntegrityFinding {
                        table: table.clone(),
                        partition: Some(job.partition_index),
                        sampled: sampled.len(),
                        missing: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if !replicated && complete {
            let missing = sampled
                .iter()
                .filter(|f| !found_anywhere.contains(**f))
                .count();
            if missing > 0 {
                report.integrity.push(IntegrityFinding {
                    table: table.clone(),
                    partition: None,
                    sampled: sampled.len(),
                    missing,
                    error: None,
                });
            }
        }

        for f in report.integrity.iter().filter(|f| &f.table == table) {
            match (&f.error, f.partition) {
                (Some(e), _) => warn!("{}: row lookup failed: {}", table, e),
                (None, Some(p)) => warn!(
                    "{} partition {}: {} of {} sampled rows missing",
                    table, p, f.missing, f.sampled
                ),
                (None, None) => warn!(
                    "{}: {} of {} sampled rows found in no partition",
                    table, f.missing, f.sampled
                ),
            }
        }
    }

    async fn check_null_subjects(&self, table: &TableRef, report: &mut ValidationReport) {
        for partition in self.partitions {
            match partition.null_count(table, &self.settings.subject_column).await {
                Ok(0) => {}
                Ok(rows) => {
                    warn!(
                        "{} partition {}: {} rows with NULL {}",
                        table,
                        partition.index(),
                        rows,
                        self.settings.subject_column
                    );
                    report.null_subjects.push(NullSubjectFinding {
                        table: table.clone(),
                        partition: partition.index(),
                        rows,
                    });
                }
                // The count mismatch check already reports unreadable tables.
                Err(_) => {}
            }
        }
    }
}

fn finding(
    partition: usize,
    issue: SchemaIssue,
    table: &TableRef,
    detail: Option<String>,
) -> SchemaFinding {
    SchemaFinding {
        partition,
        issue,
        table: Some(table.clone()),
        detail,
    }
}
