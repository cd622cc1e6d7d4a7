//! Validation report types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::DistributionPolicy;
use crate::core::TableRef;
use crate::plan::SkippedTable;

/// Expected versus actual rows of one table in one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCount {
    pub expected: u64,
    pub actual: u64,
    /// Set when either count could not be obtained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PartitionCount {
    pub fn matches(&self) -> bool {
        self.error.is_none() && self.expected == self.actual
    }
}

/// Per-table validation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableValidation {
    /// Rule label, e.g. `ordinal_range(person_id)`.
    pub rule: String,
    pub replicated: bool,
    pub source_total: u64,
    pub partitions: BTreeMap<usize, PartitionCount>,
}

impl TableValidation {
    pub fn actual_total(&self) -> u64 {
        self.partitions.values().map(|c| c.actual).sum()
    }

    /// Split tables: partitions sum to the source total. Replicated tables:
    /// every partition holds the source total.
    pub fn conserves_rows(&self) -> bool {
        if self.partitions.values().any(|c| c.error.is_some()) {
            return false;
        }
        if self.replicated {
            self.partitions.values().all(|c| c.actual == self.source_total)
        } else {
            self.actual_total() == self.source_total
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaIssue {
    MissingTable,
    ExtraTable,
    MissingColumn,
    ExtraColumn,
    /// A primary key, unique or foreign-key constraint of the source table
    /// has no counterpart in the partition.
    MissingConstraint,
    ExtraConstraint,
    /// The partition catalog could not be read.
    Unreadable,
}

/// A difference between a partition's schema and the source's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaFinding {
    pub partition: usize,
    pub issue: SchemaIssue,
    pub table: Option<TableRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Rows with a NULL subject id that landed in a partition. Reported, not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullSubjectFinding {
    pub table: TableRef,
    pub partition: usize,
    pub rows: u64,
}

/// Sampled source rows that are not where the plan put them: in every
/// partition for a replicated table (`partition` set), in some partition
/// for a split table (`partition` unset).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityFinding {
    pub table: TableRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<usize>,
    /// Distinct rows in the sample.
    pub sampled: usize,
    pub missing: usize,
    /// Set when the sample or the lookup failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One row of [`ValidationReport::mismatches`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountMismatch {
    pub table: TableRef,
    pub partition: usize,
    pub expected: u64,
    pub actual: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal artifact of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub policy: DistributionPolicy,
    pub partitions: usize,
    pub tables: BTreeMap<TableRef, TableValidation>,
    /// Tables whose partitions do not add up to the source.
    pub global_mismatches: Vec<TableRef>,
    /// Tables whose rule could not be resolved, so nothing was checked.
    pub skipped: Vec<SkippedTable>,
    pub schema_findings: Vec<SchemaFinding>,
    #[serde(default)]
    pub integrity: Vec<IntegrityFinding>,
    pub null_subjects: Vec<NullSubjectFinding>,
}

impl ValidationReport {
    pub fn new(policy: DistributionPolicy, partitions: usize) -> Self {
        Self {
            policy,
            partitions,
            tables: BTreeMap::new(),
            global_mismatches: Vec::new(),
            skipped: Vec::new(),
            schema_findings: Vec::new(),
            integrity: Vec::new(),
            null_subjects: Vec::new(),
        }
    }

    /// Every `(table, partition)` whose count differs from the prediction.
    pub fn mismatches(&self) -> Vec<CountMismatch> {
        self.tables
            .iter()
            .flat_map(|(table, validation)| {
                validation
                    .partitions
                    .iter()
                    .filter(|(_, count)| !count.matches())
                    .map(move |(partition, count)| CountMismatch {
                        table: table.clone(),
                        partition: *partition,
                        expected: count.expected,
                        actual: count.actual,
                        error: count.error.clone(),
                    })
            })
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.global_mismatches.is_empty()
            && self.skipped.is_empty()
            && self.schema_findings.is_empty()
            && self.integrity.is_empty()
            && self.mismatches().is_empty()
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        let mismatches = self.mismatches().len();
        format!(
            "{} tables, {} partitions: {} count mismatches, {} global mismatches, {} skipped, {} schema findings, {} integrity findings, {} null-subject warnings",
            self.tables.len(),
            self.partitions,
            mismatches,
            self.global_mismatches.len(),
            self.skipped.len(),
            self.schema_findings.len(),
            self.integrity.len(),
            self.null_subjects.len()
        )
    }
}
