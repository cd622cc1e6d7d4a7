//! Structured row selections and their SQL rendering.
//!
//! A [`RowSelection`] describes which rows of one table a transfer job
//! copies. It renders to a `SELECT` over the table aliased `c` (optionally
//! left-joined to a parent aliased `p`), which is wrapped into `COPY ... TO
//! STDOUT` for export or into `COUNT(*)` for validation.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::bucket::bucket_sql;
use crate::core::identifier::{aliased_column, quote_pg};
use crate::core::TableRef;
use crate::error::Result;

/// Child-to-parent join used by join-derived tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentJoin {
    pub parent_table: TableRef,
    pub child_key: String,
    pub parent_key: String,
}

/// A column of the selected table or of its joined parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "of", content = "column", rename_all = "snake_case")]
pub enum ColumnRef {
    Child(String),
    Parent(String),
}

impl ColumnRef {
    fn sql(&self) -> Result<String> {
        match self {
            ColumnRef::Child(name) => aliased_column("c", name),
            ColumnRef::Parent(name) => aliased_column("p", name),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ColumnRef::Child(name) | ColumnRef::Parent(name) => name,
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnRef::Child(name) => f.write_str(name),
            ColumnRef::Parent(name) => write!(f, "parent.{}", name),
        }
    }
}

/// How a key is mapped to a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BucketAssignment {
    /// Fibonacci hash of the key.
    Hash,
    /// Position of the key among the distinct subject ids, modulo N.
    RoundRobin {
        subject_table: TableRef,
        subject_column: String,
    },
    /// Contiguous block of the key's position among the distinct subject
    /// ids, sized like the uniform blocks of the subject table.
    SubjectBlock {
        subject_table: TableRef,
        subject_column: String,
    },
}

impl BucketAssignment {
    /// Window expression giving a subject's slot over `d.sid`, for the
    /// subject-rank assignments.
    fn slot_sql(&self, partitions: usize) -> Option<String> {
        match self {
            BucketAssignment::Hash => None,
            BucketAssignment::RoundRobin { .. } => Some(format!(
                "(row_number() OVER (ORDER BY d.sid) - 1) % {}",
                partitions
            )),
            BucketAssignment::SubjectBlock { .. } => {
                Some(format!("ntile({}) OVER (ORDER BY d.sid) - 1", partitions))
            }
        }
    }
}

/// Row filter applied after the optional parent join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum RowFilter {
    All,
    /// `ORDER BY order_by LIMIT limit OFFSET offset`.
    Block {
        order_by: Vec<ColumnRef>,
        offset: u64,
        limit: u64,
    },
    /// Rows whose key maps to bucket `index` of `partitions`.
    Bucket {
        key: ColumnRef,
        assignment: BucketAssignment,
        partitions: usize,
        index: usize,
    },
}

/// The rows of one table assigned to one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<ParentJoin>,
    pub filter: RowFilter,
}

impl RowSelection {
    /// Every row of the table.
    pub fn all() -> Self {
        Self {
            join: None,
            filter: RowFilter::All,
        }
    }

    /// `SELECT c.* ...` for this selection.
    pub fn select_sql(&self, table: &TableRef) -> Result<String> {
        let mut sql = format!("SELECT c.* FROM {} AS c", table.qualified()?);

        if let Some(join) = &self.join {
            sql.push_str(&format!(
                " LEFT JOIN {} AS p ON {} = {}",
                join.parent_table.qualified()?,
                aliased_column("c", &join.child_key)?,
                aliased_column("p", &join.parent_key)?
            ));
        }

        match &self.filter {
            RowFilter::All => {}
            RowFilter::Block {
                order_by,
                offset,
                limit,
            } => {
                let columns = order_by
                    .iter()
                    .map(ColumnRef::sql)
                    .collect::<Result<Vec<_>>>()?;
                sql.push_str(&format!(
                    " ORDER BY {} LIMIT {} OFFSET {}",
                    columns.join(", "),
                    limit,
                    offset
                ));
            }
            RowFilter::Bucket {
                key,
                assignment: BucketAssignment::Hash,
                partitions,
                index,
            } => {
                sql.push_str(&format!(
                    " WHERE {} = {}",
                    bucket_sql(&key.sql()?, *partitions),
                    index
                ));
            }
            RowFilter::Bucket {
                key,
                assignment:
                    assignment @ (BucketAssignment::RoundRobin {
                        subject_table,
                        subject_column,
                    }
                    | BucketAssignment::SubjectBlock {
                        subject_table,
                        subject_column,
                    }),
                partitions,
                index,
            } => {
                let subject = quote_pg(subject_column)?;
                let slot = assignment.slot_sql(*partitions).unwrap_or_default();
                sql.push_str(&format!(
                    " LEFT JOIN (SELECT d.sid, {slot} AS slot \
                     FROM (SELECT DISTINCT {col} AS sid FROM {table} WHERE {col} IS NOT NULL) AS d) AS r \
                     ON r.sid = {key} WHERE COALESCE(r.slot, 0) = {index}",
                    slot = slot,
                    col = subject,
                    table = subject_table.qualified()?,
                    key = key.sql()?,
                    index = index
                ));
            }
        }

        Ok(sql)
    }

    /// `SELECT COUNT(*)` over this selection.
    pub fn count_sql(&self, table: &TableRef) -> Result<String> {
        Ok(format!(
            "SELECT COUNT(*) FROM ({}) AS q",
            self.select_sql(table)?
        ))
    }

    /// Binary COPY export of this selection.
    pub fn copy_out_sql(&self, table: &TableRef) -> Result<String> {
        Ok(format!(
            "COPY ({}) TO STDOUT (FORMAT binary)",
            self.select_sql(table)?
        ))
    }
}

impl fmt::Display for RowSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            RowFilter::All => f.write_str("all rows")?,
            RowFilter::Block {
                order_by,
                offset,
                limit,
            } => {
                let keys: Vec<String> = order_by.iter().map(|c| c.to_string()).collect();
                write!(
                    f,
                    "rows {}..{} by {}",
                    offset,
                    offset + limit,
                    keys.join(", ")
                )?;
            }
            RowFilter::Bucket {
                key,
                assignment,
                partitions,
                index,
            } => {
                let kind = match assignment {
                    BucketAssignment::Hash => "hash",
                    BucketAssignment::RoundRobin { .. } => "round_robin",
                    BucketAssignment::SubjectBlock { .. } => "subject_block",
                };
                write!(f, "{}({}) mod {} = {}", kind, key, partitions, index)?;
            }
        }
        if let Some(join) = &self.join {
            write!(
                f,
                " via {} on {} = {}",
                join.parent_table, join.child_key, join.parent_key
            )?;
        }
        Ok(())
    }
}
