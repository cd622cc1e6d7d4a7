//! Table, column and foreign-key metadata types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::identifier::{qualify_pg, validate_identifier};
use crate::error::{PartitionError, Result};

/// A schema-qualified table name.
///
/// Ordered by `(schema, name)`, displayed and serialized as `schema.name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.name`, or a bare `name` placed in `default_schema`.
    pub fn parse_with_default(value: &str, default_schema: &str) -> Result<Self> {
        let table = match value.split_once('.') {
            Some((schema, name)) => TableRef::new(schema, name),
            None => TableRef::new(default_schema, value),
        };
        validate_identifier(&table.schema)?;
        validate_identifier(&table.name)?;
        Ok(table)
    }

    /// Quoted `"schema"."name"` for generated SQL.
    pub fn qualified(&self) -> Result<String> {
        qualify_pg(&self.schema, &self.name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

impl FromStr for TableRef {
    type Err = PartitionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((schema, name)) if !schema.is_empty() && !name.is_empty() => {
                Ok(TableRef::new(schema, name))
            }
            _ => Err(PartitionError::Config(format!(
                "table reference '{}' must be of the form schema.name",
                s
            ))),
        }
    }
}

impl TryFrom<String> for TableRef {
    type Error = PartitionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TableRef> for String {
    fn from(value: TableRef) -> Self {
        value.to_string()
    }
}

/// Column metadata as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Postgres type name (`bigint`, `integer`, `character varying`, ...).
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }

    /// True for the integer types a bucket hash can be computed over.
    pub fn is_integer(&self) -> bool {
        matches!(
            self.data_type.to_lowercase().as_str(),
            "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8" | "int"
        )
    }
}

/// One foreign-key constraint: `from` holds a key referencing `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyEdge {
    pub constraint_name: String,
    pub from: TableRef,
    pub to: TableRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    ForeignKey,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConstraintKind::PrimaryKey => "primary key",
            ConstraintKind::Unique => "unique",
            ConstraintKind::ForeignKey => "foreign key",
        })
    }
}

/// A key constraint on one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintInfo {
    pub name: String,
    pub kind: ConstraintKind,
    /// Constrained columns in key order.
    pub columns: Vec<String>,
    /// Referenced table of a foreign key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<TableRef>,
}

impl ConstraintInfo {
    /// Same kind, columns and referenced table. Names are not compared: a
    /// schema recreated from DDL may carry generated constraint names.
    pub fn same_shape(&self, other: &ConstraintInfo) -> bool {
        self.kind == other.kind
            && self.columns == other.columns
            && self.references == other.references
    }
}

impl fmt::Display for ConstraintInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.name, self.columns.join(", "))?;
        if let Some(target) = &self.references {
            write!(f, " references {}", target)?;
        }
        Ok(())
    }
}

/// Per-table facts used to pick a split rule.
///
/// Collected once per run and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub row_count: u64,
    pub has_subject_id_column: bool,
    pub is_reachable_from_subject_table: bool,
    pub hashable_key_column: Option<String>,
    /// Primary key columns in key order; empty when the table has none.
    pub primary_key: Vec<String>,
}
