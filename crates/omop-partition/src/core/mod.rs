//! Core types and traits shared by the planner, transfer engine and drivers.
//!
//! - [`schema`]: table references, columns, foreign keys and per-table metadata
//! - [`identifier`]: identifier validation and quoting
//! - [`traits`]: source and partition database seams

pub mod identifier;
pub mod schema;
pub mod traits;

pub use schema::{
    ColumnInfo, ConstraintInfo, ConstraintKind, ForeignKeyEdge, TableMetadata, TableRef,
};
pub use traits::{
    ByteStream, CatalogSource, CopySource, ImportWriter, PartitionSink, SourceDatabase,
};
