//! Core traits at the database seams.
//!
//! - [`CatalogSource`]: schema catalog, counts, row samples and per-selection counts on the source
//! - [`CopySource`]: binary COPY export of a row selection
//! - [`PartitionSink`]: counts, catalog and row lookups, truncation and binary COPY import on a partition
//! - [`ImportWriter`]: one open import (transaction + COPY) on a partition
//!
//! The Postgres drivers implement these against live databases; the unit tests
//! implement them over an in-memory catalog.

use std::collections::BTreeSet;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::Result;
use crate::plan::RowSelection;

use super::schema::{ColumnInfo, ConstraintInfo, ForeignKeyEdge, TableRef};

/// Stream of raw binary COPY chunks (header, tuples and trailer).
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Read catalog information and counts from the source database.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// All base tables of `schema`.
    async fn list_tables(&self, schema: &str) -> Result<Vec<TableRef>>;

    /// Every foreign-key constraint whose referencing table lives in `schema`.
    async fn foreign_keys(&self, schema: &str) -> Result<Vec<ForeignKeyEdge>>;

    /// Columns of a table in ordinal order.
    async fn columns(&self, table: &TableRef) -> Result<Vec<ColumnInfo>>;

    /// Primary key columns in key order (empty when there is none).
    async fn primary_key(&self, table: &TableRef) -> Result<Vec<String>>;

    /// Primary key, unique and foreign-key constraints of a table.
    async fn constraints(&self, table: &TableRef) -> Result<Vec<ConstraintInfo>>;

    /// Exact row count.
    async fn row_count(&self, table: &TableRef) -> Result<u64>;

    /// Fingerprints of up to `limit` rows picked at random. A fingerprint is
    /// a digest of the row's text form, so equal rows share one.
    async fn sample_rows(&self, table: &TableRef, limit: usize) -> Result<Vec<String>>;

    /// Number of rows a selection yields.
    async fn count_selected(&self, table: &TableRef, selection: &RowSelection) -> Result<u64>;

    /// Cheap round trip used by health checks.
    async fn ping(&self) -> Result<()>;
}

/// Export row selections in binary COPY format.
#[async_trait]
pub trait CopySource: Send + Sync {
    /// Start exporting `selection`. The stream holds its own connection until
    /// it is dropped or exhausted.
    async fn export(&self, table: &TableRef, selection: &RowSelection) -> Result<ByteStream>;
}

/// Everything the engine needs from the source.
pub trait SourceDatabase: CatalogSource + CopySource {
    /// Release pooled connections.
    fn close(&self) {}
}

/// One partition database.
#[async_trait]
pub trait PartitionSink: Send + Sync {
    /// Position of this partition in the configured list.
    fn index(&self) -> usize;

    /// Human readable location (`host:port/database`).
    fn describe(&self) -> String;

    async fn list_tables(&self, schema: &str) -> Result<Vec<TableRef>>;

    async fn columns(&self, table: &TableRef) -> Result<Vec<ColumnInfo>>;

    async fn constraints(&self, table: &TableRef) -> Result<Vec<ConstraintInfo>>;

    async fn row_count(&self, table: &TableRef) -> Result<u64>;

    /// The subset of `fingerprints` (see [`CatalogSource::sample_rows`])
    /// found among the rows of `table`.
    async fn matching_rows(
        &self,
        table: &TableRef,
        fingerprints: &[String],
    ) -> Result<BTreeSet<String>>;

    /// Rows of `table` whose `column` is NULL.
    async fn null_count(&self, table: &TableRef, column: &str) -> Result<u64>;

    /// Empty `tables` in one statement, together with anything that
    /// references them, so foreign keys between them cannot block it.
    async fn clear_tables(&self, tables: &[TableRef]) -> Result<()>;

    /// Open a transaction and start `COPY table FROM STDIN`.
    async fn begin_import(&self, table: &TableRef) -> Result<Box<dyn ImportWriter>>;

    async fn ping(&self) -> Result<()>;

    /// Release pooled connections.
    fn close(&self) {}
}

/// An open import into one partition table.
///
/// Nothing becomes visible until [`commit`](ImportWriter::commit) succeeds.
#[async_trait]
pub trait ImportWriter: Send {
    /// Send one chunk of binary COPY data.
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Finish the COPY and commit. Returns the row count reported by the server.
    async fn commit(self: Box<Self>) -> Result<u64>;

    /// Abandon the import and roll back.
    async fn abort(self: Box<Self>);
}
