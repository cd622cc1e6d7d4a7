//! PostgreSQL partition.

use std::collections::BTreeSet;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_postgres::{Object, Pool};
use futures::SinkExt;
use tokio_postgres::CopyInSink;
use tracing::{debug, info, warn};

use super::connect::{build_pool, checkout, PgEndpoint};
use crate::config::PartitionConfig;
use crate::core::identifier::quote_pg;
use crate::core::{ColumnInfo, ConstraintInfo, ImportWriter, PartitionSink, TableRef};
use crate::error::Result;

/// One partition database behind a connection pool.
pub struct PgPartition {
    index: usize,
    pool: Pool,
    location: String,
}

impl PgPartition {
    /// Build the pool without connecting.
    pub fn lazy(index: usize, config: &PartitionConfig, max_conns: usize) -> Result<Self> {
        let endpoint = PgEndpoint::from_partition(index, config)?;
        let location = endpoint.location();
        info!("Pool for {}", endpoint.label());
        Ok(Self {
            index,
            pool: build_pool(&endpoint, max_conns)?,
            location,
        })
    }
}

#[async_trait]
impl PartitionSink for PgPartition {
    fn index(&self) -> usize {
        self.index
    }

    fn describe(&self) -> String {
        self.location.clone()
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<TableRef>> {
        let client = checkout(&self.pool, &self.location, "list_tables").await?;
        super::list_tables(&client, schema).await
    }

    async fn columns(&self, table: &TableRef) -> Result<Vec<ColumnInfo>> {
        let client = checkout(&self.pool, &self.location, "columns").await?;
        super::columns(&client, table).await
    }

    async fn constraints(&self, table: &TableRef) -> Result<Vec<ConstraintInfo>> {
        let client = checkout(&self.pool, &self.location, "constraints").await?;
        super::constraints(&client, table).await
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64> {
        let client = checkout(&self.pool, &self.location, "row_count").await?;
        let sql = format!("SELECT COUNT(*) FROM {}", table.qualified()?);
        super::count(&client, &sql).await
    }

    async fn matching_rows(
        &self,
        table: &TableRef,
        fingerprints: &[String],
    ) -> Result<BTreeSet<String>> {
        if fingerprints.is_empty() {
            return Ok(BTreeSet::new());
        }
        let client = checkout(&self.pool, &self.location, "matching_rows").await?;
        let sql = format!(
            "SELECT DISTINCT md5(t::text) FROM {} AS t WHERE md5(t::text) = ANY($1)",
            table.qualified()?
        );
        let rows = client.query(sql.as_str(), &[&fingerprints]).await?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn null_count(&self, table: &TableRef, column: &str) -> Result<u64> {
        let client = checkout(&self.pool, &self.location, "null_count").await?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
            table.qualified()?,
            quote_pg(column)?
        );
        super::count(&client, &sql).await
    }

    async fn clear_tables(&self, tables: &[TableRef]) -> Result<()> {
        let Some(sql) = truncate_sql(tables)? else {
            return Ok(());
        };
        let client = checkout(&self.pool, &self.location, "truncate").await?;
        debug!("{}", sql);
        client.batch_execute(&sql).await?;
        info!("Partition {}: emptied {} tables", self.index, tables.len());
        Ok(())
    }

    async fn begin_import(&self, table: &TableRef) -> Result<Box<dyn ImportWriter>> {
        let qualified = table.qualified()?;
        let client = checkout(&self.pool, &self.location, "import").await?;

        client.batch_execute("BEGIN").await?;
        match start_copy(&client, &qualified).await {
            Ok(sink) => Ok(Box::new(PgImportWriter {
                client,
                sink: Box::pin(sink),
                table: qualified,
            })),
            Err(e) => {
                if let Err(rollback) = client.batch_execute("ROLLBACK").await {
                    warn!("ROLLBACK on {} failed: {}", qualified, rollback);
                }
                Err(e)
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        let client = checkout(&self.pool, &self.location, "ping").await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn close(&self) {
        self.pool.close();
    }
}

/// A single `TRUNCATE` covering all `tables`; `None` when there are none.
///
/// Postgres refuses to truncate a table referenced by a foreign key unless
/// the referencing table is truncated in the same statement, so the tables
/// go together and `CASCADE` covers referencing tables outside the list.
fn truncate_sql(tables: &[TableRef]) -> Result<Option<String>> {
    if tables.is_empty() {
        return Ok(None);
    }
    let names = tables
        .iter()
        .map(|t| t.qualified())
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(format!("TRUNCATE TABLE {} CASCADE", names.join(", "))))
}

async fn start_copy(client: &Object, qualified: &str) -> Result<CopyInSink<Bytes>> {
    let copy_sql = format!("COPY {} FROM STDIN (FORMAT binary)", qualified);
    debug!("{}", copy_sql);
    Ok(client.copy_in(copy_sql.as_str()).await?)
}

/// `COPY ... FROM STDIN` inside an open transaction.
struct PgImportWriter {
    client: Object,
    sink: Pin<Box<CopyInSink<Bytes>>>,
    table: String,
}

#[async_trait]
impl ImportWriter for PgImportWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.sink.send(chunk).await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<u64> {
        let rows = self.sink.as_mut().finish().await?;
        self.client.batch_execute("COMMIT").await?;
        debug!("Committed {} rows into {}", rows, self.table);
        Ok(rows)
    }

    async fn abort(self: Box<Self>) {
        let PgImportWriter { client, sink, table } = *self;
        // An unfinished sink makes the server fail the COPY.
        drop(sink);
        if let Err(e) = client.batch_execute("ROLLBACK").await {
            warn!("ROLLBACK on {} failed: {}", table, e);
        }
    }
}
