//! PostgreSQL source.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use futures::{stream, StreamExt};
use tracing::{debug, info};

use super::connect::{build_pool, checkout, PgEndpoint};
use crate::config::SourceConfig;
use crate::core::{
    ByteStream, CatalogSource, ColumnInfo, ConstraintInfo, CopySource, ForeignKeyEdge,
    SourceDatabase, TableRef,
};
use crate::error::{PartitionError, Result};
use crate::plan::RowSelection;

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT c.conname, n.nspname, t.relname, rn.nspname, rt.relname
    FROM pg_catalog.pg_constraint c
    JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_catalog.pg_class rt ON rt.oid = c.confrelid
    JOIN pg_catalog.pg_namespace rn ON rn.oid = rt.relnamespace
    WHERE n.nspname = $1 AND c.contype = 'f'
    ORDER BY t.relname, c.conname
"#;

const PRIMARY_KEY_SQL: &str = r#"
    SELECT a.attname
    FROM pg_catalog.pg_constraint c
    JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid
    WHERE n.nspname = $1
      AND t.relname = $2
      AND c.contype = 'p'
      AND a.attnum = ANY(c.conkey)
    ORDER BY array_position(c.conkey, a.attnum)
"#;

/// The source database behind a connection pool.
pub struct PgSource {
    pool: Pool,
    location: String,
}

impl PgSource {
    /// Build the pool without connecting. The first query opens a connection.
    pub fn lazy(config: &SourceConfig, max_conns: usize) -> Result<Self> {
        let endpoint = PgEndpoint::from_source(config)?;
        let source = Self {
            pool: build_pool(&endpoint, max_conns)?,
            location: endpoint.location(),
        };
        info!("Source pool for {} (max {} connections)", source.location, max_conns);
        Ok(source)
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

#[async_trait]
impl CatalogSource for PgSource {
    async fn list_tables(&self, schema: &str) -> Result<Vec<TableRef>> {
        let client = checkout(&self.pool, &self.location, "list_tables").await?;
        super::list_tables(&client, schema).await
    }

    async fn foreign_keys(&self, schema: &str) -> Result<Vec<ForeignKeyEdge>> {
        let client = checkout(&self.pool, &self.location, "foreign_keys").await?;
        let rows = client.query(FOREIGN_KEYS_SQL, &[&schema]).await?;
        let edges: Vec<ForeignKeyEdge> = rows
            .iter()
            .map(|row| ForeignKeyEdge {
                constraint_name: row.get(0),
                from: TableRef::new(row.get::<_, String>(1), row.get::<_, String>(2)),
                to: TableRef::new(row.get::<_, String>(3), row.get::<_, String>(4)),
            })
            .collect();
        debug!("Loaded {} foreign keys from {}", edges.len(), schema);
        Ok(edges)
    }

    async fn columns(&self, table: &TableRef) -> Result<Vec<ColumnInfo>> {
        let client = checkout(&self.pool, &self.location, "columns").await?;
        super::columns(&client, table).await
    }

    async fn primary_key(&self, table: &TableRef) -> Result<Vec<String>> {
        let client = checkout(&self.pool, &self.location, "primary_key").await?;
        let rows = client
            .query(PRIMARY_KEY_SQL, &[&table.schema, &table.name])
            .await?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
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

    async fn sample_rows(&self, table: &TableRef, limit: usize) -> Result<Vec<String>> {
        let client = checkout(&self.pool, &self.location, "sample_rows").await?;
        let sql = format!(
            "SELECT md5(t::text) FROM {} AS t ORDER BY random() LIMIT $1",
            table.qualified()?
        );
        let rows = client.query(sql.as_str(), &[&(limit as i64)]).await?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn count_selected(&self, table: &TableRef, selection: &RowSelection) -> Result<u64> {
        let client = checkout(&self.pool, &self.location, "count_selected").await?;
        let sql = selection.count_sql(table)?;
        debug!("{}", sql);
        super::count(&client, &sql).await
    }

    async fn ping(&self) -> Result<()> {
        let client = checkout(&self.pool, &self.location, "ping").await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

#[async_trait]
impl CopySource for PgSource {
    async fn export(&self, table: &TableRef, selection: &RowSelection) -> Result<ByteStream> {
        let client = checkout(&self.pool, &self.location, "export").await?;
        let sql = selection.copy_out_sql(table)?;
        debug!("{}", sql);

        let copy = client.copy_out(sql.as_str()).await?;

        // The connection stays checked out until the stream is exhausted or dropped.
        let chunks = stream::unfold((client, Box::pin(copy)), |(client, mut copy)| async move {
            let item = copy.next().await?;
            Some((item.map_err(PartitionError::from), (client, copy)))
        });
        Ok(Box::pin(chunks))
    }
}

impl SourceDatabase for PgSource {
    fn close(&self) {
        self.pool.close();
    }
}
