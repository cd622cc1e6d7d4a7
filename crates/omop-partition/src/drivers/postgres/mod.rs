//! PostgreSQL driver.
//!
//! - [`PgSource`]: catalog queries, counts, row samples and binary `COPY ... TO STDOUT`
//! - [`PgPartition`]: counts, catalog lookups, truncation and transactional binary `COPY ... FROM STDIN`
//! - [`build_pool`]: deadpool setup, with rustls when `ssl_mode` asks for it

mod connect;
mod partition;
mod source;
mod tls;

pub use connect::{build_pool, PgEndpoint};
pub use partition::PgPartition;
pub use source::PgSource;
pub use tls::SslMode;

use tokio_postgres::Client;

use crate::core::{ColumnInfo, ConstraintInfo, ConstraintKind, TableRef};
use crate::error::Result;

const LIST_TABLES_SQL: &str = r#"
    SELECT table_name
    FROM information_schema.tables
    WHERE table_schema = $1 AND table_type = 'BASE TABLE'
    ORDER BY table_name
"#;

const COLUMNS_SQL: &str = r#"
    SELECT column_name, data_type
    FROM information_schema.columns
    WHERE table_schema = $1 AND table_name = $2
    ORDER BY ordinal_position
"#;

const CONSTRAINTS_SQL: &str = r#"
    SELECT c.conname,
           c.contype::text,
           ARRAY(
               SELECT a.attname::text
               FROM unnest(c.conkey) WITH ORDINALITY AS k(attnum, ord)
               JOIN pg_catalog.pg_attribute a
                 ON a.attrelid = c.conrelid AND a.attnum = k.attnum
               ORDER BY k.ord
           ),
           rn.nspname,
           rt.relname
    FROM pg_catalog.pg_constraint c
    JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    LEFT JOIN pg_catalog.pg_class rt ON rt.oid = c.confrelid
    LEFT JOIN pg_catalog.pg_namespace rn ON rn.oid = rt.relnamespace
    WHERE n.nspname = $1 AND t.relname = $2 AND c.contype IN ('p', 'u', 'f')
    ORDER BY c.contype, c.conname
"#;

async fn list_tables(client: &Client, schema: &str) -> Result<Vec<TableRef>> {
    let rows = client.query(LIST_TABLES_SQL, &[&schema]).await?;
    Ok(rows
        .iter()
        .map(|row| TableRef::new(schema, row.get::<_, String>(0)))
        .collect())
}

async fn columns(client: &Client, table: &TableRef) -> Result<Vec<ColumnInfo>> {
    let rows = client
        .query(COLUMNS_SQL, &[&table.schema, &table.name])
        .await?;
    Ok(rows
        .iter()
        .map(|row| ColumnInfo::new(row.get::<_, String>(0), row.get::<_, String>(1)))
        .collect())
}

async fn constraints(client: &Client, table: &TableRef) -> Result<Vec<ConstraintInfo>> {
    let rows = client
        .query(CONSTRAINTS_SQL, &[&table.schema, &table.name])
        .await?;
    Ok(rows
        .iter()
        .filter_map(|row| {
            let kind = match row.get::<_, String>(1).as_str() {
                "p" => ConstraintKind::PrimaryKey,
                "u" => ConstraintKind::Unique,
                "f" => ConstraintKind::ForeignKey,
                _ => return None,
            };
            let schema: Option<String> = row.get(3);
            let name: Option<String> = row.get(4);
            let references = schema.zip(name).map(|(s, n)| TableRef::new(s, n));
            Some(ConstraintInfo {
                name: row.get(0),
                kind,
                columns: row.get(2),
                references,
            })
        })
        .collect())
}

async fn count(client: &Client, sql: &str) -> Result<u64> {
    let row = client.query_one(sql, &[]).await?;
    Ok(row.get::<_, i64>(0).max(0) as u64)
}
