//! Connection pools.

use std::fmt;

use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::Config as PgConfig;

use crate::config::{PartitionConfig, SourceConfig};
use super::tls::{connector, SslMode};
use crate::error::{PartitionError, Result};

/// Where and how to connect to one database.
#[derive(Clone)]
pub struct PgEndpoint {
    /// `source` or `partition <i>`.
    pub role: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: SslMode,
}

impl PgEndpoint {
    pub fn from_source(config: &SourceConfig) -> Result<Self> {
        Ok(Self {
            role: "source".to_string(),
            host: config.host.clone(),
            port: config.port,
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            ssl_mode: config.ssl_mode.parse()?,
        })
    }

    pub fn from_partition(index: usize, config: &PartitionConfig) -> Result<Self> {
        Ok(Self {
            role: format!("partition {}", index),
            host: config.host.clone(),
            port: config.port,
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            ssl_mode: config.ssl_mode.parse()?,
        })
    }

    /// `host:port/database`
    pub fn location(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    /// Role and location, e.g. `partition 2 (pg-2:5432/cdm_part_2)`.
    pub fn label(&self) -> String {
        format!("{} ({})", self.role, self.location())
    }

    fn pg_config(&self) -> PgConfig {
        let mut pg_config = PgConfig::new();
        pg_config.host(&self.host);
        pg_config.port(self.port);
        pg_config.dbname(&self.database);
        pg_config.user(&self.user);
        pg_config.password(&self.password);
        pg_config.application_name("omop-partition");
        pg_config
    }
}

impl fmt::Debug for PgEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgEndpoint")
            .field("role", &self.role)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Build a pool of at most `max_size` connections. No connection is opened yet.
pub fn build_pool(endpoint: &PgEndpoint, max_size: usize) -> Result<Pool> {
    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let context = format!("creating pool for {}", endpoint.label());

    let mgr = match connector(endpoint)? {
        Some(tls) => Manager::from_config(endpoint.pg_config(), tls, mgr_config),
        None => Manager::from_config(endpoint.pg_config(), tokio_postgres::NoTls, mgr_config),
    };

    Pool::builder(mgr)
        .max_size(max_size.max(1))
        .build()
        .map_err(|e| PartitionError::pool(e, context))
}

/// Check out a connection, naming `what` it is for on failure.
pub(super) async fn checkout(pool: &Pool, location: &str, what: &str) -> Result<Object> {
    pool.get().await.map_err(|e| {
        PartitionError::pool(e, format!("getting connection to {} for {}", location, what))
    })
}
