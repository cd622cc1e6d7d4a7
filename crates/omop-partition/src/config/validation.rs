//! Configuration validation.

use std::collections::HashSet;

use super::Config;
use crate::core::identifier::validate_identifier;
use crate::drivers::SslMode;
use crate::error::{PartitionError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(PartitionError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(PartitionError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(PartitionError::Config("source.user is required".into()));
    }
    validate_identifier(&config.source.schema)
        .map_err(|e| PartitionError::Config(format!("source.schema: {}", e)))?;
    config.source.ssl_mode.parse::<SslMode>()?;
    if let Some(0) = config.source.max_connections {
        return Err(PartitionError::Config(
            "source.max_connections must be at least 1".into(),
        ));
    }

    // Partition validation
    if config.partitions.is_empty() {
        return Err(PartitionError::Config(
            "at least one entry in partitions is required".into(),
        ));
    }
    let source_location = (
        config.source.host.as_str(),
        config.source.port,
        config.source.database.as_str(),
    );
    let mut seen = HashSet::new();
    for (i, partition) in config.partitions.iter().enumerate() {
        if partition.host.is_empty() {
            return Err(PartitionError::Config(format!(
                "partitions[{}].host is required",
                i
            )));
        }
        if partition.database.is_empty() {
            return Err(PartitionError::Config(format!(
                "partitions[{}].database is required",
                i
            )));
        }
        if partition.user.is_empty() {
            return Err(PartitionError::Config(format!(
                "partitions[{}].user is required",
                i
            )));
        }
        partition.ssl_mode.parse::<SslMode>()?;

        let location = (
            partition.host.as_str(),
            partition.port,
            partition.database.as_str(),
        );
        if location == source_location {
            return Err(PartitionError::Config(format!(
                "partitions[{}] cannot be the source database",
                i
            )));
        }
        if !seen.insert(location) {
            return Err(PartitionError::Config(format!(
                "partitions[{}] duplicates an earlier partition ({})",
                i,
                partition.location()
            )));
        }
    }

    // Distribution validation - only check optional values if explicitly set
    let dist = &config.distribution;
    if let Some(0) = dist.workers {
        return Err(PartitionError::Config(
            "distribution.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = dist.run_timeout_secs {
        return Err(PartitionError::Config(
            "distribution.run_timeout_secs must be at least 1".into(),
        ));
    }
    if dist.large_table_threshold == 0 {
        return Err(PartitionError::Config(
            "distribution.large_table_threshold must be at least 1".into(),
        ));
    }
    if dist.hash_key_pattern.is_empty() {
        return Err(PartitionError::Config(
            "distribution.hash_key_pattern is required".into(),
        ));
    }
    validate_identifier(&dist.subject_column)
        .map_err(|e| PartitionError::Config(format!("distribution.subject_column: {}", e)))?;
    config.subject_table()?;

    for (i, link) in dist.join_overrides.iter().enumerate() {
        for (field, value) in [
            ("table", &link.table),
            ("parent_table", &link.parent_table),
            ("child_key", &link.child_key),
            ("parent_key", &link.parent_key),
            ("parent_subject_column", &link.parent_subject_column),
        ] {
            if value.is_empty() {
                return Err(PartitionError::Config(format!(
                    "distribution.join_overrides[{}].{} is required",
                    i, field
                )));
            }
        }
        if link.table == link.parent_table {
            return Err(PartitionError::Config(format!(
                "distribution.join_overrides[{}]: a table cannot derive its split from itself",
                i
            )));
        }
    }

    config.table_filter()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistributionConfig, PartitionConfig, SourceConfig};

    fn partition(db: &str) -> PartitionConfig {
        PartitionConfig {
            host: "localhost".to_string(),
            port: 5432,
            database: db.to_string(),
            user: "postgres".to_string(),
            password: "password".to_string(),
            ssl_mode: "disable".to_string(),
        }
    }

    fn valid_config() -> Config {
        Config {
            source: SourceConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "cdm".to_string(),
                user: "postgres".to_string(),
                password: "password".to_string(),
                schema: "omopcdm".to_string(),
                ssl_mode: "disable".to_string(),
                max_connections: None,
            },
            partitions: vec![partition("cdm_p0"), partition("cdm_p1")],
            distribution: DistributionConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_no_partitions() {
        let mut config = valid_config();
        config.partitions.clear();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("partitions"));
    }

    #[test]
    fn test_partition_missing_database() {
        let mut config = valid_config();
        config.partitions[1].database = "".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("partitions[1].database"));
    }

    #[test]
    fn test_partition_cannot_be_source() {
        let mut config = valid_config();
        config.partitions[0].database = "cdm".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_partitions_rejected() {
        let mut config = valid_config();
        config.partitions.push(partition("cdm_p0"));
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("duplicates"));
    }

    #[test]
    fn test_zero_workers() {
        let mut config = valid_config();
        config.distribution.workers = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_threshold() {
        let mut config = valid_config();
        config.distribution.large_table_threshold = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let mut config = valid_config();
        config.partitions[0].ssl_mode = "sometimes".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_incomplete_join_override() {
        let mut config = valid_config();
        config.distribution.join_overrides[0].child_key = "".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("join_overrides[0].child_key"));
    }

    #[test]
    fn test_bad_glob_pattern() {
        let mut config = valid_config();
        config.distribution.exclude_tables = vec!["[".to_string()];
        assert!(validate(&config).is_err());
    }
}
