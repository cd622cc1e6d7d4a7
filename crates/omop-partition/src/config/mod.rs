//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::core::TableRef;
use crate::error::{PartitionError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 of the configuration, recorded in run results.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// The subject table, qualified with the source schema when bare.
    pub fn subject_table(&self) -> Result<TableRef> {
        TableRef::parse_with_default(&self.distribution.subject_table, &self.source.schema)
    }

    /// Include/exclude filter built from the glob patterns.
    pub fn table_filter(&self) -> Result<TableFilter> {
        TableFilter::new(
            &self.distribution.include_tables,
            &self.distribution.exclude_tables,
        )
    }
}

/// Include/exclude table selection.
///
/// Patterns are matched against both the bare table name and `schema.name`.
/// An empty include list includes everything.
#[derive(Debug, Clone)]
pub struct TableFilter {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl TableFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let include = if include.is_empty() {
            None
        } else {
            Some(build_globset(include)?)
        };
        Ok(Self {
            include,
            exclude: build_globset(exclude)?,
        })
    }

    /// A filter that selects every table.
    pub fn all() -> Self {
        Self {
            include: None,
            exclude: GlobSet::empty(),
        }
    }

    pub fn matches(&self, table: &TableRef) -> bool {
        let qualified = table.to_string();
        let hit = |set: &GlobSet| set.is_match(&table.name) || set.is_match(&qualified);

        if let Some(include) = &self.include {
            if !hit(include) {
                return false;
            }
        }
        !hit(&self.exclude)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            PartitionError::Config(format!("invalid table pattern '{}': {}", pattern, e))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| PartitionError::Config(format!("invalid table patterns: {}", e)))
}
