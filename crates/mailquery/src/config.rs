//! Query configuration.
//!
//! A process-wide default is held behind a lock; every query set snapshots it
//! when created, so later changes only affect new query sets.
//!
//! ```
//! use mailquery::QueryConfig;
//!
//! let config = QueryConfig::from_yaml_str("page_size: 50\n").unwrap();
//! assert_eq!(config.page_size, 50);
//! assert_eq!(config.bulk_chunk_size, 100);
//! ```

use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YAML config error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON config error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for paging and bulk operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Records per search page.
    pub page_size: usize,
    /// Page size for id-only passes made by `count()` and `delete()` when
    /// part of the filter runs on the client.
    pub count_page_size: usize,
    /// Records per bulk request.
    pub bulk_chunk_size: usize,
    /// Materialize unknown item types as generic items instead of failing.
    pub generic_item_fallback: bool,
}

pub const DEFAULT_PAGE_SIZE: usize = 100;

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            count_page_size: 1000,
            bulk_chunk_size: 100,
            generic_item_fallback: true,
        }
    }
}

static GLOBAL: Lazy<RwLock<QueryConfig>> = Lazy::new(|| RwLock::new(QueryConfig::default()));

impl QueryConfig {
    /// Parses a YAML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for malformed input or a zero size.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: QueryConfig = serde_yaml::from_str(text)?;
        config.validate()
    }

    /// Parses a JSON document, with the same rules as
    /// [`from_yaml_str`](QueryConfig::from_yaml_str).
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: QueryConfig = serde_json::from_str(text)?;
        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        for (name, value) in [
            ("page_size", self.page_size),
            ("count_page_size", self.count_page_size),
            ("bulk_chunk_size", self.bulk_chunk_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        Ok(self)
    }

    /// A copy of the process-wide default.
    pub fn global() -> QueryConfig {
        GLOBAL
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replaces the process-wide default.
    pub fn set_global(config: QueryConfig) {
        let mut guard = GLOBAL
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = config;
    }
}
