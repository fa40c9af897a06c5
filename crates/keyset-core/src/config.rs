//! Runtime configuration, loadable from TOML.

use serde::Deserialize;
use std::collections::BTreeSet;
use thiserror::Error as ThisError;

///
/// ConfigError
///

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("invalid config toml: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

///
/// DbConfig
///

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DbConfig {
    /// Namespace prepended to every backend key.
    pub key_prefix: String,
    pub query: QueryConfig,
    pub search: SearchConfig,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            key_prefix: "ks.".to_string(),
            query: QueryConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl DbConfig {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::Invalid {
                field: "key_prefix",
                reason: "must not be empty".to_string(),
            });
        }
        if self.query.batch_fetch_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "query.batch_fetch_threshold",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

///
/// QueryConfig
///

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryConfig {
    /// Id-set size at or above which instance data is fetched with one
    /// batch read instead of per-id reads.
    pub batch_fetch_threshold: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            batch_fetch_threshold: 2,
        }
    }
}

///
/// SearchConfig
///

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    pub min_word_length: usize,
    pub stop_words: BTreeSet<String>,
    pub case_sensitive: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_word_length: 3,
            stop_words: BTreeSet::new(),
            case_sensitive: false,
        }
    }
}
