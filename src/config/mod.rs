//! Runtime configuration for native evaluation.
//!
//! All knobs that gate the native path live in one immutable struct built
//! once per session and threaded explicitly through the evaluator context.
//! Nothing in this crate reads configuration from ambient global state.
//!
//! Example configuration file:
//! ```toml
//! enable_native_cross_join = true
//! enable_native_non_empty = true
//! enable_native_filter = true
//! enable_native_top_count = true
//! expand_non_native = false
//! max_constraints = 1000
//! result_limit = 0            # 0 = unlimited
//! alert_native_evaluation_unsupported = "off"
//! filter_childless_snowflake_members = true
//! use_aggregates = false
//! read_aggregates = false
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Alert policy for an explicitly-native function falling back to the
/// in-memory path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPolicy {
    /// Silent fallback.
    #[default]
    Off,
    /// Emit one warning event on the sink, then fall back.
    Warn,
    /// Abort the statement with a typed failure.
    Error,
}

/// Immutable native-evaluation configuration.
///
/// Defaults match the behavior a production deployment starts with: the
/// native paths on, expansion of mixed-level enumerations off, and no alert
/// on fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    /// Evaluate crossjoins natively where eligible.
    pub enable_native_cross_join: bool,

    /// Evaluate NON EMPTY member/children reads natively.
    pub enable_native_non_empty: bool,

    /// Evaluate Filter(set, predicate) natively.
    pub enable_native_filter: bool,

    /// Evaluate TopCount natively.
    pub enable_native_top_count: bool,

    /// Allow enumerations that span levels (after calculated-member
    /// expansion) to stay on the native path.
    pub expand_non_native: bool,

    /// Upper bound on the number of member keys a single constraint may
    /// enumerate. Oversized enumerations abort the native path for that
    /// axis.
    pub max_constraints: usize,

    /// Upper bound on the number of result tuples. 0 means unlimited.
    /// Exceeding a non-zero cap aborts the statement.
    pub result_limit: u64,

    /// What to do when an explicitly-native function call cannot be
    /// evaluated natively.
    pub alert_native_evaluation_unsupported: AlertPolicy,

    /// Walk snowflake dimension reads from the leaf table outward, so
    /// members whose branch has no leaf rows are filtered out.
    pub filter_childless_snowflake_members: bool,

    /// Consider pre-aggregated tables at all.
    pub use_aggregates: bool,

    /// Substitute a covering aggregate table for the fact table when
    /// generating constraint SQL.
    pub read_aggregates: bool,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            enable_native_cross_join: true,
            enable_native_non_empty: true,
            enable_native_filter: true,
            enable_native_top_count: true,
            expand_non_native: false,
            max_constraints: 1000,
            result_limit: 0,
            alert_native_evaluation_unsupported: AlertPolicy::Off,
            filter_childless_snowflake_members: true,
            use_aggregates: false,
            read_aggregates: false,
        }
    }
}

impl NativeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        let config: NativeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from the default locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `OPAL_CONFIG`
    /// 2. `./opal.toml`
    ///
    /// Falls back to defaults when neither exists.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = env::var("OPAL_CONFIG") {
            return Self::from_file(&path);
        }

        let local = PathBuf::from("opal.toml");
        if local.exists() {
            return Self::from_file(&local);
        }

        Ok(NativeConfig::default())
    }

    /// True when aggregate tables may be substituted for the fact table.
    pub fn aggregates_enabled(&self) -> bool {
        self.use_aggregates && self.read_aggregates
    }

    /// The result cap, if one is configured.
    pub fn result_cap(&self) -> Option<u64> {
        if self.result_limit == 0 {
            None
        } else {
            Some(self.result_limit)
        }
    }
}
