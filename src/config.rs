use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Maximum number of rows returned by a query unless configured otherwise.
pub const DEFAULT_MAX_ROWS: usize = 10_000;

/// Engine configuration.
///
/// Every field has a default, so a config file only needs the keys it
/// overrides:
///
/// ```json
/// { "database": "trace.duckdb", "threads": 4, "max_rows": 50000 }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Database file, or `None` for an in-memory database
    pub database: Option<PathBuf>,
    /// Open the database read-only (file databases only)
    pub read_only: bool,
    /// DuckDB worker threads (`None` = DuckDB default)
    pub threads: Option<u32>,
    /// DuckDB memory limit, e.g. "2GB"
    pub memory_limit: Option<String>,
    /// Row cap applied by `TraceEngine::execute`
    pub max_rows: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: None,
            read_only: false,
            threads: None,
            memory_limit: None,
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text).map_err(|e| EngineError::Config {
            message: format!("{}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_only && self.database.is_none() {
            return Err(EngineError::Config {
                message: "read_only requires a database file".to_string(),
            });
        }
        if self.max_rows == 0 {
            return Err(EngineError::Config {
                message: "max_rows must be greater than zero".to_string(),
            });
        }
        if self.threads == Some(0) {
            return Err(EngineError::Config {
                message: "threads must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn to_duckdb(&self) -> Result<duckdb::Config> {
        let mut config = duckdb::Config::default();
        if self.read_only {
            config = config.access_mode(duckdb::AccessMode::ReadOnly)?;
        }
        if let Some(threads) = self.threads {
            config = config.threads(i64::from(threads))?;
        }
        if let Some(limit) = &self.memory_limit {
            config = config.max_memory(limit)?;
        }
        Ok(config)
    }
}
