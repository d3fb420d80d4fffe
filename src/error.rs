//! Error types for the slice query engine.

use std::fmt;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the engine.
///
/// An empty selection is not an error: the aggregation paths report it as an
/// unavailable outcome instead.
#[derive(Debug)]
pub enum EngineError {
    /// A generated or user-supplied query could not be prepared or executed.
    Query { message: String },
    /// A relation lookup referenced a table or view that does not exist.
    UnknownTable { name: String },
    /// Declared metadata or an aggregation referenced a column the relation lacks.
    SchemaMismatch { relation: String, column: String },
    /// A name that gets interpolated into SQL is not a plain identifier.
    InvalidIdentifier { name: String },
    /// The selection window ends before it starts.
    InvalidArea { start_ns: i64, end_ns: i64 },
    /// A multi-statement script could not be split or executed.
    Script { offset: usize, message: String },
    /// The engine configuration is invalid or could not be read.
    Config { message: String },
    /// Filesystem error while loading data or configuration.
    Io(std::io::Error),
}

impl EngineError {
    pub(crate) fn query(message: impl Into<String>) -> Self {
        EngineError::Query {
            message: message.into(),
        }
    }

    pub(crate) fn schema_mismatch(relation: &str, column: &str) -> Self {
        EngineError::SchemaMismatch {
            relation: relation.to_string(),
            column: column.to_string(),
        }
    }

    /// Returns true for failures that only suppress one view.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Query { .. } | EngineError::UnknownTable { .. }
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Query { message } => write!(f, "query error: {message}"),
            EngineError::UnknownTable { name } => write!(f, "unknown table: {name}"),
            EngineError::SchemaMismatch { relation, column } => {
                write!(f, "{relation}: no column named '{column}'")
            }
            EngineError::InvalidIdentifier { name } => {
                write!(f, "invalid identifier '{name}'")
            }
            EngineError::InvalidArea { start_ns, end_ns } => {
                write!(f, "invalid area: end {end_ns} is before start {start_ns}")
            }
            EngineError::Script { offset, message } => {
                write!(f, "script error at offset {offset}: {message}")
            }
            EngineError::Config { message } => write!(f, "config error: {message}"),
            EngineError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<duckdb::Error> for EngineError {
    fn from(e: duckdb::Error) -> Self {
        EngineError::query(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_schema_mismatch() {
        let err = EngineError::schema_mismatch("slice_aggregation", "total_dur");
        assert_eq!(
            err.to_string(),
            "slice_aggregation: no column named 'total_dur'"
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(EngineError::query("bad").is_recoverable());
        assert!(EngineError::UnknownTable {
            name: "x".to_string()
        }
        .is_recoverable());
        assert!(!EngineError::schema_mismatch("v", "c").is_recoverable());
    }
}
