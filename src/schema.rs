//! Base table DDL and the table registry.
//!
//! The registry answers "what columns does this relation have" for base
//! tables, views and materialized debug tables alike by reading DuckDB's
//! `information_schema`.

use std::sync::OnceLock;

use duckdb::Connection;
use regex::Regex;
use serde::Serialize;

use crate::error::{EngineError, Result};

/// Name of the base slice table.
pub const SLICES_TABLE: &str = "slices";

/// Schema for the base slice table.
///
/// `dur = -1` marks a slice that never terminated. `bytes` is optional and
/// only used by the data-amount metric.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS slices (
    track_id BIGINT NOT NULL,
    ts BIGINT NOT NULL,
    dur BIGINT NOT NULL CHECK (dur >= -1),
    name VARCHAR NOT NULL,
    category VARCHAR NOT NULL DEFAULT '',
    bytes BIGINT
);
"#;

/// Columns every relation passed to the windowed executor must have.
pub const WINDOW_COLUMNS: [&str; 3] = ["track_id", "ts", "dur"];

/// Logical column type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int,
    Float,
    String,
    Bool,
    Other(String),
}

impl ColumnType {
    /// Map a DuckDB `data_type` string onto a logical type.
    pub fn from_duckdb(data_type: &str) -> Self {
        let upper = data_type.to_ascii_uppercase();
        match upper.as_str() {
            "TINYINT" | "SMALLINT" | "INTEGER" | "BIGINT" | "HUGEINT" | "UTINYINT"
            | "USMALLINT" | "UINTEGER" | "UBIGINT" => ColumnType::Int,
            "FLOAT" | "REAL" | "DOUBLE" => ColumnType::Float,
            "VARCHAR" | "TEXT" | "STRING" => ColumnType::String,
            "BOOLEAN" => ColumnType::Bool,
            _ if upper.starts_with("DECIMAL") => ColumnType::Float,
            _ => ColumnType::Other(data_type.to_string()),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Int | ColumnType::Float)
    }
}

/// Column information.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

/// Kind of a named relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Table,
    View,
}

impl RelationKind {
    pub(crate) fn drop_keyword(self) -> &'static str {
        match self {
            RelationKind::Table => "TABLE",
            RelationKind::View => "VIEW",
        }
    }
}

/// A named relation in the main schema.
#[derive(Debug, Clone, Serialize)]
pub struct RelationInfo {
    pub name: String,
    pub kind: RelationKind,
}

/// Create the base tables on a fresh connection.
pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Check that `name` is safe to splice into SQL as a bare identifier.
pub fn validate_identifier(name: &str) -> Result<()> {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    let re = IDENT.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex is valid")
    });
    if re.is_match(name) {
        Ok(())
    } else {
        Err(EngineError::InvalidIdentifier {
            name: name.to_string(),
        })
    }
}

pub(crate) fn relation_kind(conn: &Connection, name: &str) -> Result<Option<RelationKind>> {
    let mut stmt = conn.prepare(
        "SELECT table_type FROM information_schema.tables \
         WHERE table_schema = 'main' AND table_name = ?",
    )?;
    let mut rows = stmt.query([name])?;
    if let Some(row) = rows.next()? {
        let table_type: String = row.get(0)?;
        if table_type.eq_ignore_ascii_case("VIEW") {
            Ok(Some(RelationKind::View))
        } else {
            Ok(Some(RelationKind::Table))
        }
    } else {
        Ok(None)
    }
}

pub(crate) fn list_relations(conn: &Connection) -> Result<Vec<RelationInfo>> {
    let mut stmt = conn.prepare(
        "SELECT table_name, table_type FROM information_schema.tables \
         WHERE table_schema = 'main' ORDER BY table_name",
    )?;
    let mut rows = stmt.query([])?;

    let mut relations = Vec::new();
    while let Some(row) = rows.next()? {
        let table_type: String = row.get(1)?;
        relations.push(RelationInfo {
            name: row.get(0)?,
            kind: if table_type.eq_ignore_ascii_case("VIEW") {
                RelationKind::View
            } else {
                RelationKind::Table
            },
        });
    }
    Ok(relations)
}

pub(crate) fn describe_table(conn: &Connection, name: &str) -> Result<Vec<ColumnInfo>> {
    if relation_kind(conn, name)?.is_none() {
        return Err(EngineError::UnknownTable {
            name: name.to_string(),
        });
    }

    let mut stmt = conn.prepare(
        "SELECT column_name, data_type FROM information_schema.columns \
         WHERE table_schema = 'main' AND table_name = ? \
         ORDER BY ordinal_position",
    )?;
    let mut rows = stmt.query([name])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        let data_type: String = row.get(1)?;
        columns.push(ColumnInfo {
            name: row.get(0)?,
            column_type: ColumnType::from_duckdb(&data_type),
        });
    }
    Ok(columns)
}

/// Fail with `SchemaMismatch` on the first of `required` missing from `columns`.
pub(crate) fn require_columns(
    relation: &str,
    columns: &[ColumnInfo],
    required: &[&str],
) -> Result<()> {
    for want in required {
        if !columns.iter().any(|c| c.name == *want) {
            return Err(EngineError::schema_mismatch(relation, want));
        }
    }
    Ok(())
}
