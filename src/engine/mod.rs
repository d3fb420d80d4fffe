//! The query engine.
//!
//! [`TraceEngine`] owns one DuckDB connection holding the base `slices`
//! table and every view or table derived from it. All methods are
//! synchronous; the connection sits behind a mutex so the engine can be
//! shared across threads.

pub mod script;
mod value;

pub use script::{ExecutionStats, ScriptParser, Statement};
pub use value::Value;

use std::path::Path;

use duckdb::{params, Connection, Transaction};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::schema::{self, ColumnInfo, RelationInfo, RelationKind, SLICES_TABLE};

/// Result of a SQL query.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    #[serde(skip_serializing_if = "is_false")]
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_row_count: Option<usize>,
}

fn is_false(b: &bool) -> bool {
    !b
}

impl QueryResult {
    /// Index of a named column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All values of a named column.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| &r[idx]).collect())
    }
}

/// Result of running a multi-statement script.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScriptResult {
    pub stats: ExecutionStats,
    /// Rows of the last statement, empty if it returned none.
    pub last: QueryResult,
}

/// One event on a track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slice {
    pub track_id: i64,
    pub ts: i64,
    /// Duration in ns, or `-1` for a slice that never ended.
    pub dur: i64,
    pub name: String,
    pub category: String,
    pub bytes: Option<i64>,
}

impl Slice {
    pub fn new(track_id: i64, ts: i64, dur: i64, name: &str) -> Self {
        Self {
            track_id,
            ts,
            dur,
            name: name.to_string(),
            category: String::new(),
            bytes: None,
        }
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn with_bytes(mut self, bytes: i64) -> Self {
        self.bytes = Some(bytes);
        self
    }
}

/// Extract column names from a DuckDB result set.
fn extract_column_names(rows: &duckdb::Rows<'_>) -> (usize, Vec<String>) {
    let column_count = rows.as_ref().map_or(0, |r| r.column_count());
    let names = if let Some(row_ref) = rows.as_ref() {
        (0..column_count)
            .map(|i| {
                row_ref
                    .column_name(i)
                    .map_or("?".to_string(), |s| s.to_string())
            })
            .collect()
    } else {
        Vec::new()
    };
    (column_count, names)
}

/// Run `sql` and collect up to `max_rows` rows.
///
/// `keep_going` is polled before every row; returning false abandons the
/// query and yields `None`, discarding whatever was read.
pub(crate) fn collect_rows(
    conn: &Connection,
    sql: &str,
    max_rows: usize,
    keep_going: &dyn Fn() -> bool,
) -> Result<Option<QueryResult>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;

    let (column_count, column_names) = extract_column_names(&rows);

    let mut rows_data: Vec<Vec<Value>> = Vec::new();
    let mut total_count: usize = 0;
    let mut truncated = false;

    while let Some(row) = rows.next()? {
        if !keep_going() {
            return Ok(None);
        }
        total_count += 1;
        if rows_data.len() >= max_rows {
            truncated = true;
            continue; // Keep counting for total
        }

        let mut row_values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let value: duckdb::types::Value = row.get(i)?;
            row_values.push(Value::from(value));
        }
        rows_data.push(row_values);
    }

    let row_count = rows_data.len();
    Ok(Some(QueryResult {
        columns: column_names,
        rows: rows_data,
        row_count,
        truncated,
        total_row_count: if truncated { Some(total_count) } else { None },
    }))
}

fn drop_in(conn: &Connection, name: &str) -> Result<bool> {
    match schema::relation_kind(conn, name)? {
        Some(kind) => {
            conn.execute_batch(&format!("DROP {} IF EXISTS {name}", kind.drop_keyword()))?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// How a replaced relation gets created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Materialization {
    View,
    Table,
}

/// Wrapper around a DuckDB connection holding slice data.
pub struct TraceEngine {
    conn: Mutex<Connection>,
    config: EngineConfig,
}

impl TraceEngine {
    /// Open an in-memory engine with default settings.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(EngineConfig::default())
    }

    /// Open an engine as described by `config`.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let db_config = config.to_duckdb()?;
        let conn = match &config.database {
            Some(path) => Connection::open_with_flags(path, db_config)?,
            None => Connection::open_in_memory_with_flags(db_config)?,
        };
        if !config.read_only {
            schema::create_schema(&conn)?;
        }
        info!(
            database = %config
                .database
                .as_deref()
                .map_or_else(|| ":memory:".to_string(), |p| p.display().to_string()),
            "opened trace engine"
        );
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a single SQL query and return typed results.
    pub fn execute(&self, sql: &str) -> Result<QueryResult> {
        debug!(sql, "execute");
        let conn = self.conn.lock();
        let result = collect_rows(&conn, sql, self.config.max_rows, &|| true)?;
        Ok(result.unwrap_or_default())
    }

    /// Execute a query, abandoning it as soon as `keep_going` returns false.
    ///
    /// Returns `Ok(None)` when the query was abandoned.
    pub fn execute_cancellable(
        &self,
        sql: &str,
        keep_going: &dyn Fn() -> bool,
    ) -> Result<Option<QueryResult>> {
        debug!(sql, "execute (cancellable)");
        if !keep_going() {
            return Ok(None);
        }
        let conn = self.conn.lock();
        collect_rows(&conn, sql, self.config.max_rows, keep_going)
    }

    /// Run a script of several statements.
    ///
    /// Rows of every statement but the last are stepped through and
    /// discarded. `CREATE TRACE VIEW|TABLE` statements go through the same
    /// atomic replace path as [`TraceEngine::define_view`].
    pub fn execute_script(&self, sql: &str) -> Result<ScriptResult> {
        let mut parser = ScriptParser::new(sql);
        let mut stats = ExecutionStats::default();
        let mut last: Option<QueryResult> = None;

        let mut conn = self.conn.lock();
        while let Some(stmt) = parser.next_statement()? {
            let offset = stmt.offset();
            let with_offset = |e: EngineError| match e {
                EngineError::Query { message } => EngineError::Script { offset, message },
                other => other,
            };

            stats.statement_count += 1;
            let result = match &stmt {
                Statement::CreateView { name, body, .. } => {
                    replace_in(&mut conn, name, body, Materialization::View, &|| true)
                        .map_err(with_offset)?;
                    QueryResult::default()
                }
                Statement::CreateTable { name, body, .. } => {
                    replace_in(&mut conn, name, body, Materialization::Table, &|| true)
                        .map_err(with_offset)?;
                    QueryResult::default()
                }
                Statement::Sql { sql, .. } if stmt.returns_rows() => {
                    collect_rows(&conn, sql, self.config.max_rows, &|| true)
                        .map_err(with_offset)?
                        .unwrap_or_default()
                }
                Statement::Sql { sql, .. } => {
                    debug!(sql = *sql, "execute statement");
                    conn.execute_batch(sql).map_err(|e| with_offset(e.into()))?;
                    QueryResult::default()
                }
            };

            let suppressed =
                result.columns.len() == 1 && result.columns[0] == script::SUPPRESS_OUTPUT_COLUMN;
            if stmt.returns_rows() && !suppressed {
                stats.statement_count_with_output += 1;
            }
            last = Some(result);
        }

        let Some(last) = last else {
            return Err(EngineError::Script {
                offset: 0,
                message: "No valid SQL to run".to_string(),
            });
        };
        stats.column_count = last.columns.len() as u32;
        Ok(ScriptResult { stats, last })
    }

    /// Replace any relation called `name` with a view over `definition`.
    ///
    /// The drop and the create run in one transaction; on failure the
    /// previous relation is left in place.
    pub fn define_view(&self, name: &str, definition: &str) -> Result<()> {
        self.replace_relation(name, definition, Materialization::View, &|| true)
            .map(|_| ())
    }

    /// Like [`TraceEngine::define_view`] but stores the query result as a table.
    pub fn replace_table(&self, name: &str, query: &str) -> Result<()> {
        self.replace_relation(name, query, Materialization::Table, &|| true)
            .map(|_| ())
    }

    /// Atomically replace `name`, committing only if `still_wanted` holds
    /// once the new relation has been built. Returns whether it committed.
    pub(crate) fn replace_relation(
        &self,
        name: &str,
        definition: &str,
        how: Materialization,
        still_wanted: &dyn Fn() -> bool,
    ) -> Result<bool> {
        schema::validate_identifier(name)?;
        let mut conn = self.conn.lock();
        replace_in(&mut conn, name, definition, how, still_wanted)
    }

    /// Create a table from `query`, failing if the name is taken.
    pub(crate) fn create_table(&self, name: &str, query: &str) -> Result<()> {
        schema::validate_identifier(name)?;
        let sql = format!("CREATE TABLE {name} AS {query}");
        debug!(sql, "create table");
        let conn = self.conn.lock();
        conn.execute_batch(&sql)?;
        Ok(())
    }

    /// Drop a table or view if it exists. Returns whether anything was dropped.
    pub fn drop_if_exists(&self, name: &str) -> Result<bool> {
        schema::validate_identifier(name)?;
        let conn = self.conn.lock();
        let dropped = drop_in(&conn, name)?;
        if dropped {
            debug!(relation = name, "dropped relation");
        }
        Ok(dropped)
    }

    /// Describe a relation's columns.
    pub fn describe_table(&self, name: &str) -> Result<Vec<ColumnInfo>> {
        let conn = self.conn.lock();
        schema::describe_table(&conn, name)
    }

    pub fn relation_kind(&self, name: &str) -> Result<Option<RelationKind>> {
        let conn = self.conn.lock();
        schema::relation_kind(&conn, name)
    }

    /// List all tables and views.
    pub fn list_relations(&self) -> Result<Vec<RelationInfo>> {
        let conn = self.conn.lock();
        schema::list_relations(&conn)
    }

    /// Append slices to the base table.
    pub fn insert_slices(&self, slices: &[Slice]) -> Result<()> {
        let conn = self.conn.lock();
        let mut appender = conn.appender(SLICES_TABLE)?;
        for s in slices {
            appender.append_row(params![
                s.track_id,
                s.ts,
                s.dur,
                s.name.as_str(),
                s.category.as_str(),
                s.bytes
            ])?;
        }
        appender.flush()?;
        debug!(count = slices.len(), "inserted slices");
        Ok(())
    }

    /// Load slices from a CSV file with a header row.
    ///
    /// The file needs `track_id`, `ts`, `dur` and `name` columns; `category`
    /// and `bytes` are optional.
    pub fn load_slices_csv(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("CSV file not found: {}", path.display()),
            )));
        }
        let path_str = path.display().to_string().replace('\'', "''");
        let conn = self.conn.lock();

        let source = format!("read_csv('{path_str}', header = true, auto_detect = true)");
        let mut stmt = conn.prepare(&format!("SELECT * FROM {source} LIMIT 0"))?;
        let rows = stmt.query([])?;
        let (_, columns) = extract_column_names(&rows);
        drop(rows);
        drop(stmt);

        for required in ["track_id", "ts", "dur", "name"] {
            if !columns.iter().any(|c| c == required) {
                return Err(EngineError::schema_mismatch(&path_str, required));
            }
        }
        let optional = |col: &str, fallback: &str| {
            if columns.iter().any(|c| c == col) {
                col.to_string()
            } else {
                fallback.to_string()
            }
        };
        let sql = format!(
            "INSERT INTO slices (track_id, ts, dur, name, category, bytes) \
             SELECT CAST(track_id AS BIGINT), CAST(ts AS BIGINT), CAST(dur AS BIGINT), \
             CAST(name AS VARCHAR), COALESCE(CAST({} AS VARCHAR), ''), CAST({} AS BIGINT) \
             FROM {source}",
            optional("category", "''"),
            optional("bytes", "NULL"),
        );
        let inserted = conn.execute(&sql, [])?;
        info!(path = %path.display(), inserted, "loaded slices from csv");
        Ok(inserted)
    }
}

fn replace_in(
    conn: &mut Connection,
    name: &str,
    definition: &str,
    how: Materialization,
    still_wanted: &dyn Fn() -> bool,
) -> Result<bool> {
    let create = match how {
        Materialization::View => format!("CREATE VIEW {name} AS {definition}"),
        Materialization::Table => format!("CREATE TABLE {name} AS {definition}"),
    };
    debug!(sql = create.as_str(), "replace relation");

    let tx: Transaction<'_> = conn.transaction()?;
    drop_in(&tx, name)?;
    tx.execute_batch(&create)?;
    if !still_wanted() {
        tx.rollback()?;
        debug!(relation = name, "replacement superseded, rolled back");
        return Ok(false);
    }
    tx.commit()?;
    info!(relation = name, kind = ?how, "materialized relation");
    Ok(true)
}
