//! Column metadata and typed result columns for aggregation views.
//!
//! This is the boundary where engine values (nanoseconds, raw counts) become
//! display values. Nothing upstream converts units.

use serde::Serialize;

use crate::engine::{QueryResult, TraceEngine, Value};
use crate::error::{EngineError, Result};
use crate::schema;

pub const NS_PER_MS: f64 = 1e6;

pub fn ns_to_ms(ns: f64) -> f64 {
    ns / NS_PER_MS
}

/// How a column's values are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnKind {
    String,
    Number,
    /// Nanosecond durations, shown in milliseconds.
    TimestampNs,
}

/// Display contract for one result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub title: String,
    pub kind: ColumnKind,
    pub column_id: String,
    /// Whether the column contributes to the totals row.
    pub sum: bool,
}

impl ColumnDef {
    pub fn new(title: &str, kind: ColumnKind, column_id: &str) -> Self {
        Self {
            title: title.to_string(),
            kind,
            column_id: column_id.to_string(),
            sum: false,
        }
    }

    pub fn summed(mut self) -> Self {
        self.sum = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sorting {
    pub column: String,
    pub direction: SortDirection,
}

impl Sorting {
    pub fn new(column: &str, direction: SortDirection) -> Self {
        Self {
            column: column.to_string(),
            direction,
        }
    }
}

/// Fail with `SchemaMismatch` if any definition names a column not in `columns`.
pub fn validate_columns(relation: &str, defs: &[ColumnDef], columns: &[String]) -> Result<()> {
    for def in defs {
        if !columns.iter().any(|c| *c == def.column_id) {
            return Err(EngineError::schema_mismatch(relation, &def.column_id));
        }
    }
    Ok(())
}

/// Values of one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ColumnData {
    Number(Vec<Option<f64>>),
    String(Vec<String>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Number(v) => v.len(),
            ColumnData::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TypedColumn {
    pub def: ColumnDef,
    pub data: ColumnData,
}

/// A query result reshaped into one typed buffer per declared column.
#[derive(Debug, Clone, Serialize)]
pub struct TypedColumns {
    pub columns: Vec<TypedColumn>,
    pub row_count: usize,
}

impl TypedColumns {
    pub fn from_result(relation: &str, defs: &[ColumnDef], result: &QueryResult) -> Result<Self> {
        validate_columns(relation, defs, &result.columns)?;

        let columns = defs
            .iter()
            .map(|def| {
                let idx = result
                    .column_index(&def.column_id)
                    .ok_or_else(|| EngineError::schema_mismatch(relation, &def.column_id))?;
                let values = result.rows.iter().map(|row| &row[idx]);
                let data = match def.kind {
                    ColumnKind::String => ColumnData::String(
                        values
                            .map(|v| match v {
                                Value::Null => String::new(),
                                other => other.to_display_string(),
                            })
                            .collect(),
                    ),
                    ColumnKind::Number => ColumnData::Number(values.map(Value::as_f64).collect()),
                    ColumnKind::TimestampNs => {
                        ColumnData::Number(values.map(|v| v.as_f64().map(ns_to_ms)).collect())
                    }
                };
                Ok(TypedColumn {
                    def: def.clone(),
                    data,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            columns,
            row_count: result.row_count,
        })
    }

    pub fn get(&self, column_id: &str) -> Option<&ColumnData> {
        self.columns
            .iter()
            .find(|c| c.def.column_id == column_id)
            .map(|c| &c.data)
    }

    /// The totals row: a sum for each `sum` column, `None` elsewhere.
    pub fn rollup(&self) -> Vec<Option<f64>> {
        self.columns
            .iter()
            .map(|c| match (&c.data, c.def.sum) {
                (ColumnData::Number(values), true) => Some(values.iter().flatten().sum()),
                _ => None,
            })
            .collect()
    }
}

/// Read a view ordered by `sorting` and type it by `defs`.
pub fn fetch_view(
    engine: &TraceEngine,
    view: &str,
    defs: &[ColumnDef],
    sorting: &Sorting,
) -> Result<TypedColumns> {
    schema::validate_identifier(view)?;
    let names: Vec<String> = engine
        .describe_table(view)?
        .into_iter()
        .map(|c| c.name)
        .collect();
    validate_columns(view, defs, &names)?;
    if !names.contains(&sorting.column) {
        return Err(EngineError::schema_mismatch(view, &sorting.column));
    }

    let sql = format!(
        "SELECT * FROM {view} ORDER BY {} {}",
        sorting.column,
        sorting.direction.sql()
    );
    let result = engine.execute(&sql)?;
    TypedColumns::from_result(view, defs, &result)
}
