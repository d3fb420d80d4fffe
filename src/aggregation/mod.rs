//! Windowed aggregation over slice relations.
//!
//! Every aggregation first narrows its base relation to the selected tracks
//! and the selection window, then groups by one key column. Durations stay
//! in nanoseconds throughout; conversion for display happens in
//! [`crate::columns`].
//!
//! Every division in generated SQL goes through `NULLIF(denominator, 0)`, so
//! an empty denominator produces NULL rather than an error.

mod controller;
mod performance;
mod slices;

pub use controller::{create_aggregate_view, AggregationController, PlannedView, ViewOutcome};
pub(crate) use controller::plan_and_define;
pub use performance::PerformanceAggregation;
pub use slices::SliceAggregation;

use serde::Serialize;
use tracing::debug;

use crate::engine::{QueryResult, TraceEngine};
use crate::error::Result;
use crate::schema::{self, require_columns, WINDOW_COLUMNS};
use crate::selection::TimeWindow;

/// Condition on a slice's category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CategoryPredicate {
    /// Case-sensitive substring match.
    Contains(String),
    Equals(String),
}

impl CategoryPredicate {
    fn to_sql(&self) -> String {
        match self {
            CategoryPredicate::Contains(needle) => {
                format!("contains(category, {})", quote_literal(needle))
            }
            CategoryPredicate::Equals(value) => format!("category = {}", quote_literal(value)),
        }
    }
}

/// What to compute for each group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AggregateKind {
    /// Number of rows in the group.
    Count,
    Sum(String),
    /// `sum / count` over non-null values.
    Avg(String),
    /// Sum of `column` over rows matching the predicate.
    ConditionalSum {
        column: String,
        predicate: CategoryPredicate,
    },
    /// Percentage of the window covered by matching slices' durations.
    WindowShare(CategoryPredicate),
    /// `numerator / denominator`, NULL when the denominator is zero.
    Ratio {
        numerator: Box<AggregateKind>,
        denominator: Box<AggregateKind>,
    },
    /// `above` when `value > threshold`, otherwise `below`.
    Threshold {
        value: Box<AggregateKind>,
        threshold: f64,
        above: String,
        below: String,
    },
}

impl AggregateKind {
    fn to_sql(&self, window: &TimeWindow) -> String {
        match self {
            AggregateKind::Count => "COUNT(*)".to_string(),
            AggregateKind::Sum(column) => format!("SUM({column})"),
            AggregateKind::Avg(column) => {
                format!("CAST(SUM({column}) AS DOUBLE) / NULLIF(COUNT({column}), 0)")
            }
            AggregateKind::ConditionalSum { column, predicate } => format!(
                "COALESCE(SUM(CASE WHEN {} THEN {column} ELSE 0 END), 0)",
                predicate.to_sql()
            ),
            AggregateKind::WindowShare(predicate) => format!(
                "100.0 * CAST(SUM(CASE WHEN {} THEN dur ELSE 0 END) AS DOUBLE) / NULLIF({}, 0)",
                predicate.to_sql(),
                window.duration_ns()
            ),
            AggregateKind::Ratio {
                numerator,
                denominator,
            } => format!(
                "CAST({} AS DOUBLE) / NULLIF({}, 0)",
                numerator.to_sql(window),
                denominator.to_sql(window)
            ),
            AggregateKind::Threshold {
                value,
                threshold,
                above,
                below,
            } => format!(
                "CASE WHEN ({}) > {threshold:?} THEN {} ELSE {} END",
                value.to_sql(window),
                quote_literal(above),
                quote_literal(below)
            ),
        }
    }

    /// Columns of the base relation this aggregate reads.
    fn referenced_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            AggregateKind::Count => {}
            AggregateKind::Sum(column) | AggregateKind::Avg(column) => out.push(column),
            AggregateKind::ConditionalSum { column, .. } => {
                out.push(column);
                out.push("category");
            }
            AggregateKind::WindowShare(_) => out.push("category"),
            AggregateKind::Ratio {
                numerator,
                denominator,
            } => {
                numerator.referenced_columns(out);
                denominator.referenced_columns(out);
            }
            AggregateKind::Threshold { value, .. } => value.referenced_columns(out),
        }
    }
}

/// A named output column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregation {
    pub alias: String,
    pub kind: AggregateKind,
}

impl Aggregation {
    pub fn new(alias: &str, kind: AggregateKind) -> Self {
        Self {
            alias: alias.to_string(),
            kind,
        }
    }
}

/// Outcome of a windowed aggregation.
#[derive(Debug)]
pub enum AggregateOutcome {
    /// No tracks were selected; nothing was run.
    Unavailable,
    /// The caller lost interest while rows were read; they were discarded.
    Superseded,
    Rows(QueryResult),
}

impl AggregateOutcome {
    pub fn rows(&self) -> Option<&QueryResult> {
        match self {
            AggregateOutcome::Unavailable | AggregateOutcome::Superseded => None,
            AggregateOutcome::Rows(result) => Some(result),
        }
    }
}

/// A windowed group-by over a slice relation.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationQuery {
    pub base: String,
    pub track_ids: Vec<i64>,
    pub window: TimeWindow,
    pub group_key: String,
    pub aggregations: Vec<Aggregation>,
}

impl AggregationQuery {
    pub fn new(base: &str, track_ids: Vec<i64>, window: TimeWindow, group_key: &str) -> Self {
        Self {
            base: base.to_string(),
            track_ids,
            window,
            group_key: group_key.to_string(),
            aggregations: Vec::new(),
        }
    }

    pub fn with(mut self, alias: &str, kind: AggregateKind) -> Self {
        self.aggregations.push(Aggregation::new(alias, kind));
        self
    }

    /// Check names and the base relation's columns.
    pub fn validate(&self, engine: &TraceEngine) -> Result<()> {
        schema::validate_identifier(&self.base)?;
        schema::validate_identifier(&self.group_key)?;

        let mut needed: Vec<&str> = WINDOW_COLUMNS.to_vec();
        needed.push(&self.group_key);
        for agg in &self.aggregations {
            schema::validate_identifier(&agg.alias)?;
            agg.kind.referenced_columns(&mut needed);
        }
        for column in &needed {
            schema::validate_identifier(column)?;
        }

        let columns = engine.describe_table(&self.base)?;
        require_columns(&self.base, &columns, &needed)
    }

    /// The SQL for this aggregation, or `None` when no tracks are selected.
    pub fn to_sql(&self) -> Option<String> {
        let filtered = window_filter_sql(&self.base, &self.track_ids, &self.window)?;

        let mut select = vec![self.group_key.clone()];
        for agg in &self.aggregations {
            select.push(format!("{} AS {}", agg.kind.to_sql(&self.window), agg.alias));
        }

        Some(format!(
            "WITH windowed AS (\
             SELECT * REPLACE (CASE WHEN dur = -1 THEN 0 ELSE dur END AS dur) FROM ({filtered})\
             ) SELECT {} FROM windowed GROUP BY {}",
            select.join(", "),
            self.group_key
        ))
    }
}

/// Rows of `base` on `track_ids` that overlap `window`, or `None` when no
/// tracks are given.
///
/// A slice overlaps when `ts < end AND ts + dur > start`; unterminated
/// slices (`dur = -1`) only need `ts < end`.
pub fn window_filter_sql(base: &str, track_ids: &[i64], window: &TimeWindow) -> Option<String> {
    if track_ids.is_empty() {
        return None;
    }
    let ids: Vec<String> = track_ids.iter().map(i64::to_string).collect();
    Some(format!(
        "SELECT * FROM {base} WHERE track_id IN ({}) AND ts < {} AND (dur = -1 OR ts + dur > {})",
        ids.join(", "),
        window.end_ns(),
        window.start_ns()
    ))
}

/// Run a windowed aggregation and return its rows.
pub fn aggregate(engine: &TraceEngine, query: &AggregationQuery) -> Result<AggregateOutcome> {
    aggregate_with(engine, query, &|| true)
}

/// Like [`aggregate`], but abandons the query once `keep_going` returns
/// false. Rows read up to that point are dropped.
pub fn aggregate_with(
    engine: &TraceEngine,
    query: &AggregationQuery,
    keep_going: &dyn Fn() -> bool,
) -> Result<AggregateOutcome> {
    let Some(sql) = query.to_sql() else {
        debug!(
            base = query.base.as_str(),
            "no tracks selected, skipping aggregation"
        );
        return Ok(AggregateOutcome::Unavailable);
    };
    query.validate(engine)?;
    match engine.execute_cancellable(&sql, keep_going)? {
        Some(result) => Ok(AggregateOutcome::Rows(result)),
        None => {
            debug!(base = query.base.as_str(), "aggregation abandoned");
            Ok(AggregateOutcome::Superseded)
        }
    }
}

/// Materialize a windowed aggregation as the view `name`.
///
/// Returns false, without touching any relation, when no tracks are selected.
pub fn create_view(engine: &TraceEngine, name: &str, query: &AggregationQuery) -> Result<bool> {
    let Some(sql) = query.to_sql() else {
        return Ok(false);
    };
    query.validate(engine)?;
    engine.define_view(name, &sql)?;
    Ok(true)
}

/// Quote a string as a SQL literal.
pub(crate) fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::engine::{Slice, Value};
    use crate::error::EngineError;

    fn engine() -> TraceEngine {
        let engine = TraceEngine::open_in_memory().unwrap();
        engine
            .insert_slices(&[
                Slice::new(7, 900, 200, "A"),
                Slice::new(7, 4900, 50, "B"),
                Slice::new(9, 2000, 100, "C"),
            ])
            .unwrap();
        engine
    }

    fn by_name(track_ids: Vec<i64>) -> AggregationQuery {
        AggregationQuery::new("slices", track_ids, TimeWindow::new(1000, 5000).unwrap(), "name")
            .with("total_dur", AggregateKind::Sum("dur".to_string()))
            .with("avg_dur", AggregateKind::Avg("dur".to_string()))
            .with("occurrences", AggregateKind::Count)
    }

    fn sorted_rows(result: &QueryResult) -> Vec<Vec<Value>> {
        let mut rows = result.rows.clone();
        rows.sort_by(|a, b| a[0].to_display_string().cmp(&b[0].to_display_string()));
        rows
    }

    #[test]
    fn test_groups_by_name_in_window() {
        let engine = engine();
        let outcome = aggregate(&engine, &by_name(vec![7])).unwrap();
        let result = outcome.rows().unwrap();
        assert_eq!(result.columns, ["name", "total_dur", "avg_dur", "occurrences"]);
        assert_eq!(
            sorted_rows(result),
            [
                vec![
                    Value::Text("A".to_string()),
                    Value::Int(200),
                    Value::Float(200.0),
                    Value::Int(1)
                ],
                vec![
                    Value::Text("B".to_string()),
                    Value::Int(50),
                    Value::Float(50.0),
                    Value::Int(1)
                ],
            ]
        );
    }

    #[test]
    fn test_empty_tracks_unavailable() {
        let engine = engine();
        let outcome = aggregate(&engine, &by_name(vec![])).unwrap();
        assert!(matches!(outcome, AggregateOutcome::Unavailable));
        assert!(!create_view(&engine, "v", &by_name(vec![])).unwrap());
        assert_eq!(engine.relation_kind("v").unwrap(), None);
    }

    #[test]
    fn test_window_boundaries() {
        let engine = TraceEngine::open_in_memory().unwrap();
        engine
            .insert_slices(&[
                // Ends exactly at start: excluded
                Slice::new(1, 900, 100, "ends_at_start"),
                // Starts exactly at end: excluded
                Slice::new(1, 5000, 10, "starts_at_end"),
                // Spans the whole window: included
                Slice::new(1, 0, 10_000, "spans"),
                // Never ended: included
                Slice::new(1, 10, -1, "open"),
            ])
            .unwrap();
        let outcome = aggregate(&engine, &by_name(vec![1])).unwrap();
        let rows = sorted_rows(outcome.rows().unwrap());
        let names: Vec<String> = rows.iter().map(|r| r[0].to_display_string()).collect();
        assert_eq!(names, ["open", "spans"]);
        // The open slice contributes no duration
        assert_eq!(rows[0][1], Value::Int(0));
    }

    #[test]
    fn test_avg_is_sum_over_count() {
        let engine = TraceEngine::open_in_memory().unwrap();
        engine
            .insert_slices(&[
                Slice::new(1, 1000, 10, "x"),
                Slice::new(1, 2000, 20, "x"),
                Slice::new(1, 3000, 40, "x"),
            ])
            .unwrap();
        let outcome = aggregate(&engine, &by_name(vec![1])).unwrap();
        let row = &outcome.rows().unwrap().rows[0];
        let sum = row[1].as_f64().unwrap();
        let count = row[3].as_f64().unwrap();
        assert_eq!(row[2].as_f64().unwrap(), sum / count);
    }

    #[test]
    fn test_window_share_and_zero_denominators() {
        let engine = TraceEngine::open_in_memory().unwrap();
        engine
            .insert_slices(&[
                Slice::new(1, 0, 250, "k").with_category("gpu processing"),
                Slice::new(1, 300, 100, "k").with_category("transfering"),
            ])
            .unwrap();
        let window = TimeWindow::new(0, 1000).unwrap();
        let query = AggregationQuery::new("slices", vec![1], window, "track_id")
            .with(
                "processing",
                AggregateKind::WindowShare(CategoryPredicate::Contains("processing".to_string())),
            )
            .with(
                "per_byte",
                AggregateKind::Ratio {
                    numerator: Box::new(AggregateKind::Sum("dur".to_string())),
                    denominator: Box::new(AggregateKind::Sum("bytes".to_string())),
                },
            );
        let outcome = aggregate(&engine, &query).unwrap();
        let row = &outcome.rows().unwrap().rows[0];
        assert_eq!(row[1], Value::Float(25.0));
        // No bytes recorded: NULL instead of a division error
        assert_eq!(row[2], Value::Null);

        let empty_window = AggregationQuery {
            window: TimeWindow::new(0, 0).unwrap(),
            ..query
        };
        let outcome = aggregate(&engine, &empty_window).unwrap();
        assert_eq!(outcome.rows().unwrap().row_count, 0);
    }

    #[test]
    fn test_missing_column_is_schema_mismatch() {
        let engine = engine();
        engine.define_view("narrow", "SELECT track_id, ts, name FROM slices").unwrap();
        let window = TimeWindow::new(0, 10).unwrap();
        let query = AggregationQuery::new("narrow", vec![7], window, "name")
            .with("n", AggregateKind::Count);
        let err = aggregate(&engine, &query).unwrap_err();
        assert!(matches!(err, EngineError::SchemaMismatch { column, .. } if column == "dur"));
    }

    #[test]
    fn test_unknown_base_relation() {
        let engine = engine();
        let query = AggregationQuery::new("nope", vec![7], TimeWindow::new(0, 10).unwrap(), "name");
        assert!(matches!(
            aggregate(&engine, &query).unwrap_err(),
            EngineError::UnknownTable { .. }
        ));
    }

    #[test]
    fn test_threshold_label() {
        let engine = TraceEngine::open_in_memory().unwrap();
        engine
            .insert_slices(&[Slice::new(1, 0, 900, "k").with_category("processing")])
            .unwrap();
        let window = TimeWindow::new(0, 1000).unwrap();
        let query = AggregationQuery::new("slices", vec![1], window, "track_id")
            .with(
                "hint",
                AggregateKind::Threshold {
                    value: Box::new(AggregateKind::WindowShare(CategoryPredicate::Equals(
                        "processing".to_string(),
                    ))),
                    threshold: 80.0,
                    above: "ok".to_string(),
                    below: "it's low".to_string(),
                },
            );
        let outcome = aggregate(&engine, &query).unwrap();
        assert_eq!(outcome.rows().unwrap().rows[0][1], Value::Text("ok".to_string()));
    }

    #[test]
    fn test_widest_window_share() {
        let engine = TraceEngine::open_in_memory().unwrap();
        engine
            .insert_slices(&[Slice::new(1, 0, 250, "k").with_category("processing")])
            .unwrap();
        let window = TimeWindow::new(-10, i64::MAX).unwrap();
        let query = AggregationQuery::new("slices", vec![1], window, "track_id").with(
            "share",
            AggregateKind::WindowShare(CategoryPredicate::Contains("processing".to_string())),
        );
        let outcome = aggregate(&engine, &query).unwrap();
        let share = outcome.rows().unwrap().rows[0][1].as_f64().unwrap();
        assert!(share > 0.0 && share < 1e-12, "share = {share}");
    }

    #[test]
    fn test_abandoned_aggregation_discards_rows() {
        let engine = TraceEngine::open_in_memory().unwrap();
        let slices: Vec<Slice> = (0..5)
            .map(|i| Slice::new(1, i * 100, 10, &format!("s{i}")))
            .collect();
        engine.insert_slices(&slices).unwrap();
        let window = TimeWindow::new(0, 1000).unwrap();
        let query = AggregationQuery::new("slices", vec![1], window, "name")
            .with("n", AggregateKind::Count);

        let polls = Cell::new(0);
        let keep_going = || {
            polls.set(polls.get() + 1);
            polls.get() <= 3
        };
        let outcome = aggregate_with(&engine, &query, &keep_going).unwrap();
        assert!(matches!(outcome, AggregateOutcome::Superseded));
        assert!(outcome.rows().is_none());

        let outcome = aggregate_with(&engine, &query, &|| true).unwrap();
        assert_eq!(outcome.rows().unwrap().row_count, 5);
    }

    #[test]
    fn test_sql_filter_matches_overlap_rule() {
        let window = TimeWindow::new(1000, 5000).unwrap();
        let cases = [
            (900, 100),
            (900, 101),
            (5000, 10),
            (4999, 1),
            (0, 10_000),
            (1000, 0),
            (10, -1),
            (5000, -1),
        ];
        let engine = TraceEngine::open_in_memory().unwrap();
        let slices: Vec<Slice> = cases
            .iter()
            .map(|&(ts, dur)| Slice::new(1, ts, dur, &format!("{ts}_{dur}")))
            .collect();
        engine.insert_slices(&slices).unwrap();

        let sql = window_filter_sql("slices", &[1], &window).unwrap();
        let selected: Vec<String> = engine
            .execute(&sql)
            .unwrap()
            .column("name")
            .unwrap()
            .into_iter()
            .map(Value::to_display_string)
            .collect();
        for (ts, dur) in cases {
            let name = format!("{ts}_{dur}");
            assert_eq!(
                selected.contains(&name),
                window.overlaps(ts, dur),
                "slice ts={ts} dur={dur}"
            );
        }
    }

    #[test]
    fn test_create_view() {
        let engine = engine();
        assert!(create_view(&engine, "by_name", &by_name(vec![7, 9])).unwrap());
        let result = engine.execute("SELECT name FROM by_name ORDER BY name").unwrap();
        assert_eq!(result.row_count, 3);
    }
}
