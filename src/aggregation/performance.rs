use crate::columns::{ColumnDef, ColumnKind, SortDirection, Sorting};
use crate::engine::TraceEngine;
use crate::error::{EngineError, Result};
use crate::schema::SLICES_TABLE;
use crate::selection::TimeWindow;

use super::controller::{AggregationController, PlannedView};
use super::{window_filter_sql, AggregateKind, AggregationQuery, CategoryPredicate};

/// Share of the window a track spends busy with work at or above this
/// percentage needs no hint.
pub const PROCESSING_OK_PCT: f64 = 80.0;

const LOW_PROCESSING_HINT: &str =
    "Possible causes: (1) Small chunk size. Try increasing the chunk size; \
     (2) Small kernel. Try increasing the kernel complexity by adding more operations; \
     (3) Bad partitioning.";

/// Per-track processing and transfer shares of the selection window.
///
/// Also keeps a `selection_area` view with the raw selected slices.
#[derive(Debug, Clone)]
pub struct PerformanceAggregation {
    kind: String,
    area_view: String,
}

impl PerformanceAggregation {
    pub const DEFAULT_KIND: &'static str = "performance_aggregation";
    pub const AREA_VIEW: &'static str = "selection_area";

    pub fn new() -> Self {
        Self {
            kind: Self::DEFAULT_KIND.to_string(),
            area_view: Self::AREA_VIEW.to_string(),
        }
    }

    fn processing() -> CategoryPredicate {
        CategoryPredicate::Contains("processing".to_string())
    }

    fn transfering() -> CategoryPredicate {
        CategoryPredicate::Contains("transfering".to_string())
    }

    pub fn query(&self, track_ids: &[i64], window: &TimeWindow) -> AggregationQuery {
        let processing_ns = AggregateKind::ConditionalSum {
            column: "dur".to_string(),
            predicate: Self::processing(),
        };
        AggregationQuery::new(SLICES_TABLE, track_ids.to_vec(), *window, "track_id")
            .with("track_processing_time", AggregateKind::Sum("dur".to_string()))
            .with("num_occurrences", AggregateKind::Count)
            .with(
                "track_percentage_processing",
                AggregateKind::WindowShare(Self::processing()),
            )
            .with(
                "track_percentage_transfering",
                AggregateKind::WindowShare(Self::transfering()),
            )
            .with("track_data_amount", AggregateKind::Sum("bytes".to_string()))
            .with(
                "processing_time_per_byte",
                AggregateKind::Ratio {
                    numerator: Box::new(processing_ns),
                    denominator: Box::new(AggregateKind::Sum("bytes".to_string())),
                },
            )
            .with(
                "hint",
                AggregateKind::Threshold {
                    value: Box::new(AggregateKind::WindowShare(Self::processing())),
                    threshold: PROCESSING_OK_PCT,
                    above: String::new(),
                    below: LOW_PROCESSING_HINT.to_string(),
                },
            )
    }
}

impl Default for PerformanceAggregation {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregationController for PerformanceAggregation {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn tab_name(&self) -> &str {
        "Performance"
    }

    fn column_definitions(&self) -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("Track", ColumnKind::Number, "track_id"),
            ColumnDef::new("Number of elements", ColumnKind::Number, "num_occurrences").summed(),
            ColumnDef::new(
                "Processing time (ms)",
                ColumnKind::TimestampNs,
                "track_processing_time",
            )
            .summed(),
            ColumnDef::new(
                "Percentage of total processing time (%)",
                ColumnKind::Number,
                "track_percentage_processing",
            ),
            ColumnDef::new(
                "Percentage of total transfering time (%)",
                ColumnKind::Number,
                "track_percentage_transfering",
            ),
            ColumnDef::new(
                "Total amount of data used (bytes)",
                ColumnKind::Number,
                "track_data_amount",
            )
            .summed(),
            ColumnDef::new(
                "Processing time / byte (ns)",
                ColumnKind::Number,
                "processing_time_per_byte",
            ),
            ColumnDef::new("Hint", ColumnKind::String, "hint"),
        ]
    }

    fn default_sorting(&self) -> Sorting {
        Sorting::new("track_id", SortDirection::Asc)
    }

    fn owned_views(&self) -> Vec<String> {
        vec![self.kind.clone(), self.area_view.clone()]
    }

    fn plan(
        &self,
        engine: &TraceEngine,
        track_ids: &[i64],
        window: &TimeWindow,
    ) -> Result<Vec<PlannedView>> {
        let query = self.query(track_ids, window);
        query.validate(engine)?;
        let no_tracks = || EngineError::query("no tracks to aggregate");
        let aggregate_sql = query.to_sql().ok_or_else(no_tracks)?;
        let area_sql = window_filter_sql(SLICES_TABLE, track_ids, window).ok_or_else(no_tracks)?;
        Ok(vec![
            PlannedView {
                name: self.kind.clone(),
                sql: aggregate_sql,
            },
            PlannedView {
                name: self.area_view.clone(),
                sql: area_sql,
            },
        ])
    }
}
