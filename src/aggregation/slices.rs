use crate::columns::{ColumnDef, ColumnKind, SortDirection, Sorting};
use crate::engine::TraceEngine;
use crate::error::{EngineError, Result};
use crate::schema::SLICES_TABLE;
use crate::selection::TimeWindow;

use super::controller::{AggregationController, PlannedView};
use super::{AggregateKind, AggregationQuery};

/// Per-name wall time, average duration and occurrence count.
#[derive(Debug, Clone)]
pub struct SliceAggregation {
    kind: String,
}

impl SliceAggregation {
    pub const DEFAULT_KIND: &'static str = "slice_aggregation";

    pub fn new() -> Self {
        Self::with_kind(Self::DEFAULT_KIND)
    }

    /// Use a different view name, e.g. to run two selections side by side.
    pub fn with_kind(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
        }
    }

    pub fn query(&self, track_ids: &[i64], window: &TimeWindow) -> AggregationQuery {
        AggregationQuery::new(SLICES_TABLE, track_ids.to_vec(), *window, "name")
            .with("total_dur", AggregateKind::Sum("dur".to_string()))
            .with("avg_dur", AggregateKind::Avg("dur".to_string()))
            .with("occurrences", AggregateKind::Count)
    }
}

impl Default for SliceAggregation {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregationController for SliceAggregation {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn tab_name(&self) -> &str {
        "Slices"
    }

    fn column_definitions(&self) -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("Name", ColumnKind::String, "name"),
            ColumnDef::new("Wall duration (ms)", ColumnKind::TimestampNs, "total_dur").summed(),
            ColumnDef::new("Avg Wall duration (ms)", ColumnKind::TimestampNs, "avg_dur"),
            ColumnDef::new("Occurrences", ColumnKind::Number, "occurrences").summed(),
        ]
    }

    fn default_sorting(&self) -> Sorting {
        Sorting::new("total_dur", SortDirection::Desc)
    }

    fn plan(
        &self,
        engine: &TraceEngine,
        track_ids: &[i64],
        window: &TimeWindow,
    ) -> Result<Vec<PlannedView>> {
        let query = self.query(track_ids, window);
        query.validate(engine)?;
        let sql = query
            .to_sql()
            .ok_or_else(|| EngineError::query("no tracks to aggregate"))?;
        Ok(vec![PlannedView {
            name: self.kind.clone(),
            sql,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{fetch_view, ColumnData};
    use crate::engine::Slice;
    use crate::selection::{Area, SliceTrack, TrackRegistry};

    fn setup() -> (TraceEngine, TrackRegistry) {
        let engine = TraceEngine::open_in_memory().unwrap();
        engine
            .insert_slices(&[
                Slice::new(7, 900, 200, "A"),
                Slice::new(7, 4900, 50, "B"),
                Slice::new(9, 2000, 100, "C"),
            ])
            .unwrap();
        let mut registry = TrackRegistry::new();
        registry.register("ui-7", SliceTrack { track_id: 7 });
        registry.register("ui-9", SliceTrack { track_id: 9 });
        (engine, registry)
    }

    #[test]
    fn test_example_selection() {
        let (engine, registry) = setup();
        let controller = SliceAggregation::new();
        let area = Area::new(1000, 5000, vec!["ui-7".to_string()]).unwrap();
        assert!(controller
            .create_aggregate_view(&engine, &area, &registry)
            .unwrap());

        let typed = fetch_view(
            &engine,
            controller.kind(),
            &controller.column_definitions(),
            &controller.default_sorting(),
        )
        .unwrap();
        assert_eq!(
            typed.get("name"),
            Some(&ColumnData::String(vec!["A".to_string(), "B".to_string()]))
        );
        assert_eq!(
            typed.get("occurrences"),
            Some(&ColumnData::Number(vec![Some(1.0), Some(1.0)]))
        );
    }

    #[test]
    fn test_empty_selection_drops_old_view() {
        let (engine, registry) = setup();
        let controller = SliceAggregation::new();
        let area = Area::new(0, 10_000, vec!["ui-9".to_string()]).unwrap();
        assert!(controller
            .create_aggregate_view(&engine, &area, &registry)
            .unwrap());

        let empty = Area::new(0, 10_000, vec!["group".to_string()]).unwrap();
        assert!(!controller
            .create_aggregate_view(&engine, &empty, &registry)
            .unwrap());
        assert_eq!(engine.relation_kind(controller.kind()).unwrap(), None);
    }

    #[test]
    fn test_column_definitions_match_view() {
        let (engine, registry) = setup();
        let controller = SliceAggregation::new();
        let area = Area::new(0, 10_000, vec!["ui-7".to_string(), "ui-9".to_string()]).unwrap();
        assert!(controller
            .create_aggregate_view(&engine, &area, &registry)
            .unwrap());
        let typed = fetch_view(
            &engine,
            controller.kind(),
            &controller.column_definitions(),
            &controller.default_sorting(),
        )
        .unwrap();
        assert_eq!(typed.row_count, 3);
        // total_dur sums to 350ns = 0.00035ms
        let rollup = typed.rollup();
        assert!((rollup[1].unwrap() - 0.00035).abs() < 1e-12);
        assert_eq!(rollup[3], Some(3.0));
    }
}
