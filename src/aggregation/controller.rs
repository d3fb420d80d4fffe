use serde::Serialize;
use tracing::{info, warn};

use crate::columns::{validate_columns, ColumnDef, Sorting};
use crate::engine::TraceEngine;
use crate::error::{EngineError, Result};
use crate::selection::{Area, TimeWindow, TrackRegistry};

/// A view a controller wants materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedView {
    pub name: String,
    pub sql: String,
}

/// Whether an aggregation tab has something to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewOutcome {
    /// The view exists and matches the latest selection.
    Available,
    /// Nothing to show: no tracks selected, or the query failed.
    Unavailable,
    /// A newer request for the same view took over; nothing was applied.
    Superseded,
}

/// One aggregation tab: the views it builds and how to display them.
pub trait AggregationController: Send + Sync {
    /// Name of the main view; also identifies the controller.
    fn kind(&self) -> &str;

    fn tab_name(&self) -> &str;

    fn column_definitions(&self) -> Vec<ColumnDef>;

    fn default_sorting(&self) -> Sorting;

    /// Views this controller owns. All are dropped before a rebuild.
    fn owned_views(&self) -> Vec<String> {
        vec![self.kind().to_string()]
    }

    /// Plan the views for a non-empty track selection. The main view comes
    /// first.
    fn plan(
        &self,
        engine: &TraceEngine,
        track_ids: &[i64],
        window: &TimeWindow,
    ) -> Result<Vec<PlannedView>>;

    /// Rebuild this controller's views for `area`; false if there is nothing
    /// to show.
    fn create_aggregate_view(
        &self,
        engine: &TraceEngine,
        area: &Area,
        registry: &TrackRegistry,
    ) -> Result<bool>
    where
        Self: Sized,
    {
        create_aggregate_view(self, engine, area, registry)
    }
}

/// Drop the controller's views, then rebuild them for `area`.
///
/// Query failures are logged and reported as `false` so one broken tab does
/// not take the session down. Metadata that does not match the built view is
/// a programming error and is returned as `SchemaMismatch`.
pub fn create_aggregate_view(
    controller: &dyn AggregationController,
    engine: &TraceEngine,
    area: &Area,
    registry: &TrackRegistry,
) -> Result<bool> {
    for view in controller.owned_views() {
        engine.drop_if_exists(&view)?;
    }

    let track_ids = registry.selected_track_ids(area);
    if track_ids.is_empty() {
        return Ok(false);
    }

    let built = plan_and_define(controller, engine, &track_ids, &area.window(), &|| true);
    match built {
        Ok(committed) => Ok(committed),
        Err(e) if e.is_recoverable() => {
            warn!(kind = controller.kind(), error = %e, "aggregation view unavailable");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Plan and define every view, stopping as soon as `still_wanted` fails.
pub(crate) fn plan_and_define(
    controller: &dyn AggregationController,
    engine: &TraceEngine,
    track_ids: &[i64],
    window: &TimeWindow,
    still_wanted: &dyn Fn() -> bool,
) -> Result<bool> {
    let views = controller.plan(engine, track_ids, window)?;
    for view in &views {
        let committed = engine.replace_relation(
            &view.name,
            &view.sql,
            crate::engine::Materialization::View,
            still_wanted,
        )?;
        if !committed {
            return Ok(false);
        }
    }

    let columns: Vec<String> = engine
        .describe_table(controller.kind())?
        .into_iter()
        .map(|c| c.name)
        .collect();
    validate_columns(controller.kind(), &controller.column_definitions(), &columns)?;
    if !columns.contains(&controller.default_sorting().column) {
        return Err(EngineError::schema_mismatch(
            controller.kind(),
            &controller.default_sorting().column,
        ));
    }

    info!(kind = controller.kind(), tracks = track_ids.len(), "aggregation view ready");
    Ok(true)
}
