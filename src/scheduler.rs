//! Supersession of in-flight view builds.
//!
//! Every request to rebuild a view takes a [`ViewTicket`] for that view's
//! name. Starting a newer request for the same name makes all older
//! tickets stale; a stale build rolls back instead of committing, and a
//! stale fetch stops reading rows.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::aggregation::{
    aggregate_with, AggregateOutcome, AggregationController, AggregationQuery, ViewOutcome,
};
use crate::engine::{QueryResult, TraceEngine};
use crate::error::Result;
use crate::selection::{Area, TrackRegistry};

/// Claim on the latest request for one view name.
#[derive(Debug, Clone)]
pub struct ViewTicket {
    name: String,
    generation: u64,
    latest: Arc<AtomicU64>,
}

impl ViewTicket {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once a newer request for the same name has started.
    pub fn is_current(&self) -> bool {
        self.latest.load(Ordering::Acquire) == self.generation
    }

    /// Run `sql`, giving up as soon as this ticket goes stale.
    pub fn fetch(&self, engine: &TraceEngine, sql: &str) -> Result<Option<QueryResult>> {
        let result = engine.execute_cancellable(sql, &|| self.is_current())?;
        if result.is_none() {
            debug!(view = self.name.as_str(), "fetch superseded");
        }
        Ok(result)
    }

    /// Run a windowed aggregation, dropping its rows if this ticket goes
    /// stale before they are all read.
    pub fn aggregate(
        &self,
        engine: &TraceEngine,
        query: &AggregationQuery,
    ) -> Result<AggregateOutcome> {
        let outcome = aggregate_with(engine, query, &|| self.is_current())?;
        if matches!(outcome, AggregateOutcome::Superseded) {
            debug!(view = self.name.as_str(), "aggregation superseded");
        }
        Ok(outcome)
    }
}

#[derive(Debug, Default)]
pub struct ViewScheduler {
    generations: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl ViewScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a request for `name`, superseding any earlier one.
    pub fn begin(&self, name: &str) -> ViewTicket {
        let latest = {
            let mut generations = self.generations.lock();
            Arc::clone(generations.entry(name.to_string()).or_default())
        };
        let generation = latest.fetch_add(1, Ordering::AcqRel) + 1;
        ViewTicket {
            name: name.to_string(),
            generation,
            latest,
        }
    }

    /// Make every outstanding ticket for `name` stale.
    pub fn cancel(&self, name: &str) {
        if let Some(latest) = self.generations.lock().get(name) {
            latest.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Rebuild `controller`'s views for `area` under a fresh ticket.
    pub fn materialize(
        &self,
        engine: &TraceEngine,
        controller: &dyn AggregationController,
        area: &Area,
        registry: &TrackRegistry,
    ) -> Result<ViewOutcome> {
        let ticket = self.begin(controller.kind());
        self.materialize_with(&ticket, engine, controller, area, registry)
    }

    /// Rebuild under an existing ticket.
    ///
    /// Views are replaced atomically and only while `ticket` is current, so
    /// a superseded build never leaves its own views applied.
    pub fn materialize_with(
        &self,
        ticket: &ViewTicket,
        engine: &TraceEngine,
        controller: &dyn AggregationController,
        area: &Area,
        registry: &TrackRegistry,
    ) -> Result<ViewOutcome> {
        let track_ids = registry.selected_track_ids(area);
        if track_ids.is_empty() {
            return clear(ticket, engine, controller);
        }

        let built = crate::aggregation::plan_and_define(
            controller,
            engine,
            &track_ids,
            &area.window(),
            &|| ticket.is_current(),
        );
        match built {
            Ok(true) => Ok(ViewOutcome::Available),
            Ok(false) => {
                debug!(view = ticket.name(), "build superseded");
                Ok(ViewOutcome::Superseded)
            }
            Err(e) if e.is_recoverable() => {
                warn!(view = ticket.name(), error = %e, "aggregation view unavailable");
                clear(ticket, engine, controller)
            }
            Err(e) => Err(e),
        }
    }
}

fn clear(
    ticket: &ViewTicket,
    engine: &TraceEngine,
    controller: &dyn AggregationController,
) -> Result<ViewOutcome> {
    if !ticket.is_current() {
        return Ok(ViewOutcome::Superseded);
    }
    for view in controller.owned_views() {
        engine.drop_if_exists(&view)?;
    }
    Ok(ViewOutcome::Unavailable)
}
