//! Materialized debug tracks.
//!
//! A debug track snapshots an arbitrary view into a table with a fixed
//! slice shape (`id`, `ts`, `dur`, `name`) plus `arg_`-prefixed extra
//! columns, and announces it through a [`TrackEventSink`].
//!
//! The returned [`DebugTrack`] owns the table: once the last clone is
//! dropped the table goes with it, unless the handle was [`DebugTrack::leak`]ed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::TraceEngine;
use crate::error::Result;
use crate::schema::{self, require_columns};

/// Prefix for carried-over columns, keeping them clear of `id`/`ts`/`dur`/`name`.
pub const ARG_PREFIX: &str = "arg_";

static DEBUG_TRACK_COUNT: AtomicU64 = AtomicU64::new(0);

/// Which source columns hold the slice fields.
///
/// `dur` may also be the literal `"0"` for instant events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SliceColumns {
    pub ts: String,
    pub dur: String,
    pub name: String,
}

impl SliceColumns {
    pub fn new(ts: &str, dur: &str, name: &str) -> Self {
        Self {
            ts: ts.to_string(),
            dur: dur.to_string(),
            name: name.to_string(),
        }
    }

    fn is_instant(&self) -> bool {
        self.dur == "0"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugTrackConfig {
    pub sql_table_name: String,
    pub columns: SliceColumns,
}

/// Notifications for whoever displays tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackEvent {
    DebugTrackAdded { name: String, config: DebugTrackConfig },
    DebugTrackRemoved { sql_table_name: String },
}

pub trait TrackEventSink {
    fn emit(&self, event: TrackEvent);
}

impl TrackEventSink for mpsc::Sender<TrackEvent> {
    fn emit(&self, event: TrackEvent) {
        // A closed receiver means nobody is displaying tracks any more
        if self.send(event).is_err() {
            debug!("track event receiver gone");
        }
    }
}

impl TrackEventSink for Mutex<Vec<TrackEvent>> {
    fn emit(&self, event: TrackEvent) {
        self.lock().push(event);
    }
}

struct DebugTrackInner {
    engine: Arc<TraceEngine>,
    id: u64,
    name: String,
    config: DebugTrackConfig,
    keep: AtomicBool,
}

impl Drop for DebugTrackInner {
    fn drop(&mut self) {
        if *self.keep.get_mut() {
            return;
        }
        let table = &self.config.sql_table_name;
        match self.engine.drop_if_exists(table) {
            Ok(_) => debug!(table = table.as_str(), "dropped debug track table"),
            Err(e) => warn!(table = table.as_str(), error = %e, "failed to drop debug track table"),
        }
    }
}

/// Shared handle to a materialized debug track table.
#[derive(Clone)]
pub struct DebugTrack {
    inner: Arc<DebugTrackInner>,
}

impl fmt::Debug for DebugTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugTrack")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl DebugTrack {
    /// Process-wide sequence number, also embedded in the table name.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn table_name(&self) -> &str {
        &self.inner.config.sql_table_name
    }

    pub fn config(&self) -> &DebugTrackConfig {
        &self.inner.config
    }

    /// Drop the table now and announce it.
    ///
    /// Other clones of this handle keep pointing at the dropped table.
    pub fn remove(self, sink: &dyn TrackEventSink) -> Result<()> {
        self.inner.keep.store(true, Ordering::Release);
        self.inner.engine.drop_if_exists(self.table_name())?;
        info!(table = self.table_name(), "removed debug track");
        sink.emit(TrackEvent::DebugTrackRemoved {
            sql_table_name: self.table_name().to_string(),
        });
        Ok(())
    }

    /// Keep the table for the engine's lifetime. Returns its name.
    pub fn leak(self) -> String {
        self.inner.keep.store(true, Ordering::Release);
        self.table_name().to_string()
    }
}

fn build_sql(source_view: &str, columns: &SliceColumns, arg_columns: &[String]) -> String {
    let dur = if columns.is_instant() {
        "CAST(0 AS BIGINT)".to_string()
    } else {
        format!("COALESCE(TRY_CAST({} AS BIGINT), -1)", columns.dur)
    };
    let mut select = vec![
        format!("row_number() OVER (ORDER BY {}) AS id", columns.ts),
        format!("CAST({} AS BIGINT) AS ts", columns.ts),
        format!("{dur} AS dur"),
        format!("COALESCE(CAST({} AS VARCHAR), '') AS name", columns.name),
    ];
    select.extend(arg_columns.iter().map(|c| format!("{c} AS {ARG_PREFIX}{c}")));

    format!(
        "WITH prepared_data AS (SELECT {} FROM {source_view}) \
         SELECT * FROM prepared_data ORDER BY ts",
        select.join(", ")
    )
}

/// Materialize `source_view` as a debug track table and announce it on `sink`.
///
/// The table is named `materialized_{n}_{source_view}`; the track takes
/// `track_name` or, when blank, `Debug Track {n}`.
pub fn add_debug_track(
    engine: &Arc<TraceEngine>,
    source_view: &str,
    track_name: &str,
    columns: &SliceColumns,
    arg_columns: &[String],
    sink: &dyn TrackEventSink,
) -> Result<DebugTrack> {
    schema::validate_identifier(source_view)?;
    let mut needed: Vec<&str> = vec![columns.ts.as_str(), columns.name.as_str()];
    if !columns.is_instant() {
        needed.push(columns.dur.as_str());
    }
    needed.extend(arg_columns.iter().map(String::as_str));
    for column in &needed {
        schema::validate_identifier(column)?;
    }
    let source_columns = engine.describe_table(source_view)?;
    require_columns(source_view, &source_columns, &needed)?;

    let id = DEBUG_TRACK_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    let sql_table_name = format!("materialized_{id}_{source_view}");
    engine.create_table(&sql_table_name, &build_sql(source_view, columns, arg_columns))?;

    let name = match track_name.trim() {
        "" => format!("Debug Track {id}"),
        trimmed => trimmed.to_string(),
    };
    let config = DebugTrackConfig {
        sql_table_name,
        columns: columns.clone(),
    };
    info!(
        track = name.as_str(),
        table = config.sql_table_name.as_str(),
        "added debug track"
    );
    sink.emit(TrackEvent::DebugTrackAdded {
        name: name.clone(),
        config: config.clone(),
    });

    Ok(DebugTrack {
        inner: Arc::new(DebugTrackInner {
            engine: Arc::clone(engine),
            id,
            name,
            config,
            keep: AtomicBool::new(false),
        }),
    })
}
