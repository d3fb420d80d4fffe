//! slicedb library - windowed slice aggregation over an embedded DuckDB.
//!
//! Slices (timed spans on numbered tracks) live in a `slices` table. A
//! selection [`Area`] picks a time window and a set of tracks; aggregation
//! controllers turn that selection into named views, and the result typing
//! layer turns those views into display columns.
//!
//! # Modules
//!
//! - [`engine`] - DuckDB connection wrapper, atomic view replacement, scripts
//! - [`schema`] - Base table DDL and relation introspection
//! - [`aggregation`] - Windowed group-by executor and the aggregation tabs
//! - [`columns`] - Column metadata, typed columns and the totals row
//! - [`debug_track`] - Materialized debug track tables
//! - [`selection`] - Areas, tracks and the track registry
//! - [`scheduler`] - Supersession of in-flight view builds
//!
//! # Example
//!
//! ```no_run
//! use slicedb::{
//!     AggregationController, Area, SliceAggregation, SliceTrack, TraceEngine, TrackRegistry,
//! };
//! use slicedb::engine::Slice;
//!
//! let engine = TraceEngine::open_in_memory()?;
//! engine.insert_slices(&[Slice::new(7, 900, 200, "A"), Slice::new(7, 4900, 50, "B")])?;
//!
//! let mut registry = TrackRegistry::new();
//! registry.register("main", SliceTrack { track_id: 7 });
//!
//! let area = Area::new(1000, 5000, vec!["main".to_string()])?;
//! let controller = SliceAggregation::new();
//! if controller.create_aggregate_view(&engine, &area, &registry)? {
//!     let rows = engine.execute("SELECT * FROM slice_aggregation")?;
//!     println!("{} names", rows.row_count);
//! }
//! # Ok::<(), slicedb::EngineError>(())
//! ```

pub mod aggregation;
pub mod columns;
pub mod config;
pub mod debug_track;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod schema;
pub mod selection;

pub use aggregation::{
    aggregate, aggregate_with, AggregateKind, AggregateOutcome, AggregationController,
    AggregationQuery, CategoryPredicate, PerformanceAggregation, SliceAggregation, ViewOutcome,
};
pub use columns::{ColumnDef, ColumnKind, SortDirection, Sorting, TypedColumns};
pub use config::EngineConfig;
pub use debug_track::{add_debug_track, DebugTrack, SliceColumns, TrackEvent, TrackEventSink};
pub use engine::{QueryResult, TraceEngine, Value};
pub use error::{EngineError, Result};
pub use scheduler::{ViewScheduler, ViewTicket};
pub use selection::{Area, AsyncSliceTrack, SliceTrack, TimeWindow, Track, TrackRegistry};
