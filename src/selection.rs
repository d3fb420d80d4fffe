//! Selection areas and track resolution.
//!
//! The presentation layer selects UI tracks by key. Each UI track knows which
//! engine track ids back it; a [`TrackRegistry`] maps keys to tracks and is
//! passed explicitly to whoever needs to resolve a selection.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{EngineError, Result};

/// A user-selected time window `[start_ns, end_ns)` plus selected UI tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Area {
    start_ns: i64,
    end_ns: i64,
    tracks: Vec<String>,
}

impl Area {
    pub fn new(start_ns: i64, end_ns: i64, tracks: Vec<String>) -> Result<Self> {
        if end_ns < start_ns {
            return Err(EngineError::InvalidArea { start_ns, end_ns });
        }
        Ok(Self {
            start_ns,
            end_ns,
            tracks,
        })
    }

    pub fn start_ns(&self) -> i64 {
        self.start_ns
    }

    pub fn end_ns(&self) -> i64 {
        self.end_ns
    }

    /// Selected UI track keys.
    pub fn tracks(&self) -> &[String] {
        &self.tracks
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            start_ns: self.start_ns,
            end_ns: self.end_ns,
        }
    }
}

/// Half-open time interval in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    start_ns: i64,
    end_ns: i64,
}

impl TimeWindow {
    pub fn new(start_ns: i64, end_ns: i64) -> Result<Self> {
        if end_ns < start_ns {
            return Err(EngineError::InvalidArea { start_ns, end_ns });
        }
        Ok(Self { start_ns, end_ns })
    }

    pub fn start_ns(&self) -> i64 {
        self.start_ns
    }

    pub fn end_ns(&self) -> i64 {
        self.end_ns
    }

    /// Width of the window. Widened so `[i64::MIN, i64::MAX)` still fits.
    pub fn duration_ns(&self) -> i128 {
        i128::from(self.end_ns) - i128::from(self.start_ns)
    }

    /// Whether a slice `[ts, ts + dur)` overlaps the window.
    ///
    /// A slice with `dur == -1` has no end and overlaps iff it starts before
    /// the window ends.
    pub fn overlaps(&self, ts: i64, dur: i64) -> bool {
        if ts >= self.end_ns {
            return false;
        }
        dur == -1 || ts.saturating_add(dur) > self.start_ns
    }
}

/// Something that can be selected in the UI and is backed by engine tracks.
pub trait Track: Send + Sync {
    /// Engine track ids whose slices this UI track shows.
    fn resolve_underlying_track_ids(&self) -> Vec<i64>;
}

/// A track showing the slices of exactly one engine track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceTrack {
    pub track_id: i64,
}

impl Track for SliceTrack {
    fn resolve_underlying_track_ids(&self) -> Vec<i64> {
        vec![self.track_id]
    }
}

/// A track merging async slices from several engine tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncSliceTrack {
    pub track_ids: Vec<i64>,
}

impl Track for AsyncSliceTrack {
    fn resolve_underlying_track_ids(&self) -> Vec<i64> {
        self.track_ids.clone()
    }
}

/// UI track key to track lookup.
#[derive(Default)]
pub struct TrackRegistry {
    tracks: HashMap<String, Box<dyn Track>>,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, track: impl Track + 'static) {
        self.tracks.insert(key.into(), Box::new(track));
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.tracks.remove(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<&dyn Track> {
        self.tracks.get(key).map(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Engine track ids behind the area's selected tracks.
    ///
    /// Keys with no registered track (track groups, for example) are skipped.
    /// Order follows the selection; duplicates are removed.
    pub fn selected_track_ids(&self, area: &Area) -> Vec<i64> {
        let mut ids = Vec::new();
        for key in area.tracks() {
            let Some(track) = self.get(key) else {
                continue;
            };
            for id in track.resolve_underlying_track_ids() {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TrackRegistry {
        let mut registry = TrackRegistry::new();
        registry.register("t1", SliceTrack { track_id: 7 });
        registry.register(
            "async",
            AsyncSliceTrack {
                track_ids: vec![3, 4, 7],
            },
        );
        registry
    }

    #[test]
    fn test_area_rejects_inverted_window() {
        assert!(matches!(
            Area::new(10, 5, vec![]),
            Err(EngineError::InvalidArea { start_ns: 10, end_ns: 5 })
        ));
        assert!(Area::new(5, 5, vec![]).is_ok());
    }

    #[test]
    fn test_selected_track_ids() {
        let registry = registry();
        let area = Area::new(
            0,
            10,
            vec!["t1".to_string(), "group".to_string(), "async".to_string()],
        )
        .unwrap();
        assert_eq!(registry.selected_track_ids(&area), [7, 3, 4]);
    }

    #[test]
    fn test_selection_of_unknown_tracks_is_empty() {
        let registry = registry();
        let area = Area::new(0, 10, vec!["group".to_string()]).unwrap();
        assert!(registry.selected_track_ids(&area).is_empty());
    }

    #[test]
    fn test_overlaps_boundaries() {
        let window = TimeWindow::new(1000, 5000).unwrap();
        // Ends exactly at start
        assert!(!window.overlaps(900, 100));
        // Starts exactly at end
        assert!(!window.overlaps(5000, 10));
        // Spans the whole window
        assert!(window.overlaps(0, 10_000));
        assert!(window.overlaps(900, 200));
        assert!(window.overlaps(4900, 50));
        // Unterminated
        assert!(window.overlaps(0, -1));
        assert!(!window.overlaps(5000, -1));
    }

    #[test]
    fn test_duration_of_widest_window() {
        let window = TimeWindow::new(i64::MIN, i64::MAX).unwrap();
        assert_eq!(window.duration_ns(), i128::from(u64::MAX));
        assert_eq!(TimeWindow::new(-10, 10).unwrap().duration_ns(), 20);
        assert_eq!(Area::new(3, 3, vec![]).unwrap().window().duration_ns(), 0);
    }
}
