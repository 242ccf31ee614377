//! Fixed-width time windows over a base station's events.

use chrono::{DateTime, Duration, Utc};

use census_core::error::{CensusError, Result};
use census_core::models::{CaptureEvent, CategoryCounts, CipherCategory};

// ── Window ────────────────────────────────────────────────────────────────────

/// Half-open interval `[start, end)` with per-category counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub counts: CategoryCounts,
}

impl Window {
    pub fn total(&self) -> u64 {
        self.counts.total()
    }

    /// Share of `category` in this window, `NaN` for an empty window.
    pub fn share(&self, category: CipherCategory) -> f64 {
        self.counts.share(category)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

// ── WindowAggregator ──────────────────────────────────────────────────────────

/// Buckets events into consecutive windows anchored at the earliest event.
///
/// Windows are not calendar-aligned. Every window between the first and the
/// last event is emitted, including empty ones, so the time axis is uniform.
#[derive(Debug, Clone, Copy)]
pub struct WindowAggregator {
    interval: Duration,
}

impl WindowAggregator {
    /// Fails with [`CensusError::Config`] when `interval_minutes` is zero.
    pub fn new(interval_minutes: u32) -> Result<Self> {
        if interval_minutes == 0 {
            return Err(CensusError::Config(
                "aggregation interval must be greater than 0 minutes".to_string(),
            ));
        }
        Ok(Self {
            interval: Duration::minutes(i64::from(interval_minutes)),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Aggregate `events` into windows.
    ///
    /// Input order does not matter. Empty input yields an empty list.
    pub fn aggregate(&self, events: &[CaptureEvent]) -> Vec<Window> {
        let Some(origin) = events.iter().map(|e| e.timestamp).min() else {
            return Vec::new();
        };
        let last = events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(origin);

        let count = self.window_index(origin, last).saturating_add(1);
        let mut windows: Vec<Window> = (0..count)
            .map(|i| {
                let start = self.window_start(origin, i);
                Window {
                    start,
                    end: start + self.interval,
                    counts: CategoryCounts::default(),
                }
            })
            .collect();

        for event in events {
            let idx = self.window_index(origin, event.timestamp);
            windows[idx].counts.add(event.category);
        }

        windows
    }

    /// Counts over the whole event set.
    pub fn totals(events: &[CaptureEvent]) -> CategoryCounts {
        let mut counts = CategoryCounts::default();
        for event in events {
            counts.add(event.category);
        }
        counts
    }

    fn width_micros(&self) -> i64 {
        self.interval.num_microseconds().unwrap_or(i64::MAX)
    }

    fn window_index(&self, origin: DateTime<Utc>, ts: DateTime<Utc>) -> usize {
        let offset = (ts - origin).num_microseconds().unwrap_or(i64::MAX);
        usize::try_from(offset.max(0) / self.width_micros()).unwrap_or(usize::MAX)
    }

    /// Start of window `index`, measured from `origin` in microseconds.
    fn window_start(&self, origin: DateTime<Utc>, index: usize) -> DateTime<Utc> {
        let offset = i64::try_from(index)
            .ok()
            .and_then(|i| i.checked_mul(self.width_micros()))
            .unwrap_or(i64::MAX);
        origin + Duration::microseconds(offset)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
