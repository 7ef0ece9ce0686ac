//! In-memory timing and outcome counters for the data path.
//!
//! Each [`Operation`] keeps a bounded window of recent durations plus outcome
//! totals. Fetches are tracked per source, so a flaky primary shows up as
//! failures on that source and as degraded (fallback-served) fetches on the
//! other. Nothing is persisted; the binary logs a snapshot at debug level.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::SourceKind;

const WINDOW: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// One dashboard pipeline run.
    Refresh,
    /// One sync attempt that reached the sheet.
    Sync,
    /// One attempt against a single source.
    Fetch(SourceKind),
}

impl Operation {
    /// Duration above which a run counts as slow.
    pub fn budget(self) -> Duration {
        match self {
            Operation::Refresh => Duration::from_secs(5),
            Operation::Sync => Duration::from_secs(10),
            Operation::Fetch(_) => Duration::from_secs(3),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Refresh => write!(f, "refresh"),
            Operation::Sync => write!(f, "sync"),
            Operation::Fetch(kind) => write!(f, "fetch:{}", kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Failed,
    /// Something was served, but not what was preferred: a fallback source
    /// or a placeholder payload.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub operation: String,
    pub samples: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
    pub ok: u64,
    pub failed: u64,
    pub degraded: u64,
    pub slow: u64,
    pub last_recorded_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub generated_at: String,
    pub operations: Vec<OperationStats>,
}

#[derive(Debug, Default)]
struct Window {
    recent: VecDeque<Duration>,
    ok: u64,
    failed: u64,
    degraded: u64,
    slow: u64,
    last_at: Option<DateTime<Utc>>,
}

impl Window {
    fn push(&mut self, elapsed: Duration, budget: Duration, outcome: Outcome) {
        match outcome {
            Outcome::Ok => self.ok += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Degraded => self.degraded += 1,
        }
        if elapsed > budget {
            self.slow += 1;
        }
        if self.recent.len() == WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(elapsed);
        self.last_at = Some(Utc::now());
    }

    fn stats(&self, operation: Operation) -> OperationStats {
        let mut sorted: Vec<Duration> = self.recent.iter().copied().collect();
        sorted.sort_unstable();
        let ms = |d: Option<Duration>| d.map_or(0, |d| d.as_millis() as u64);
        OperationStats {
            operation: operation.to_string(),
            samples: sorted.len(),
            p50_ms: ms(nearest_rank(&sorted, 0.50)),
            p95_ms: ms(nearest_rank(&sorted, 0.95)),
            max_ms: ms(sorted.last().copied()),
            ok: self.ok,
            failed: self.failed,
            degraded: self.degraded,
            slow: self.slow,
            last_recorded_at: self.last_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

/// Nearest-rank percentile of an ascending slice, `q` in `0.0..=1.0`.
fn nearest_rank(sorted: &[Duration], q: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted.get(rank.clamp(1, sorted.len()) - 1).copied()
}

#[derive(Debug, Default)]
pub struct Recorder {
    windows: Mutex<HashMap<Operation, Window>>,
}

impl Recorder {
    pub fn record(&self, operation: Operation, elapsed: Duration, outcome: Outcome) {
        self.windows
            .lock()
            .entry(operation)
            .or_default()
            .push(elapsed, operation.budget(), outcome);
    }

    pub fn stats(&self, operation: Operation) -> Option<OperationStats> {
        self.windows.lock().get(&operation).map(|w| w.stats(operation))
    }

    pub fn snapshot(&self) -> Diagnostics {
        let mut operations: Vec<OperationStats> = self
            .windows
            .lock()
            .iter()
            .map(|(op, window)| window.stats(*op))
            .collect();
        operations.sort_by(|a, b| a.operation.cmp(&b.operation));
        Diagnostics {
            generated_at: Utc::now().to_rfc3339(),
            operations,
        }
    }
}

fn global() -> &'static Recorder {
    static RECORDER: OnceLock<Recorder> = OnceLock::new();
    RECORDER.get_or_init(Recorder::default)
}

pub fn record(operation: Operation, elapsed: Duration, outcome: Outcome) {
    global().record(operation, elapsed, outcome);
}

pub fn snapshot() -> Diagnostics {
    global().snapshot()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_nearest_rank() {
        assert_eq!(nearest_rank(&[], 0.95), None);
        let sorted = [ms(10), ms(20), ms(30)];
        assert_eq!(nearest_rank(&sorted, 0.50), Some(ms(20)));
        assert_eq!(nearest_rank(&sorted, 0.95), Some(ms(30)));
        assert_eq!(nearest_rank(&sorted, 0.0), Some(ms(10)));
    }

    #[test]
    fn test_fetches_are_tracked_per_source() {
        let recorder = Recorder::default();
        recorder.record(Operation::Fetch(SourceKind::Store), ms(4_000), Outcome::Failed);
        recorder.record(Operation::Fetch(SourceKind::Sheets), ms(800), Outcome::Degraded);
        recorder.record(Operation::Fetch(SourceKind::Sheets), ms(600), Outcome::Ok);

        let store = recorder.stats(Operation::Fetch(SourceKind::Store)).unwrap();
        assert_eq!((store.ok, store.failed, store.degraded), (0, 1, 0));
        assert_eq!(store.slow, 1);

        let sheets = recorder.stats(Operation::Fetch(SourceKind::Sheets)).unwrap();
        assert_eq!((sheets.ok, sheets.failed, sheets.degraded), (1, 0, 1));
        assert_eq!(sheets.max_ms, 800);
        assert_eq!(sheets.operation, "fetch:sheets");
    }

    #[test]
    fn test_window_keeps_latest_samples_but_all_counts() {
        let recorder = Recorder::default();
        for n in 1..=200 {
            recorder.record(Operation::Sync, ms(n), Outcome::Ok);
        }
        let stats = recorder.stats(Operation::Sync).unwrap();
        assert_eq!(stats.samples, WINDOW);
        assert_eq!(stats.ok, 200);
        assert_eq!(stats.max_ms, 200);
        assert!(stats.p50_ms > 72);
    }

    #[test]
    fn test_snapshot_sorted_by_operation_name() {
        let recorder = Recorder::default();
        recorder.record(Operation::Sync, ms(1), Outcome::Ok);
        recorder.record(Operation::Refresh, ms(1), Outcome::Degraded);
        recorder.record(Operation::Fetch(SourceKind::Store), ms(1), Outcome::Ok);
        let names: Vec<String> = recorder
            .snapshot()
            .operations
            .into_iter()
            .map(|s| s.operation)
            .collect();
        assert_eq!(names, vec!["fetch:sql", "refresh", "sync"]);
    }
}
