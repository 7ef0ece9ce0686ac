//! Spreadsheet → store synchronization.
//!
//! Each attempt pulls the whole worksheet, projects it onto the canonical
//! schema and appends only rows whose `timestamp` the store has not seen.
//! Attempts are rate-limited by a cooldown and serialized by the state lock,
//! so running sync twice in a row inserts nothing the second time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::columns::normalize;
use crate::config::MIN_TIMER_PERIOD;
use crate::db::SurveyRow;
use crate::error::{SourceError, SyncError};
use crate::latency::{self, Operation, Outcome};
use crate::sources::DataSource;

/// Write side of the response store.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    /// Distinct non-empty timestamps already persisted.
    async fn existing_timestamps(&self) -> Result<HashSet<String>, SourceError>;

    /// Insert every row in one transaction. Returns the number inserted.
    async fn insert_batch(&self, rows: Vec<SurveyRow>) -> Result<usize, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub enabled: bool,
    /// Minimum spacing between attempts that reach the network.
    pub cooldown: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Disabled,
    CoolingDown { remaining: Duration },
    /// The sheet had no data rows.
    Empty,
    Synced { fetched: usize, inserted: usize },
}

#[derive(Debug, Default)]
struct SyncState {
    last_sync: Option<Instant>,
}

pub struct SyncEngine {
    settings: SyncSettings,
    sheet: Arc<dyn DataSource>,
    store: Arc<dyn ResponseStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<SyncState>,
}

impl SyncEngine {
    pub fn new(
        settings: SyncSettings,
        sheet: Arc<dyn DataSource>,
        store: Arc<dyn ResponseStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            sheet,
            store,
            clock,
            state: Mutex::new(SyncState::default()),
        }
    }

    pub async fn last_sync(&self) -> Option<Instant> {
        self.state.lock().await.last_sync
    }

    /// Run one sync attempt.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        if !self.settings.enabled {
            return Ok(SyncOutcome::Disabled);
        }

        // Held for the whole attempt: a second caller waits, then sees the
        // fresh last_sync and cools down.
        let mut state = self.state.lock().await;

        if let Some(last) = state.last_sync {
            let elapsed = self.clock.now().saturating_duration_since(last);
            if elapsed < self.settings.cooldown {
                return Ok(SyncOutcome::CoolingDown {
                    remaining: self.settings.cooldown - elapsed,
                });
            }
        }

        let started = Instant::now();
        let result = self.attempt(&mut state).await;
        let outcome = if result.is_ok() { Outcome::Ok } else { Outcome::Failed };
        latency::record(Operation::Sync, started.elapsed(), outcome);
        result
    }

    /// The network and store part of a sync, run under the state lock.
    async fn attempt(&self, state: &mut SyncState) -> Result<SyncOutcome, SyncError> {
        let raw = self.sheet.fetch().await.map_err(SyncError::Sheet)?;
        let table = normalize(&raw);
        if table.is_empty() {
            log::info!("Sync: sheet has no rows");
            state.last_sync = Some(self.clock.now());
            return Ok(SyncOutcome::Empty);
        }

        let fetched = table.row_count();
        let rows = SurveyRow::project(&table);

        let existing = self
            .store
            .existing_timestamps()
            .await
            .map_err(SyncError::StoreRead)?;

        let candidates = new_rows(rows, &existing);
        let inserted = if candidates.is_empty() {
            0
        } else {
            self.store
                .insert_batch(candidates)
                .await
                .map_err(SyncError::StoreWrite)?
        };

        state.last_sync = Some(self.clock.now());
        log::info!("Sync: fetched {} rows, inserted {}", fetched, inserted);
        Ok(SyncOutcome::Synced { fetched, inserted })
    }

    /// Run `sync()` every `interval` until the handle is aborted. Periods
    /// below [`MIN_TIMER_PERIOD`] are raised to it.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let period = interval.max(MIN_TIMER_PERIOD);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sync().await {
                    Ok(SyncOutcome::CoolingDown { remaining }) => {
                        log::debug!("Sync: cooling down, {:?} remaining", remaining);
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Sync: {}", e),
                }
            }
        })
    }
}

/// Rows with a usable timestamp that is neither stored nor repeated earlier
/// in the same batch.
fn new_rows(rows: Vec<SurveyRow>, existing: &HashSet<String>) -> Vec<SurveyRow> {
    let mut seen: HashSet<String> = HashSet::new();
    rows.into_iter()
        .filter(|row| match row.timestamp() {
            Some(ts) if row.has_timestamp() && !existing.contains(ts) => seen.insert(ts.to_string()),
            _ => false,
        })
        .collect()
}
