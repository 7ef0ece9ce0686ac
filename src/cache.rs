//! Read-through TTL cache for the dashboard payload.
//!
//! One shared slot holds the last complete payload. Callers always get the
//! cached value immediately when there is one; a stale entry triggers at most
//! one background refresh at a time. Only when nothing has ever been cached
//! does a caller wait: for a refresh already in flight (such as prewarm) if
//! there is one, otherwise for a computation shared by all concurrent cold
//! callers.
//!
//! The slot mutex is a `parking_lot::Mutex` and is never held across an
//! await. The refresh flag is cleared by a supervisor task that awaits the
//! worker, so a panicking refresh cannot wedge the cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::charts::DashboardPayload;
use crate::clock::Clock;
use crate::error::RefreshError;
use crate::latency::{self, Operation, Outcome};

/// Produces a fresh payload. Implemented by the dashboard pipeline.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    async fn compute(&self) -> Result<DashboardPayload, RefreshError>;
}

struct CacheEntry {
    payload: Arc<DashboardPayload>,
    computed_at: Instant,
}

#[derive(Default)]
struct CacheSlot {
    entry: Option<CacheEntry>,
    refreshing: bool,
    refreshes_launched: u64,
}

pub struct DashboardCache {
    pipeline: Arc<dyn PayloadSource>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    slot: Mutex<CacheSlot>,
    cold_gate: tokio::sync::Mutex<()>,
    /// Signalled by the supervisor once the refresh flag is cleared.
    refresh_done: Notify,
}

impl DashboardCache {
    pub fn new(pipeline: Arc<dyn PayloadSource>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            pipeline,
            clock,
            ttl,
            slot: Mutex::new(CacheSlot::default()),
            cold_gate: tokio::sync::Mutex::new(()),
            refresh_done: Notify::new(),
        }
    }

    /// Current payload. Never fails: a cold failure yields a placeholder.
    pub async fn get_payload(self: &Arc<Self>) -> Arc<DashboardPayload> {
        if let Some(payload) = self.serve_cached() {
            return payload;
        }
        self.compute_cold().await
    }

    /// Launch one background refresh at startup. Returns `None` when a
    /// refresh is already running.
    pub fn prewarm(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        {
            let mut slot = self.slot.lock();
            if slot.refreshing {
                return None;
            }
            slot.refreshing = true;
            slot.refreshes_launched += 1;
        }
        log::info!("DashboardCache: prewarming");
        Some(self.spawn_refresh())
    }

    pub fn is_refreshing(&self) -> bool {
        self.slot.lock().refreshing
    }

    /// Background refreshes launched since startup (prewarm included).
    pub fn refreshes_launched(&self) -> u64 {
        self.slot.lock().refreshes_launched
    }

    pub fn has_entry(&self) -> bool {
        self.slot.lock().entry.is_some()
    }

    /// Warm path. Returns the cached payload, launching a refresh first if
    /// it is stale and none is running.
    fn serve_cached(self: &Arc<Self>) -> Option<Arc<DashboardPayload>> {
        let now = self.clock.now();
        let (payload, launch) = {
            let mut slot = self.slot.lock();
            let (payload, stale) = match slot.entry.as_ref() {
                Some(entry) => (
                    Arc::clone(&entry.payload),
                    now.saturating_duration_since(entry.computed_at) >= self.ttl,
                ),
                None => return None,
            };
            let launch = stale && !slot.refreshing;
            if launch {
                slot.refreshing = true;
                slot.refreshes_launched += 1;
            }
            (payload, launch)
        };

        if launch {
            log::debug!("DashboardCache: entry stale, refreshing in background");
            self.spawn_refresh();
        }
        Some(payload)
    }

    async fn compute_cold(self: &Arc<Self>) -> Arc<DashboardPayload> {
        let _gate = self.cold_gate.lock().await;

        // Another cold caller or an in-flight refresh may fill the slot first.
        loop {
            let finished = self.refresh_done.notified();
            tokio::pin!(finished);
            finished.as_mut().enable();

            if let Some(payload) = self.serve_cached() {
                return payload;
            }
            if !self.is_refreshing() {
                break;
            }
            log::debug!("DashboardCache: cold, waiting for in-flight refresh");
            finished.await;
        }

        match self.timed_compute(Outcome::Degraded).await {
            Ok(payload) => self.store(payload),
            Err(e) => {
                log::warn!("DashboardCache: cold refresh failed: {}", e);
                Arc::new(DashboardPayload::placeholder(e.placeholder_message()))
            }
        }
    }

    /// Spawn the worker and its supervisor. The caller must already have set
    /// the refresh flag. The returned handle is the supervisor's.
    fn spawn_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let worker = tokio::spawn(async move {
            match cache.timed_compute(Outcome::Failed).await {
                Ok(payload) => {
                    cache.store(payload);
                    log::debug!("DashboardCache: background refresh stored");
                }
                Err(e) => {
                    log::warn!("DashboardCache: background refresh failed, keeping previous entry: {}", e);
                }
            }
        });

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = worker.await {
                log::error!("DashboardCache: refresh task aborted: {}", e);
            }
            cache.slot.lock().refreshing = false;
            cache.refresh_done.notify_waiters();
        })
    }

    /// Run the pipeline and record its timing. A cold failure serves a
    /// placeholder, so the caller says how a failure counts.
    async fn timed_compute(&self, on_failure: Outcome) -> Result<DashboardPayload, RefreshError> {
        let started = Instant::now();
        let result = self.pipeline.compute().await;
        let outcome = if result.is_ok() { Outcome::Ok } else { on_failure };
        latency::record(Operation::Refresh, started.elapsed(), outcome);
        result
    }

    fn store(&self, payload: DashboardPayload) -> Arc<DashboardPayload> {
        let payload = Arc::new(payload);
        let entry = CacheEntry {
            payload: Arc::clone(&payload),
            computed_at: self.clock.now(),
        };
        self.slot.lock().entry = Some(entry);
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SourceKind;
    use crate::error::FetchError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Pipeline whose n-th successful computation reports `row_count = n`.
    #[derive(Default)]
    struct FakePipeline {
        calls: AtomicUsize,
        fail: AtomicBool,
        panic: AtomicBool,
        gate: Option<Arc<Semaphore>>,
    }

    impl FakePipeline {
        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PayloadSource for FakePipeline {
        async fn compute(&self) -> Result<DashboardPayload, RefreshError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if self.panic.load(Ordering::SeqCst) {
                panic!("pipeline exploded");
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(RefreshError::Fetch(FetchError { attempts: vec![] }));
            }
            Ok(DashboardPayload::Ready {
                charts: vec![],
                source: SourceKind::Store,
                row_count: n,
                generated_at: String::new(),
            })
        }
    }

    fn row_count(payload: &DashboardPayload) -> Option<usize> {
        match payload {
            DashboardPayload::Ready { row_count, .. } => Some(*row_count),
            DashboardPayload::Placeholder { .. } => None,
        }
    }

    async fn wait_until_idle(cache: &DashboardCache) {
        for _ in 0..400 {
            if !cache.is_refreshing() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("refresh flag never cleared");
    }

    fn cache_with(pipeline: Arc<FakePipeline>, clock: Arc<ManualClock>) -> Arc<DashboardCache> {
        Arc::new(DashboardCache::new(pipeline, clock, Duration::from_secs(120)))
    }

    #[tokio::test]
    async fn test_cold_success_then_warm_hit() {
        let pipeline = Arc::new(FakePipeline::default());
        let cache = cache_with(pipeline.clone(), Arc::new(ManualClock::new()));

        let first = cache.get_payload().await;
        let second = cache.get_payload().await;
        assert_eq!(row_count(&first), Some(1));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pipeline.calls(), 1);
        assert_eq!(cache.refreshes_launched(), 0);
    }

    #[tokio::test]
    async fn test_cold_failure_returns_placeholder_and_stays_cold() {
        let pipeline = Arc::new(FakePipeline::default());
        pipeline.fail.store(true, Ordering::SeqCst);
        let cache = cache_with(pipeline.clone(), Arc::new(ManualClock::new()));

        let payload = cache.get_payload().await;
        assert!(payload.is_placeholder());
        assert!(!cache.has_entry());

        pipeline.fail.store(false, Ordering::SeqCst);
        let payload = cache.get_payload().await;
        assert_eq!(row_count(&payload), Some(2));
        assert!(cache.has_entry());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cold_callers_share_one_computation() {
        let gate = Arc::new(Semaphore::new(0));
        let pipeline = Arc::new(FakePipeline::gated(gate.clone()));
        let cache = cache_with(pipeline.clone(), Arc::new(ManualClock::new()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_payload().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.add_permits(16);

        for handle in handles {
            let payload = handle.await.unwrap();
            assert_eq!(row_count(&payload), Some(1));
        }
        assert_eq!(pipeline.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stale_entry_launches_single_background_refresh() {
        let gate = Arc::new(Semaphore::new(1));
        let pipeline = Arc::new(FakePipeline::gated(gate.clone()));
        let clock = Arc::new(ManualClock::new());
        let cache = cache_with(pipeline.clone(), clock.clone());

        let original = cache.get_payload().await;
        clock.advance(Duration::from_secs(121));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_payload().await })
            })
            .collect();
        for handle in handles {
            assert!(Arc::ptr_eq(&handle.await.unwrap(), &original));
        }
        assert_eq!(cache.refreshes_launched(), 1);
        assert!(cache.is_refreshing());

        gate.add_permits(1);
        wait_until_idle(&cache).await;
        assert_eq!(pipeline.calls(), 2);

        let refreshed = cache.get_payload().await;
        assert_eq!(row_count(&refreshed), Some(2));
        assert_eq!(cache.refreshes_launched(), 1);
    }

    #[tokio::test]
    async fn test_fresh_entry_launches_nothing() {
        let pipeline = Arc::new(FakePipeline::default());
        let clock = Arc::new(ManualClock::new());
        let cache = cache_with(pipeline.clone(), clock.clone());

        cache.get_payload().await;
        clock.advance(Duration::from_secs(119));
        cache.get_payload().await;
        assert_eq!(cache.refreshes_launched(), 0);
        assert!(!cache.is_refreshing());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_entry_and_clears_flag() {
        let pipeline = Arc::new(FakePipeline::default());
        let clock = Arc::new(ManualClock::new());
        let cache = cache_with(pipeline.clone(), clock.clone());

        let original = cache.get_payload().await;
        pipeline.fail.store(true, Ordering::SeqCst);
        clock.advance(Duration::from_secs(200));

        cache.get_payload().await;
        wait_until_idle(&cache).await;

        assert!(Arc::ptr_eq(&cache.get_payload().await, &original));
        // Still stale, so the next call retried.
        wait_until_idle(&cache).await;
        assert_eq!(cache.refreshes_launched(), 2);
    }

    #[tokio::test]
    async fn test_panicking_refresh_clears_flag() {
        let pipeline = Arc::new(FakePipeline::default());
        let clock = Arc::new(ManualClock::new());
        let cache = cache_with(pipeline.clone(), clock.clone());

        let original = cache.get_payload().await;
        pipeline.panic.store(true, Ordering::SeqCst);
        clock.advance(Duration::from_secs(200));

        cache.get_payload().await;
        wait_until_idle(&cache).await;
        assert!(!cache.is_refreshing());

        pipeline.panic.store(false, Ordering::SeqCst);
        cache.get_payload().await;
        wait_until_idle(&cache).await;
        let refreshed = cache.get_payload().await;
        assert!(!Arc::ptr_eq(&refreshed, &original));
        assert_eq!(row_count(&refreshed), Some(3));
    }

    #[tokio::test]
    async fn test_prewarm_fills_cache() {
        let pipeline = Arc::new(FakePipeline::default());
        let cache = cache_with(pipeline.clone(), Arc::new(ManualClock::new()));

        let handle = cache.prewarm().expect("prewarm launched");
        assert!(cache.prewarm().is_none());
        handle.await.unwrap();

        assert!(!cache.is_refreshing());
        let payload = cache.get_payload().await;
        assert_eq!(row_count(&payload), Some(1));
        assert_eq!(pipeline.calls(), 1);
        assert_eq!(cache.refreshes_launched(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cold_request_during_prewarm_waits_for_it() {
        let gate = Arc::new(Semaphore::new(0));
        let pipeline = Arc::new(FakePipeline::gated(gate.clone()));
        let cache = cache_with(pipeline.clone(), Arc::new(ManualClock::new()));

        let prewarm = cache.prewarm().expect("prewarm launched");
        let cold = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_payload().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!cold.is_finished());
        assert_eq!(pipeline.calls(), 1);

        gate.add_permits(1);
        prewarm.await.unwrap();
        let payload = cold.await.unwrap();
        assert_eq!(row_count(&payload), Some(1));
        assert_eq!(pipeline.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cold_request_after_failed_prewarm_computes() {
        let gate = Arc::new(Semaphore::new(0));
        let pipeline = Arc::new(FakePipeline::gated(gate.clone()));
        pipeline.fail.store(true, Ordering::SeqCst);
        let cache = cache_with(pipeline.clone(), Arc::new(ManualClock::new()));

        let prewarm = cache.prewarm().expect("prewarm launched");
        let cold = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_payload().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        gate.add_permits(1);
        prewarm.await.unwrap();
        assert!(!cache.has_entry());

        pipeline.fail.store(false, Ordering::SeqCst);
        gate.add_permits(1);
        let payload = cold.await.unwrap();
        assert_eq!(row_count(&payload), Some(2));
        assert_eq!(pipeline.calls(), 2);
    }
}
