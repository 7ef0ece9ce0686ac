use std::sync::Arc;

use crate::cache::DashboardCache;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::SurveyStore;
use crate::services::dashboard::DashboardPipeline;
use crate::sources::{DataSource, SheetsSource, SourceFetcher};
use crate::sync::{SyncEngine, SyncSettings};

/// Shared application state, wired once at startup.
pub struct AppState {
    pub config: Config,
    pub store: Arc<SurveyStore>,
    pub fetcher: Arc<SourceFetcher>,
    pub sync: Arc<SyncEngine>,
    pub cache: Arc<DashboardCache>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(SurveyStore::new(config.store.clone()));
        let sheets: Arc<dyn DataSource> = Arc::new(SheetsSource::new(config.sheets.clone()));

        let fetcher = Arc::new(SourceFetcher::new(
            config.source_preference(),
            store.clone(),
            sheets.clone(),
        ));

        let sync = Arc::new(SyncEngine::new(
            SyncSettings {
                enabled: config.sync_from_sheets,
                cooldown: config.sync_interval,
            },
            sheets,
            store.clone(),
            clock.clone(),
        ));

        let in_request_sync = (config.sync_from_sheets && config.run_sync_in_request)
            .then(|| sync.clone());
        let pipeline = Arc::new(DashboardPipeline::new(in_request_sync, fetcher.clone()));
        let cache = Arc::new(DashboardCache::new(pipeline, clock, config.cache_ttl));

        log::info!(
            "AppState: dashboard source {} (fallback {}), sync {}, cache ttl {:?}",
            config.dashboard_source,
            config.enable_source_fallback,
            if config.sync_from_sheets { "on" } else { "off" },
            config.cache_ttl
        );

        Self {
            config,
            store,
            fetcher,
            sync,
            cache,
        }
    }

    /// Whether the binary should run sync on its own timer.
    pub fn runs_background_sync(&self) -> bool {
        self.config.sync_from_sheets && !self.config.run_sync_in_request
    }
}
