// Dashboard service
// One refresh: optional in-request sync, fallback fetch, payload build.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::PayloadSource;
use crate::charts::{build_payload, DashboardPayload};
use crate::error::RefreshError;
use crate::sources::SourceFetcher;
use crate::sync::{SyncEngine, SyncOutcome};

/// The computation behind the dashboard cache.
pub struct DashboardPipeline {
    /// Present only when sync runs inside the refresh.
    sync: Option<Arc<SyncEngine>>,
    fetcher: Arc<SourceFetcher>,
}

impl DashboardPipeline {
    pub fn new(sync: Option<Arc<SyncEngine>>, fetcher: Arc<SourceFetcher>) -> Self {
        Self { sync, fetcher }
    }

    /// Sync errors are logged and swallowed; the dashboard still renders
    /// from whatever the store holds.
    async fn sync_before_fetch(&self) {
        let Some(sync) = &self.sync else {
            return;
        };
        match sync.sync().await {
            Ok(SyncOutcome::Synced { fetched, inserted }) => {
                log::debug!("Dashboard: in-request sync fetched {} inserted {}", fetched, inserted);
            }
            Ok(_) => {}
            Err(e) => log::warn!("Dashboard: sync failed, continuing with stored data: {}", e),
        }
    }
}

#[async_trait]
impl PayloadSource for DashboardPipeline {
    async fn compute(&self) -> Result<DashboardPayload, RefreshError> {
        self.sync_before_fetch().await;
        let fetched = self.fetcher.fetch_data().await?;
        build_payload(&fetched.table, fetched.source)
    }
}
