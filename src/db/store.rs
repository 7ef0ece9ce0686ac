//! Async access to the survey database.
//!
//! rusqlite connections are blocking and not `Sync`, so every operation
//! opens its own connection on the blocking pool and the whole call is
//! bounded by the read timeout. A hung lock or disk fails as `Timeout`
//! instead of stalling the caller.

use std::collections::HashSet;

use async_trait::async_trait;

use super::{DbError, SurveyDb, SurveyRow};
use crate::config::{SourceKind, StoreConfig};
use crate::error::SourceError;
use crate::sources::DataSource;
use crate::sync::ResponseStore;
use crate::table::Table;

#[derive(Debug, Clone)]
pub struct SurveyStore {
    config: StoreConfig,
}

impl SurveyStore {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    /// Create the database file and schema if needed.
    pub async fn init(&self) -> Result<(), SourceError> {
        self.run("init", |_| Ok(())).await
    }

    pub async fn row_count(&self) -> Result<usize, SourceError> {
        self.run("row_count", |db| db.row_count()).await
    }

    async fn run<F, T>(&self, op: &'static str, f: F) -> Result<T, SourceError>
    where
        F: FnOnce(&SurveyDb) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.config.path.clone();
        let busy_timeout = self.config.connect_timeout;
        let task = tokio::task::spawn_blocking(move || {
            let db = SurveyDb::open_at(&path, busy_timeout)?;
            f(&db)
        });

        match tokio::time::timeout(self.config.read_timeout, task).await {
            Ok(Ok(result)) => result.map_err(SourceError::from),
            Ok(Err(join_err)) => Err(SourceError::from(DbError::Task(join_err.to_string()))),
            Err(_) => {
                log::warn!(
                    "SurveyStore: {} exceeded {:?}",
                    op,
                    self.config.read_timeout
                );
                Err(SourceError::Timeout(format!(
                    "store {} exceeded {}s",
                    op,
                    self.config.read_timeout.as_secs()
                )))
            }
        }
    }
}

#[async_trait]
impl DataSource for SurveyStore {
    fn kind(&self) -> SourceKind {
        SourceKind::Store
    }

    async fn fetch(&self) -> Result<Table, SourceError> {
        self.run("snapshot", |db| db.snapshot()).await
    }
}

#[async_trait]
impl ResponseStore for SurveyStore {
    async fn existing_timestamps(&self) -> Result<HashSet<String>, SourceError> {
        self.run("existing_timestamps", |db| db.existing_timestamps()).await
    }

    async fn insert_batch(&self, rows: Vec<SurveyRow>) -> Result<usize, SourceError> {
        self.run("insert_batch", move |db| db.insert_rows(&rows)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store_in(dir: &tempfile::TempDir) -> SurveyStore {
        SurveyStore::new(StoreConfig {
            path: dir.path().join("survey.db"),
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn test_store_round_trip_through_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.init().await.unwrap();

        let rows = vec![
            SurveyRow::from_pairs(&[("timestamp", "t1"), ("platform", "PC")]),
            SurveyRow::from_pairs(&[("timestamp", "t2"), ("platform", "Switch")]),
        ];
        assert_eq!(store.insert_batch(rows).await.unwrap(), 2);
        assert_eq!(store.row_count().await.unwrap(), 2);

        let existing = store.existing_timestamps().await.unwrap();
        assert!(existing.contains("t1") && existing.contains("t2"));

        let table = store.fetch().await.unwrap();
        assert_eq!(table.row_count(), 2);
        assert_eq!(store.kind(), SourceKind::Store);
    }

    #[tokio::test]
    async fn test_unopenable_path_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the database file should be cannot be opened.
        let blocked = dir.path().join("survey.db");
        std::fs::create_dir_all(&blocked).unwrap();
        let store = SurveyStore::new(StoreConfig {
            path: blocked,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(5),
        });
        let err = store.fetch().await.unwrap_err();
        assert!(matches!(err, SourceError::Connection(_)));
    }
}
