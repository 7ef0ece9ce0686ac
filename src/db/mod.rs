//! SQLite store for synced survey responses.
//!
//! The database lives at `~/.survey-dash/survey.db` by default. It is the
//! durable copy of the spreadsheet: sync only ever appends rows whose
//! `timestamp` is not present yet, and the dashboard reads it back whole.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::columns::CANONICAL_FIELDS;
use crate::table::{Cell, Table};

pub mod store;
pub mod types;
pub use store::SurveyStore;
pub use types::*;

const TABLE: &str = "survey_responses";

pub struct SurveyDb {
    conn: Connection,
}

impl SurveyDb {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// `busy_timeout` bounds how long a statement waits on another writer's
    /// lock before failing with `SQLITE_BUSY`.
    pub fn open_at(path: &Path, busy_timeout: Duration) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;

        // Enable WAL mode so dashboard reads do not block sync writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        // All statements use IF NOT EXISTS, so this is idempotent
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self { conn })
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Distinct non-null timestamps already stored.
    pub fn existing_timestamps(&self) -> Result<HashSet<String>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT timestamp FROM {} WHERE timestamp IS NOT NULL",
            TABLE
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut set = HashSet::new();
        for ts in rows {
            set.insert(ts?);
        }
        Ok(set)
    }

    /// Insert rows as one all-or-nothing batch. Returns the number inserted.
    pub fn insert_rows(&self, rows: &[SurveyRow]) -> Result<usize, DbError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.with_transaction(|db| {
            let mut stmt = db.conn.prepare_cached(&insert_sql())?;
            let mut inserted = 0;
            for row in rows {
                inserted += stmt.execute(rusqlite::params_from_iter(row.values.iter()))?;
            }
            Ok(inserted)
        })
    }

    pub fn row_count(&self) -> Result<usize, DbError> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", TABLE), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Every stored row, in insertion order.
    pub fn snapshot(&self) -> Result<Table, DbError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {} ORDER BY id", TABLE))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();
        let rows = stmt.query_map([], |row| {
            (0..width)
                .map(|i| row.get_ref(i).map(value_to_cell))
                .collect::<Result<Vec<Cell>, _>>()
        })?;
        let rows = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(Table::new(columns, rows))
    }
}

/// Insert one row unless its timestamp is already stored. `?1` is the
/// timestamp, so a batch that commits late after a timed-out attempt cannot
/// duplicate what the retry already wrote.
fn insert_sql() -> String {
    let placeholders: Vec<String> = (1..=CANONICAL_FIELDS.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO {table} ({}) SELECT {} \
         WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE timestamp = ?1)",
        CANONICAL_FIELDS.join(", "),
        placeholders.join(", "),
        table = TABLE,
    )
}

fn value_to_cell(value: ValueRef<'_>) -> Cell {
    match value {
        ValueRef::Null => Cell::Null,
        ValueRef::Integer(i) => Cell::Number(i as f64),
        ValueRef::Real(f) => Cell::Number(f),
        ValueRef::Text(bytes) => Cell::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(_) => Cell::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Create a temporary database for testing.
    ///
    /// We leak the `TempDir` so the directory persists for the duration of the test.
    fn test_db() -> SurveyDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test_survey.db");
        std::mem::forget(dir);
        SurveyDb::open_at(&path, Duration::from_secs(5)).expect("Failed to open test database")
    }

    fn row(ts: &str, platform: &str) -> SurveyRow {
        SurveyRow::from_pairs(&[("timestamp", ts), ("platform", platform)])
    }

    #[test]
    fn test_open_creates_table() {
        let db = test_db();
        assert_eq!(db.row_count().unwrap(), 0);
        assert!(db.existing_timestamps().unwrap().is_empty());
    }

    #[test]
    fn test_idempotent_schema_application() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("survey.db");
        let first = SurveyDb::open_at(&path, Duration::from_secs(1)).unwrap();
        first.insert_rows(&[row("t1", "PC")]).unwrap();
        drop(first);
        let second = SurveyDb::open_at(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(second.row_count().unwrap(), 1);
    }

    #[test]
    fn test_insert_and_existing_timestamps() {
        let db = test_db();
        let inserted = db
            .insert_rows(&[row("2024-01-01T00:00:00", "PC"), row("2024-01-02T00:00:00", "Switch")])
            .unwrap();
        assert_eq!(inserted, 2);

        let existing = db.existing_timestamps().unwrap();
        assert_eq!(existing.len(), 2);
        assert!(existing.contains("2024-01-02T00:00:00"));
    }

    #[test]
    fn test_snapshot_has_id_and_canonical_columns() {
        let db = test_db();
        db.insert_rows(&[row("t1", "PC")]).unwrap();
        let table = db.snapshot().unwrap();
        assert_eq!(table.columns.len(), 16);
        assert_eq!(table.columns[0], "id");
        assert_eq!(table.columns[1], "timestamp");
        assert_eq!(table.rows[0][0], Cell::Number(1.0));
        assert_eq!(
            table.column("platform").unwrap(),
            vec![&Cell::Text("PC".into())]
        );
        assert_eq!(table.column("age").unwrap(), vec![&Cell::Null]);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.conn
                .execute("INSERT INTO survey_responses (timestamp) VALUES ('t1')", [])?;
            Err(DbError::Task("simulated failure".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.row_count().unwrap(), 0);
    }

    #[test]
    fn test_insert_sql_shape() {
        let sql = insert_sql();
        assert!(sql.starts_with("INSERT INTO survey_responses (timestamp, age,"));
        assert!(sql.contains("SELECT ?1, ?2,"));
        assert!(sql.ends_with("WHERE timestamp = ?1)"));
    }

    #[test]
    fn test_insert_skips_stored_timestamps() {
        let db = test_db();
        assert_eq!(db.insert_rows(&[row("t1", "PC"), row("t2", "PC")]).unwrap(), 2);

        // A batch computed before the first one committed.
        let late = db.insert_rows(&[row("t1", "Switch"), row("t2", "PC"), row("t3", "PC")]);
        assert_eq!(late.unwrap(), 1);
        assert_eq!(db.row_count().unwrap(), 3);

        let table = db.snapshot().unwrap();
        assert_eq!(table.column("platform").unwrap()[0], &Cell::Text("PC".into()));
    }
}
