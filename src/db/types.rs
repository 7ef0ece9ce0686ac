//! Shared type definitions for the database layer.

use serde::Serialize;
use thiserror::Error;

use crate::columns::CANONICAL_FIELDS;
use crate::error::SourceError;
use crate::table::Table;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Database task failed: {0}")]
    Task(String),
}

impl DbError {
    fn is_busy(&self) -> bool {
        match self {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl From<DbError> for SourceError {
    fn from(err: DbError) -> Self {
        if err.is_busy() {
            SourceError::Timeout(err.to_string())
        } else {
            SourceError::Connection(err.to_string())
        }
    }
}

/// One survey response projected onto the canonical schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SurveyRow {
    /// Aligned with [`CANONICAL_FIELDS`].
    pub values: [Option<String>; 15],
}

impl SurveyRow {
    pub fn timestamp(&self) -> Option<&str> {
        self.values[0].as_deref()
    }

    /// True when the row has a usable natural key.
    pub fn has_timestamp(&self) -> bool {
        self.timestamp().is_some_and(|ts| !ts.trim().is_empty())
    }

    /// Build a row from `(field, value)` pairs; unknown fields are ignored.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let mut values: [Option<String>; 15] = Default::default();
        for (field, value) in pairs {
            if let Some(idx) = CANONICAL_FIELDS.iter().position(|f| f == field) {
                values[idx] = Some(value.to_string());
            }
        }
        Self { values }
    }

    /// Project every record of a normalized table onto the canonical schema.
    /// Fields the table does not carry become `None`.
    pub fn project(table: &Table) -> Vec<SurveyRow> {
        let positions: Vec<Option<usize>> = CANONICAL_FIELDS
            .iter()
            .map(|field| table.column_index(field))
            .collect();

        table
            .rows
            .iter()
            .map(|row| {
                let mut values: [Option<String>; 15] = Default::default();
                for (slot, pos) in values.iter_mut().zip(&positions) {
                    *slot = pos.and_then(|i| row.get(i)).and_then(|cell| cell.as_text());
                }
                SurveyRow { values }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::TIMESTAMP;
    use crate::table::Cell;

    #[test]
    fn test_timestamp_is_first_canonical_field() {
        assert_eq!(CANONICAL_FIELDS[0], TIMESTAMP);
    }

    #[test]
    fn test_project_fills_missing_fields_with_none() {
        let table = Table::new(
            vec!["platform".into(), "timestamp".into(), "extra_notes".into()],
            vec![vec![
                Cell::Text("Switch".into()),
                Cell::Text("2024-01-01T00:00:00".into()),
                Cell::Text("ignored".into()),
            ]],
        );
        let rows = SurveyRow::project(&table);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp(), Some("2024-01-01T00:00:00"));
        assert_eq!(rows[0].values[4].as_deref(), Some("Switch"));
        assert_eq!(rows[0].values.iter().filter(|v| v.is_some()).count(), 2);
    }

    #[test]
    fn test_project_stringifies_numbers() {
        let table = Table::new(
            vec!["timestamp".into(), "age".into()],
            vec![vec![Cell::Text("t1".into()), Cell::Number(27.0)]],
        );
        let rows = SurveyRow::project(&table);
        assert_eq!(rows[0].values[1].as_deref(), Some("27"));
    }

    #[test]
    fn test_busy_database_classifies_as_timeout() {
        let busy = DbError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        ));
        assert!(matches!(SourceError::from(busy), SourceError::Timeout(_)));

        let other = DbError::Task("worker panicked".into());
        assert!(matches!(SourceError::from(other), SourceError::Connection(_)));
    }

    #[test]
    fn test_has_timestamp() {
        assert!(SurveyRow::from_pairs(&[("timestamp", "t")]).has_timestamp());
        assert!(!SurveyRow::from_pairs(&[("timestamp", "  ")]).has_timestamp());
        assert!(!SurveyRow::from_pairs(&[("age", "20")]).has_timestamp());
    }
}
