//! Survey sync and dashboard cache.
//!
//! Survey responses arrive in a Google sheet. [`sync`] copies new rows into
//! a SQLite store exactly once, [`sources`] reads either copy back with an
//! optional fallback, and [`cache`] serves the derived dashboard payload from
//! a TTL cache refreshed in the background.

pub mod cache;
pub mod charts;
pub mod clock;
pub mod columns;
pub mod config;
pub mod db;
pub mod error;
pub mod google_api;
pub mod latency;
pub mod services;
pub mod sources;
pub mod state;
pub mod sync;
pub mod table;
