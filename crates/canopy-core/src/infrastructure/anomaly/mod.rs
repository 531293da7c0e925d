//! SQLite-backed anomaly result store

pub mod repository;

pub use repository::SqliteAnomalyResultStore;
