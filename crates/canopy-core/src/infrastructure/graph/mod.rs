//! SQLite-backed graph store

pub mod repository;

pub use repository::SqliteGraphStore;
