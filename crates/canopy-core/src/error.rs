//! Error types for Canopy

use thiserror::Error;

/// Result type alias using Canopy's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Canopy error types
#[derive(Error, Debug)]
pub enum Error {
    // Graph errors (E001-E099)
    #[error("Graph node '{0}' not found")]
    NodeNotFound(String),

    #[error("No anomaly detector registered for node type '{0}'")]
    NoDetectorForNodeType(String),

    #[error("Anomaly result '{0}' not found")]
    AnomalyResultNotFound(String),

    // Snapshot errors (E100-E199)
    #[error("Snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("Builder '{builder}' failed: {message}")]
    BuilderFailed { builder: String, message: String },

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    Config(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::NodeNotFound(_) => "E001",
            Self::NoDetectorForNodeType(_) => "E002",
            Self::AnomalyResultNotFound(_) => "E003",
            Self::SnapshotFailed(_) => "E100",
            Self::BuilderFailed { .. } => "E101",
            Self::Database(_) => "E400",
            Self::Serialization(_) => "E401",
            Self::Config(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }
}
