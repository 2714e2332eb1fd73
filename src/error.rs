//! Error types for the recommendation engine
//!
//! One crate-wide error enum built with `thiserror`:
//! - store and cache failures carry their source for logging
//! - cold-start conditions (`UnknownEntity`, `ModelNotReady`) are classified so that
//!   Hybrid Fusion can route them to the popularity fallback instead of the caller
//! - stable error codes for whatever service layer sits in front of the library

use std::borrow::Cow;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the recommendation engine
#[derive(Debug, Error)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    #[error("Configuration error: {message}")]
    Config {
        message: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig {
        key: &'static str,
        message: Cow<'static, str>,
    },

    // ========================================================================
    // Interaction Store Errors
    // ========================================================================
    #[error("Interaction store unavailable: {message}")]
    StoreUnavailable { message: Cow<'static, str> },

    #[error("Database error: {message}")]
    Database {
        message: Cow<'static, str>,
        #[source]
        source: Option<sqlx::Error>,
    },

    #[error("Migration error: {0}")]
    Migration(String),

    // ========================================================================
    // Result Cache Errors
    // ========================================================================
    #[error("Cache error: {message}")]
    Cache {
        message: Cow<'static, str>,
        #[source]
        source: Option<redis::RedisError>,
    },

    #[error("Corrupt cache entry {key}: {message}")]
    CacheCorrupt { key: String, message: String },

    // ========================================================================
    // Model Errors
    // ========================================================================
    #[error("Unknown {kind} '{id}': not present in the trained index")]
    UnknownEntity { kind: &'static str, id: String },

    #[error("No trained model state is available")]
    ModelNotReady,

    #[error("Training failed: {message}")]
    Training { message: Cow<'static, str> },

    #[error("A training run is already in progress")]
    TrainingInProgress,

    // ========================================================================
    // Recommendation Errors
    // ========================================================================
    #[error("No catalog metadata for content {content_id}")]
    MetadataGap { content_id: String },

    #[error("Every recommendation source failed for profile {profile_id}")]
    AllSourcesFailed { profile_id: String },

    // ========================================================================
    // Generic Errors
    // ========================================================================
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error")]
    Internal {
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    // ========================================================================
    // Constructors for common error patterns
    // ========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store-unavailable error
    pub fn store_unavailable(message: impl Into<Cow<'static, str>>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Create a database error
    pub fn database(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Create a cache error
    pub fn cache(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// Create a training error
    pub fn training(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Training {
            message: message.into(),
        }
    }

    /// Create an unknown-entity error
    pub fn unknown_entity(kind: &'static str, id: impl Into<String>) -> Self {
        Self::UnknownEntity {
            kind,
            id: id.into(),
        }
    }

    /// Create an internal error
    pub fn internal(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal {
            source: Some(Box::new(source)),
        }
    }

    // ========================================================================
    // Error Classification
    // ========================================================================

    /// Returns true if the caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable { .. } | Error::Database { .. } | Error::Cache { .. }
        )
    }

    /// Returns true for cold-start conditions that route to the popularity fallback
    pub fn is_fallback_trigger(&self) -> bool {
        matches!(self, Error::UnknownEntity { .. } | Error::ModelNotReady)
    }

    /// Returns true if this error should be logged at error level
    pub fn is_error_level(&self) -> bool {
        matches!(
            self,
            Error::Database { .. }
                | Error::Migration(_)
                | Error::Training { .. }
                | Error::AllSourcesFailed { .. }
                | Error::Internal { .. }
        )
    }

    /// Get error code for service-layer responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } | Error::MissingEnvVar { .. } | Error::InvalidConfig { .. } => {
                "CONFIG_ERROR"
            }
            Error::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            Error::Database { .. } | Error::Migration(_) => "DATABASE_ERROR",
            Error::Cache { .. } => "CACHE_ERROR",
            Error::CacheCorrupt { .. } => "CACHE_CORRUPT",
            Error::UnknownEntity { .. } => "UNKNOWN_ENTITY",
            Error::ModelNotReady => "MODEL_NOT_READY",
            Error::Training { .. } | Error::TrainingInProgress => "TRAINING_ERROR",
            Error::MetadataGap { .. } => "METADATA_GAP",
            Error::AllSourcesFailed { .. } => "ALL_SOURCES_FAILED",
            Error::Json(_) => "SERIALIZATION_ERROR",
            Error::Internal { .. } | Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => {
                Error::store_unavailable("timed out acquiring a pooled connection")
            }
            sqlx::Error::PoolClosed => Error::store_unavailable("connection pool is closed"),
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::WorkerCrashed => {
                Error::StoreUnavailable {
                    message: err.to_string().into(),
                }
            }
            sqlx::Error::Database(db_err) => Error::Database {
                message: db_err.message().to_string().into(),
                source: Some(err),
            },
            _ => Error::Database {
                message: err.to_string().into(),
                source: Some(err),
            },
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Cache {
            message: err.to_string().into(),
            source: Some(err),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::internal(err)
    }
}

impl From<std::env::VarError> for Error {
    fn from(_err: std::env::VarError) -> Self {
        Error::Config {
            message: "Environment variable error".into(),
            source: None,
        }
    }
}
