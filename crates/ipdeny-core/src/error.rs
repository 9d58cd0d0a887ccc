//! Error types for the ipdeny system
//!
//! This module defines all error types used throughout the crate.

use std::net::IpAddr;
use thiserror::Error;

/// Result type alias for ipdeny operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the ipdeny system
#[derive(Error, Debug)]
pub enum Error {
    /// A country, block or address lookup found nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// A snapshot names a country that was never seeded
    #[error("Unknown country: {0}")]
    UnknownCountry(String),

    /// No stored block covers the address
    #[error("No covering block for {0}")]
    NoCoveringBlock(IpAddr),

    /// An observed address could not be re-homed, not even to the sentinel
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Snapshot source failures (network, archive, metadata page)
    #[error("Source fetch error: {0}")]
    SourceFetch(String),

    /// Storage adapter failures (connection, transaction, query)
    #[error("Storage error: {0}")]
    Storage(String),

    /// A uniqueness constraint rejected a write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of an [`Error`], used in run reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Consistency,
    SourceFetch,
    Storage,
    Conflict,
    Config,
    InvalidInput,
    Other,
}

impl Error {
    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an unknown country error
    pub fn unknown_country(code: impl Into<String>) -> Self {
        Self::UnknownCountry(code.into())
    }

    /// Create a consistency error
    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    /// Create a source fetch error
    pub fn source_fetch(msg: impl Into<String>) -> Self {
        Self::SourceFetch(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Whether the caller may retry the operation with backoff
    ///
    /// Only source-side failures qualify: a fetch precedes every write, so
    /// retrying it cannot double-apply anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceFetch(_) | Self::Timeout(_))
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::UnknownCountry(_) | Self::NoCoveringBlock(_) => {
                ErrorKind::NotFound
            }
            Self::Consistency(_) => ErrorKind::Consistency,
            Self::SourceFetch(_) | Self::Timeout(_) => ErrorKind::SourceFetch,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Config(_) => ErrorKind::Config,
            Self::InvalidInput(_) | Self::Json(_) => ErrorKind::InvalidInput,
            Self::Other(_) => ErrorKind::Other,
        }
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
