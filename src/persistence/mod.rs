//! Persistence module for session and statistics storage
//!
//! This module provides the transactional bucket store and the repositories
//! layered on it, so tracked state survives daemon restarts.

pub mod sessions;
pub mod stats;
pub mod store;
pub mod subscribers;

pub use sessions::{BucketSessionRepository, SessionRepository};
pub use stats::{BucketStatsRepository, StatsRepository};
pub use store::{BucketId, Store, Transaction};
pub use subscribers::{Subscriber, SubscriberCache, SubscriberRepository};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during persistence operations
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to open store at {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Malformed record at {location}: {source}")]
    Corrupt {
        location: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid data in database: {0}")]
    InvalidData(String),

    #[error("Write attempted in a read-only transaction")]
    ReadOnly,

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Serialize a record for storage
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, PersistenceError> {
    serde_json::to_vec(value).map_err(PersistenceError::Encode)
}

/// Deserialize a stored record
///
/// A record that does not parse is reported, never replaced by a default.
pub(crate) fn decode<T: DeserializeOwned>(raw: &[u8], location: &str) -> Result<T, PersistenceError> {
    serde_json::from_slice(raw).map_err(|source| PersistenceError::Corrupt {
        location: location.to_string(),
        source,
    })
}
