//! Error type for the engram crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The memory service was used before `initialize` (or after `shutdown`).
    #[error("memory service is not initialized")]
    NotInitialized,

    /// A pool operation was attempted after shutdown began.
    #[error("connection pool is shutting down")]
    PoolShuttingDown,

    /// A checkout waiter exceeded its deadline. Retriable.
    #[error("timed out after {waited_ms} ms waiting for a database connection")]
    CheckoutTimeout { waited_ms: u64 },

    /// Vector length does not match the configured or comparand dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Table name outside the `rules`/`project_docs`/`refs` allowlist.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Embedding bytes or values that cannot represent a valid vector.
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),

    /// Rule tier outside the closed 1..=5 range.
    #[error("tier {0} is out of range (must be between 1 and 5)")]
    InvalidTier(u8),

    /// Tags containing a double quote would break the JSON substring filter.
    #[error("invalid tag {0:?}: tags must not contain '\"'")]
    InvalidTag(String),

    /// A migration transaction failed; the schema remains at the prior version.
    #[error("migration to version {version} failed: {source}")]
    MigrationFailed {
        version: i64,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
