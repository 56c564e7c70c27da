//! Error types for the stratum client.

use std::time::Duration;
use thiserror::Error;

/// Main error type for all stratum operations.
///
/// The five variants form the whole error surface: configuration problems,
/// connection-layer failures, server-reported query failures, per-statement
/// deadline overruns, and cache misuse. Decorators never change the kind of
/// an error they propagate.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing file, environment variable, or configuration field.
    #[error("configuration error: {0}")]
    Config(String),

    /// Broken link, unable to send, protocol violation.
    #[error("connection error: {0}")]
    Connection(String),

    /// Server-reported SQL failure.
    #[error("query failed: {message} (sql: {sql})")]
    Query { message: String, sql: String },

    /// A statement exceeded its per-call deadline.
    #[error("statement cancelled after {elapsed:?} ({params} parameter(s))")]
    TooSlow { elapsed: Duration, params: usize },

    /// Uncacheable read query or double launch of the cache.
    #[error("cache error: {0}")]
    Cache(String),
}

impl Error {
    /// Whether the underlying connection should be considered broken.
    ///
    /// Query errors leave the session usable; anything at the connection or
    /// protocol layer means the connection must be discarded and replaced.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Connection(e.to_string())
    }
}

/// Result type for stratum operations.
pub type Result<T> = std::result::Result<T, Error>;
