//! Error types for the tag index

use std::fmt;

use thiserror::Error;

/// Main error type for the tag system
#[derive(Error, Debug)]
pub enum Error {
    /// External store unreachable or client could not be built
    #[error("Connection error: {0}")]
    Connection(String),

    /// Bitmap bytes for a tag could not be encoded or decoded
    #[error("Serialization error for tag {tag}: {reason}")]
    Serialization {
        /// Tag whose bitmap failed
        tag: String,
        /// Underlying decoder/encoder message
        reason: String,
    },

    /// Operation over many tags where some tags failed
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// Malformed query specification
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Tag is not present where the operation requires it
    #[error("Tag not found: {0}")]
    TagNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Single external store call failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot document could not be encoded or parsed
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// System has already been shut down
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

impl Error {
    /// Build a serialization error for `tag`
    pub fn serialization(tag: impl Into<String>, reason: impl fmt::Display) -> Self {
        Error::Serialization {
            tag: tag.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by an external key-value store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Could not connect or lost the connection
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Server rejected or failed the command
    #[error("Command failed: {0}")]
    Command(String),

    /// Command did not complete within the configured timeout
    #[error("Command timeout after {0}ms")]
    Timeout(u64),

    /// Store handle has been closed
    #[error("Store closed")]
    Closed,
}

/// Aggregate failure of a multi-tag durability operation
///
/// Items that succeeded have already been applied; `failures` lists the rest
/// in the order they were attempted.
#[derive(Debug)]
pub struct BatchError {
    /// Operation name, e.g. "replicate" or "recover"
    pub operation: &'static str,
    /// Per-tag failures
    pub failures: Vec<(String, Error)>,
    /// Number of tags that were processed successfully
    pub succeeded: usize,
}

impl BatchError {
    /// Create an empty aggregate for `operation`
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            failures: Vec::new(),
            succeeded: 0,
        }
    }

    /// Record a failure for `tag`
    pub fn push(&mut self, tag: impl Into<String>, error: Error) {
        self.failures.push((tag.into(), error));
    }

    /// Record a success
    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    /// Tags that failed
    pub fn failed_tags(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|(tag, _)| tag.as_str())
    }

    /// `Ok(succeeded)` when nothing failed, otherwise the aggregate error
    pub fn into_result(self) -> Result<usize> {
        if self.failures.is_empty() {
            Ok(self.succeeded)
        } else {
            Err(Error::Batch(self))
        }
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed with {} errors:",
            self.operation,
            self.failures.len()
        )?;
        for (tag, error) in &self.failures {
            write!(f, " [tag {}: {}]", tag, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}

/// Result type alias for tag system operations
pub type Result<T> = std::result::Result<T, Error>;
