//! Bitarchive Error Types

use thiserror::Error;

/// Result type alias for bitarchive operations
pub type Result<T> = std::result::Result<T, Error>;

/// Bitarchive error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Configuration serialization error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    // Request validation
    #[error("Invalid request: {0}")]
    Validation(String),

    // Reconciliation errors
    #[error("No checksum has a strict majority for '{filename}': {votes:?}")]
    ConsistencyConflict {
        filename: String,
        votes: Vec<(String, usize)>,
    },

    // Replica storage errors
    #[error("Not enough space left: {0}")]
    ResourceExhausted(String),

    #[error("Security violation: {0}")]
    SecurityViolation(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("Unknown replica: {0}")]
    UnknownReplica(String),

    #[error("Unknown file: {0}")]
    UnknownFile(String),

    #[error("Repair failed: {0}")]
    RepairFailed(String),

    // Message handling
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No handler for {kind} messages in {handler}")]
    UnhandledMessage {
        kind: &'static str,
        handler: &'static str,
    },

    #[error("Wire serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Persistence
    #[error("Store error: {0}")]
    Store(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Batch execution
    #[error("Batch job {0} was cancelled")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error must be surfaced as a security event
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Error::SecurityViolation(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::SecurityViolation("wrong credentials".into()).is_security_violation());
        assert!(!Error::Validation("empty".into()).is_security_violation());
    }

    #[test]
    fn test_conflict_message_lists_votes() {
        let err = Error::ConsistencyConflict {
            filename: "a.warc".into(),
            votes: vec![("aa".into(), 2), ("bb".into(), 2)],
        };
        let text = err.to_string();
        assert!(text.contains("a.warc"));
        assert!(text.contains("aa"));
    }
}
