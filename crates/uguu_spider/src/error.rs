//! Error types for the spider.

use crate::protocol::ProtocolError;
use std::io;
use std::time::Duration;
use thiserror::Error;
use uguu_db::DbError;

/// How a failed scan attempt is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected per-share failure; backed off and retried later
    Transient,
    /// The catalog rejected the writes; the baseline is moved aside so the
    /// next attempt starts from a full listing
    Integrity,
    /// Anything else; logged and rolled back
    Unexpected,
}

/// Spider error type
#[derive(Error, Debug)]
pub enum SpiderError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Name resolution failed for {host}")]
    Resolve { host: String },

    #[error("Scanner failed: {0}")]
    ScannerExit(String),

    #[error("Too many lines from scanner (limit {limit})")]
    TooManyLines { limit: u64 },

    #[error("Scanner timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Tree {tree_id} is being scanned by another spider instance")]
    LockBusy { tree_id: i64 },

    #[error("Integrity violation: {0}")]
    Integrity(String),
}

impl SpiderError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolve { .. }
            | Self::ScannerExit(_)
            | Self::TooManyLines { .. }
            | Self::Timeout(_)
            | Self::LockBusy { .. } => ErrorKind::Transient,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::Db(e) if e.is_integrity_violation() => ErrorKind::Integrity,
            Self::Db(_) | Self::Io(_) | Self::Config(_) | Self::Protocol(_) => {
                ErrorKind::Unexpected
            }
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SpiderError>;
