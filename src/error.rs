//! Error types and result handling for xcluster-ctl.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use xcluster_ctl::{Error, Result};
//!
//! fn check_membership(tables: &[String]) -> Result<()> {
//!     if tables.is_empty() {
//!         return Err(Error::Validation("no tables requested".to_string()));
//!     }
//!     Ok(())
//! }
//!
//! match check_membership(&[]) {
//!     Ok(()) => println!("ok"),
//!     Err(Error::Validation(msg)) => eprintln!("rejected: {}", msg),
//!     Err(e) => eprintln!("other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for xcluster-ctl operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Request rejected before any subtask ran.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A collaborator call failed after its retry policy was exhausted.
    #[error("Remote operation failed on {service}: {message}")]
    RemoteOperation {
        /// Collaborator that failed (catalog, backup, stream)
        service: &'static str,
        /// Description of the failure
        message: String,
    },

    /// Another task already holds the lease for this resource.
    #[error("Concurrency conflict: {resource} is locked by task {holder}")]
    ConcurrencyConflict {
        /// Resource that could not be leased
        resource: String,
        /// Task currently holding the lease
        holder: uuid::Uuid,
    },

    /// Optimistic version check failed on commit.
    #[error("Version conflict on {entity}: expected {expected}, found {found}")]
    VersionConflict {
        /// Row that was concurrently modified
        entity: String,
        /// Version the writer read
        expected: u64,
        /// Version currently stored
        found: u64,
    },

    /// Requested entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind (config, task, backup, ...)
        kind: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// Bounded wait elapsed.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Task was aborted at operator request.
    #[error("Task aborted")]
    Aborted,

    /// Persistence layer refused or failed a write.
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// JSON serialization error for persisted records and step params.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from the file store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn remote(service: &'static str, message: impl Into<String>) -> Self {
        Error::RemoteOperation {
            service,
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether a collaborator call that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RemoteOperation { .. } | Error::Timeout { .. })
    }
}

/// A convenient Result type alias for xcluster-ctl operations.
///
/// This is equivalent to `std::result::Result<T, xcluster_ctl::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
