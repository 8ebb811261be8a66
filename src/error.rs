//! Error types for snapsched.
//!
//! This module provides a unified error type [`SnapschedError`] for every
//! operation of the reconciliation engine, along with a convenient [`Result`]
//! type alias.
//!
//! # Error Categories
//!
//! - **Schedule**: the cron expression cannot be parsed or never fires
//! - **Object store**: missing objects, name collisions, optimistic-concurrency conflicts
//! - **External operations**: snapshot creation or deletion refused by the cluster
//! - **Time bounds**: a reconcile exceeded its configured ceiling
//! - **Configuration**: invalid reconciler settings or selectors
//!
//! # Example
//!
//! ```rust
//! use snapsched::error::{Result, SnapschedError};
//!
//! fn require_namespace(ns: &str) -> Result<&str> {
//!     if ns.is_empty() {
//!         return Err(SnapschedError::InvalidConfig {
//!             field: "namespace".into(),
//!             reason: "namespace cannot be empty".into(),
//!         });
//!     }
//!     Ok(ns)
//! }
//!
//! fn handle_error(err: &SnapschedError) {
//!     if err.is_retryable() {
//!         println!("Retrying later...");
//!     } else {
//!         println!("Fatal error: {}", err);
//!     }
//! }
//! ```

use thiserror::Error;

/// Main error type for snapsched operations.
#[derive(Error, Debug)]
pub enum SnapschedError {
    // Schedule errors
    #[error("Malformed schedule '{expression}': {reason}")]
    MalformedSchedule { expression: String, reason: String },

    #[error("Schedule '{0}' has no upcoming occurrence")]
    NotScheduled(String),

    // Object store errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("External operation failed: {0}")]
    ExternalOperationFailed(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    // Configuration errors
    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("Invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },

    // External errors
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SnapschedError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            SnapschedError::Conflict(_)
            | SnapschedError::Timeout(_)
            | SnapschedError::ExternalOperationFailed(_) => true,
            SnapschedError::Kube(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            SnapschedError::Kube(_) => true,
            _ => false,
        }
    }

    /// Whether the error means the object is gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            SnapschedError::NotFound(_) => true,
            SnapschedError::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SnapschedError {
    fn from(e: serde_json::Error) -> Self {
        SnapschedError::Serialization(e.to_string())
    }
}

/// Result type alias for snapsched operations.
pub type Result<T> = std::result::Result<T, SnapschedError>;
