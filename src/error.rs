//! Error types for the Backstop library
//!
//! This module defines all error types that can occur during Backstop operations.
//! Errors fall into a few families that callers treat differently:
//!
//! - **Validation errors** (malformed virtual paths, pattern lines, digests or
//!   snapshot documents) are fatal to the operation and always carry the
//!   offending input verbatim.
//! - **Store signals** ([`BackstopError::NotFound`], [`BackstopError::AlreadyExists`])
//!   are expected outcomes that callers branch on.
//! - **External tool failures** are fatal: partial digest results are never
//!   trusted.
//!
//! Per-entry I/O problems encountered while walking a tree are *not* errors of
//! the walk; they are accumulated in [`crate::types::ScanResult::errors`].

use crate::hashing::Digest;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Backstop library
pub type Result<T> = std::result::Result<T, BackstopError>;

/// Main error type for all Backstop operations
#[derive(Debug, Error)]
pub enum BackstopError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A path violates the virtual path invariants
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath {
        /// The offending path, verbatim
        path: String,
        /// Which invariant was violated
        reason: String,
    },

    /// A pattern file line does not follow the rule grammar
    #[error("Line \"{line}\" is not a valid pattern")]
    InvalidPattern {
        /// The offending line, verbatim
        line: String,
    },

    /// A snapshot document does not match the expected schema
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// A digest string is not a lowercase hex SHA-256
    #[error("Invalid digest: '{0}'")]
    InvalidDigest(String),

    /// Blob not present in the content-addressable store
    #[error("Object not found: {0}")]
    NotFound(Digest),

    /// Blob already present in the content-addressable store
    #[error("Object already exists: {0}")]
    AlreadyExists(Digest),

    /// Hashing a single file failed under the strict hashing policy
    #[error("Failed to hash {path:?}: {source}")]
    HashFailed {
        /// Native path of the file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The operation was cancelled before completion
    #[error("Operation cancelled")]
    Cancelled,

    /// The external hashing tool is missing, failed, or returned bad output
    #[error("External tool error: {0}")]
    ExternalTool(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackstopError {
    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        BackstopError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid pattern error for a pattern file line
    pub fn invalid_pattern(line: impl Into<String>) -> Self {
        BackstopError::InvalidPattern { line: line.into() }
    }

    /// Create an invalid snapshot error with a custom message
    pub fn invalid_snapshot(msg: impl Into<String>) -> Self {
        BackstopError::InvalidSnapshot(msg.into())
    }

    /// Create an external tool error with a custom message
    pub fn external_tool(msg: impl Into<String>) -> Self {
        BackstopError::ExternalTool(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        BackstopError::InvalidConfiguration(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        BackstopError::Internal(msg.into())
    }

    /// Check if this error is a store signal the caller is expected to handle
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BackstopError::NotFound(_) | BackstopError::AlreadyExists(_)
        )
    }

    /// Check if this error reports malformed input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BackstopError::InvalidPath { .. }
                | BackstopError::InvalidPattern { .. }
                | BackstopError::InvalidSnapshot(_)
                | BackstopError::InvalidDigest(_)
        )
    }

    /// A suggestion to print after the error, if there is one
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            BackstopError::ExternalTool(_) => Some(
                "Make sure a supported hashdeep (4.2-4.4) is on PATH, or use the builtin digest source.",
            ),
            BackstopError::Cancelled => Some("No partial results were written."),
            _ => None,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}. {}", self, hint),
            None => self.to_string(),
        }
    }
}
