// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the entity replicator.
//!
//! Lower layers (transcoder, updater, snapshot codec) return these errors and
//! never decide what happens next. Only the queue worker applies retry or drop
//! policy, by handing the error to a
//! [`FailureClassifier`](crate::classify::FailureClassifier).
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Depends | Slave store failure; transient only for communication failures |
//! | `Transcode` | No | A field could not be read or written while copying a graph |
//! | `FieldAccess` | No | A field token or value did not fit the target schema |
//! | `NotMirrored` | No | The entity has no slave-side correspondent type |
//! | `Durability` | No | Snapshot read/write failure (logged, never fatal) |
//! | `Registry` | No | Type registry could not be built |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Queue or engine state machine violation |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`ReplicationError::is_retryable()`] walks the full cause chain looking for
//! a connectivity failure, the same check the default classifier performs.

use crate::entity::{EntityType, FieldAccessError};
use crate::store::StoreError;
use crate::transcode::TranscodeError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Slave store rejected or failed an operation.
    ///
    /// Kept as a distinct link in the cause chain so classifiers can
    /// downcast to [`StoreError`] and inspect its kind.
    #[error("Slave store error: {0}")]
    Store(#[from] StoreError),

    /// Copying a master graph into slave shape failed.
    #[error("Transcode failed: {0}")]
    Transcode(#[from] TranscodeError),

    /// A field token or value did not fit the entity's schema.
    #[error("Field access error: {0}")]
    FieldAccess(#[from] FieldAccessError),

    /// The entity is not a master type, or no slave correspondent exists.
    ///
    /// Not retryable: the registry is immutable, so a retry cannot succeed.
    #[error("Entity type {entity_type} is not mirrored to the slave store")]
    NotMirrored { entity_type: EntityType },

    /// Reading or writing the pending-operation snapshot failed.
    #[error("Durability error ({path}): {message}")]
    Durability { path: String, message: String },

    /// Type registry construction failed (unknown or duplicate mapping).
    #[error("Type registry error: {0}")]
    Registry(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queue or engine state machine violation.
    ///
    /// Occurs when mutating a stopped queue, or starting an engine twice.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a durability error for a snapshot path.
    pub fn durability(path: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::Durability {
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// Create an invalid-state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    /// Check if this error is retryable.
    ///
    /// True when any error in the cause chain is a communication failure.
    pub fn is_retryable(&self) -> bool {
        crate::classify::is_communication_failure(self)
    }
}
