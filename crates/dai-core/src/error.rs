// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for dai-core.
//!
//! Remote procedure statuses map onto [`DaiError::Procedure`] one to one;
//! transport problems surface as [`DaiError::Gateway`].

use std::time::Duration;

use thiserror::Error;

use crate::compression::CompressionError;
use crate::config::ConfigError;
use crate::gateway::{GatewayError, ResponseStatus};
use crate::params::ParamsError;

/// Result type using DaiError
pub type Result<T> = std::result::Result<T, DaiError>;

/// Errors raised by the work queue, adapter operations and node coordination.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DaiError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The gateway could not deliver the call (connection lost, timed out, closed).
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// The procedure ran but reported a non-success status.
    #[error("{procedure} failed - Status={status}, StatusString={message}")]
    Procedure {
        procedure: String,
        status: ResponseStatus,
        message: String,
    },

    /// A procedure succeeded but did not return the row or scalar the caller needs.
    #[error("{procedure} returned no usable result")]
    MissingResult { procedure: String },

    /// The base work item claimed at startup is not the one that was just created.
    #[error(
        "base work item mismatch - created work item {created} but claimed {claimed}"
    )]
    BaseWorkItemMismatch { created: i64, claimed: i64 },

    /// A claimed work item names a command no handler is registered for.
    #[error("no handler for work item command '{0}'")]
    UnexpectedWorkItem(String),

    /// A work item is missing a parameter its handler requires.
    #[error("work item '{work}' is missing parameter '{name}'")]
    MissingParameter { work: String, name: String },

    /// A work item parameter has a value its handler does not accept.
    #[error("parameter '{name}' has invalid value '{value}'")]
    InvalidParameter { name: String, value: String },

    /// Work item parameter blob could not be parsed.
    #[error("Parameter error: {0}")]
    Params(#[from] ParamsError),

    /// Result payload could not be decoded.
    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    /// Waiting for another work item exceeded the configured timeout.
    #[error("work item {work_item_id} did not finish within {waited:?}")]
    WaitTimedOut { work_item_id: i64, waited: Duration },

    /// The adapter started shutting down while an operation was in progress.
    #[error("adapter is shutting down")]
    ShuttingDown,

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DaiError {
    /// Build a procedure failure from a non-success response.
    pub fn procedure(
        procedure: impl Into<String>,
        status: ResponseStatus,
        message: impl Into<String>,
    ) -> Self {
        Self::Procedure {
            procedure: procedure.into(),
            status,
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Gateway(e) => e.error_code(),
            Self::Procedure { status, .. } => status.as_str(),
            Self::MissingResult { .. } => "MISSING_RESULT",
            Self::BaseWorkItemMismatch { .. } => "BASE_WORK_ITEM_MISMATCH",
            Self::UnexpectedWorkItem(_) => "UNEXPECTED_WORK_ITEM",
            Self::MissingParameter { .. } => "MISSING_PARAMETER",
            Self::InvalidParameter { .. } => "INVALID_PARAMETER",
            Self::Params(_) => "PARAMETER_ERROR",
            Self::Compression(_) => "COMPRESSION_ERROR",
            Self::WaitTimedOut { .. } => "WAIT_TIMED_OUT",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Migration(_) => "MIGRATION_ERROR",
        }
    }

    /// The response status this error corresponds to, when it came from a remote call.
    pub fn status(&self) -> Option<ResponseStatus> {
        match self {
            Self::Gateway(e) => Some(e.status()),
            Self::Procedure { status, .. } => Some(*status),
            _ => None,
        }
    }
}
