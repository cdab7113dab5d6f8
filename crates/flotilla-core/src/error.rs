// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flotilla-core.
//!
//! Two families live here:
//!
//! - [`FleetError`] is what entry points and the reconciliation loop return.
//!   Anything surfacing as a `FleetError` ends the current invocation.
//! - [`ActionError`] is what the body of a session action or check returns.
//!   Apart from [`ActionError::Configuration`], these never escape a pass: the
//!   session records them in the failure ledger and schedules a retry.

use thiserror::Error;

use crate::cloud::CloudError;
use crate::package::PackageError;
use crate::remote::RemoteError;
use crate::store::StoreError;

/// Result type using FleetError.
pub type Result<T> = std::result::Result<T, FleetError>;

/// Errors that end an orchestrator invocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FleetError {
    /// The desired spec is missing or incomplete. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The state store could not be read or written.
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// The persisted state document could not be decoded or encoded.
    #[error("State document error: {0}")]
    Document(String),

    /// A cloud call made outside of a session action failed.
    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// A remote channel call made outside of a session action failed.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The agent package could not be produced.
    #[error("Package error: {0}")]
    Package(#[from] PackageError),

    /// The caller asked for something that cannot be done.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Local I/O failed (key file materialisation, spec files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Document(err.to_string())
    }
}

/// Errors raised by the body of a session action or check.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ActionError {
    /// A normal "not ready yet" condition, e.g. no address assigned.
    #[error("ExpectedDelay: {0}")]
    ExpectedDelay(String),

    /// A genuine fault on the server or in a collaborator.
    #[error("UnexpectedExternalProblem: {0}")]
    UnexpectedExternalProblem(String),

    /// Required desired-spec fields are missing. Aborts the whole pass.
    #[error("ConfigurationError: {0}")]
    Configuration(String),
}

impl ActionError {
    /// Shorthand for an expected delay.
    pub fn delay(message: impl Into<String>) -> Self {
        Self::ExpectedDelay(message.into())
    }

    /// Shorthand for an unexpected external problem.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedExternalProblem(message.into())
    }

    /// Whether this is a normal not-yet-ready condition.
    pub fn is_expected_delay(&self) -> bool {
        matches!(self, Self::ExpectedDelay(_))
    }
}

impl From<CloudError> for ActionError {
    fn from(err: CloudError) -> Self {
        ActionError::UnexpectedExternalProblem(err.to_string())
    }
}

impl From<RemoteError> for ActionError {
    fn from(err: RemoteError) -> Self {
        ActionError::UnexpectedExternalProblem(err.to_string())
    }
}

impl From<PackageError> for ActionError {
    fn from(err: PackageError) -> Self {
        ActionError::UnexpectedExternalProblem(err.to_string())
    }
}
