// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for duragraph-core.
//!
//! Every operation returns [`CoreError`]. Each variant has a stable error code and a
//! deterministic HTTP status so adapters can map errors without inspecting messages.

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during request processing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A resource was not found.
    #[error("{resource} '{id}' not found")]
    NotFound {
        /// Kind of resource (run, thread, checkpoint, ...).
        resource: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A resource with the same identity already exists.
    #[error("{resource} '{id}' already exists")]
    AlreadyExists {
        /// Kind of resource.
        resource: &'static str,
        /// Conflicting identifier.
        id: String,
    },

    /// The request itself is malformed.
    #[error("invalid input for '{field}': {message}")]
    InvalidInput {
        /// The offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The request is legal but the aggregate is in a state that forbids it.
    #[error("cannot {operation} in state '{current}'")]
    InvalidState {
        /// Current state of the aggregate.
        current: String,
        /// The operation that was attempted.
        operation: String,
    },

    /// Optimistic concurrency check failed; the caller must reload and retry.
    #[error(
        "concurrency conflict on {aggregate_type} '{aggregate_id}': expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// Aggregate type of the stream.
        aggregate_type: String,
        /// Aggregate identifier of the stream.
        aggregate_id: String,
        /// Version supplied by the caller.
        expected: i64,
        /// Version found in the store.
        actual: i64,
    },

    /// The caller is not authenticated.
    #[error("unauthorized")]
    Unauthorized,

    /// The caller is authenticated but not allowed to perform the operation.
    #[error("forbidden")]
    Forbidden,

    /// Unexpected failure that is not the caller's fault.
    #[error("internal error during '{operation}': {details}")]
    Internal {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for [`CoreError::NotFound`].
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Shorthand for [`CoreError::InvalidInput`].
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for [`CoreError::InvalidState`].
    pub fn invalid_state(current: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::InvalidState {
            current: current.into(),
            operation: operation.into(),
        }
    }

    /// Shorthand for [`CoreError::Internal`].
    pub fn internal(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Internal {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// HTTP status code an adapter should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::AlreadyExists { .. } => 409,
            Self::InvalidInput { .. } => 400,
            Self::InvalidState { .. } => 409,
            Self::ConcurrencyConflict { .. } => 409,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::Internal { .. } => 500,
        }
    }

    /// Whether the caller may retry the same request after reloading state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Internal {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

/// Returns true when a database error is a unique-key violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_statuses() {
        let test_cases = vec![
            (CoreError::not_found("run", "r-1"), "NOT_FOUND", 404),
            (
                CoreError::AlreadyExists {
                    resource: "thread",
                    id: "t-1".to_string(),
                },
                "ALREADY_EXISTS",
                409,
            ),
            (
                CoreError::invalid_input("thread_id", "required"),
                "INVALID_INPUT",
                400,
            ),
            (
                CoreError::invalid_state("queued", "delete"),
                "INVALID_STATE",
                409,
            ),
            (
                CoreError::ConcurrencyConflict {
                    aggregate_type: "run".to_string(),
                    aggregate_id: "r-1".to_string(),
                    expected: 1,
                    actual: 2,
                },
                "CONCURRENCY_CONFLICT",
                409,
            ),
            (CoreError::Unauthorized, "UNAUTHORIZED", 401),
            (CoreError::Forbidden, "FORBIDDEN", 403),
            (
                CoreError::internal("insert", "connection refused"),
                "INTERNAL_ERROR",
                500,
            ),
        ];

        for (error, code, status) in test_cases {
            assert_eq!(error.error_code(), code, "code for {:?}", error);
            assert_eq!(error.http_status(), status, "status for {:?}", error);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            CoreError::not_found("run", "abc-123").to_string(),
            "run 'abc-123' not found"
        );
        assert_eq!(
            CoreError::invalid_state("success", "cancel").to_string(),
            "cannot cancel in state 'success'"
        );
        assert_eq!(
            CoreError::ConcurrencyConflict {
                aggregate_type: "run".to_string(),
                aggregate_id: "abc".to_string(),
                expected: 3,
                actual: 4,
            }
            .to_string(),
            "concurrency conflict on run 'abc': expected version 3, found 4"
        );
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(
            CoreError::ConcurrencyConflict {
                aggregate_type: "thread".to_string(),
                aggregate_id: "t".to_string(),
                expected: 0,
                actual: 1,
            }
            .is_retryable()
        );
        assert!(!CoreError::invalid_state("error", "resume").is_retryable());
        assert!(!CoreError::internal("query", "boom").is_retryable());
    }

    #[test]
    fn test_sqlx_errors_wrap_as_internal() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
    }
}
