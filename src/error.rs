//! Error types for the Mintstream engine
//!
//! This module provides a comprehensive error hierarchy following Rust best practices:
//! - `thiserror` for ergonomic error definitions
//! - Domain-specific error variants for actionable error handling
//! - Step-scoped pipeline errors that persist into document state
//! - HTTP status code mapping for API responses

use crate::model::{CreationStep, RefreshStep, StoredError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;

/// Result type alias for Mintstream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Mintstream engine
#[derive(Debug, Error)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    #[error("Configuration error: {message}")]
    Config {
        message: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig {
        key: &'static str,
        message: Cow<'static, str>,
    },

    // ========================================================================
    // Document Store Errors
    // ========================================================================
    #[error("Store error: {message}")]
    Store {
        message: Cow<'static, str>,
        #[source]
        source: Option<sqlx::Error>,
    },

    #[error("Document not found: {path}")]
    DocNotFound { path: String },

    #[error("Batch commit failed after {attempts} attempts (sample document: {sample_path})")]
    BatchCommitFailed { attempts: u32, sample_path: String },

    // ========================================================================
    // Blockchain/RPC Errors
    // ========================================================================
    #[error("Blockchain RPC error: {message}")]
    Blockchain {
        message: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("No RPC providers configured for chain {chain_id}")]
    UnsupportedChain { chain_id: String },

    #[error("RPC rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Malformed request as judged by the provider. Never retried.
    #[error("Invalid RPC request: {message}")]
    InvalidRpcRequest { message: Cow<'static, str> },

    #[error("Requested block range too large: {message}")]
    RangeTooLarge { message: String },

    #[error("Contract call failed for {contract}: {message}")]
    ContractCall {
        contract: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },

    #[error("Event decoding failed for {event}: {message}")]
    EventDecode {
        event: &'static str,
        message: Cow<'static, str>,
    },

    #[error("Contract creation event not found for {address}")]
    CreationEventNotFound { address: String },

    #[error("Token URI unavailable for token {token_id}")]
    UriUnavailable { token_id: String },

    // ========================================================================
    // HTTP Fetch Errors
    // ========================================================================
    #[error("HTTP fetch failed for {url}: {message}")]
    Fetch {
        url: String,
        message: Cow<'static, str>,
        retryable: bool,
    },

    // ========================================================================
    // Pipeline Step Errors
    // ========================================================================
    /// A token pipeline step failed; the discriminator identifies the step so
    /// a later pass can selectively re-run it.
    #[error("Token step {step} failed: {message}")]
    TokenStep {
        step: RefreshStep,
        message: Cow<'static, str>,
    },

    /// A collection pipeline step failed.
    #[error("Collection step {step} failed: {message}")]
    CollectionStep {
        step: CreationStep,
        message: Cow<'static, str>,
    },

    // ========================================================================
    // API Errors
    // ========================================================================
    #[error("Bad request: {message}")]
    BadRequest { message: Cow<'static, str> },

    #[error("Internal server error")]
    Internal {
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // ========================================================================
    // Generic Errors
    // ========================================================================
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    // ========================================================================
    // Constructors for common error patterns
    // ========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store error with source
    pub fn store_with_source(message: impl Into<Cow<'static, str>>, source: sqlx::Error) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a blockchain error
    pub fn blockchain(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Blockchain {
            message: message.into(),
            source: None,
        }
    }

    /// Create a bad request error
    pub fn bad_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal {
            source: Some(Box::new(source)),
        }
    }

    /// Create a token step error
    pub fn token_step(step: RefreshStep, message: impl Into<Cow<'static, str>>) -> Self {
        Self::TokenStep {
            step,
            message: message.into(),
        }
    }

    /// Create a collection step error
    pub fn collection_step(step: CreationStep, message: impl Into<Cow<'static, str>>) -> Self {
        Self::CollectionStep {
            step,
            message: message.into(),
        }
    }

    // ========================================================================
    // Error Classification
    // ========================================================================

    /// Returns true if this error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store { .. }
            | Error::Blockchain { .. }
            | Error::RateLimited { .. }
            | Error::Timeout { .. } => true,
            Error::Fetch { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns true if the provider rejected the request as malformed.
    /// These propagate immediately without retry.
    pub fn is_fatal_protocol(&self) -> bool {
        matches!(
            self,
            Error::InvalidRpcRequest { .. }
                | Error::EventDecode { .. }
                | Error::InvalidAddress { .. }
        )
    }

    /// The step discriminator and message to persist into `state.*.error`,
    /// or a reserved `"unknown"` entry when the failure point isn't trusted.
    pub fn to_stored(&self) -> StoredError {
        match self {
            Error::TokenStep { step, message } => StoredError::new(step.as_str(), message.clone()),
            Error::CollectionStep { step, message } => {
                StoredError::new(step.as_str(), message.clone())
            }
            other => StoredError::unknown(other.to_string()),
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. }
            | Error::InvalidAddress { .. }
            | Error::UnsupportedChain { .. } => StatusCode::BAD_REQUEST,
            Error::DocNotFound { .. } => StatusCode::NOT_FOUND,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } | Error::MissingEnvVar { .. } | Error::InvalidConfig { .. } => {
                "CONFIG_ERROR"
            }
            Error::Store { .. } | Error::DocNotFound { .. } | Error::BatchCommitFailed { .. } => {
                "STORE_ERROR"
            }
            Error::Blockchain { .. }
            | Error::UnsupportedChain { .. }
            | Error::InvalidRpcRequest { .. }
            | Error::RangeTooLarge { .. }
            | Error::ContractCall { .. }
            | Error::InvalidAddress { .. }
            | Error::EventDecode { .. }
            | Error::CreationEventNotFound { .. }
            | Error::UriUnavailable { .. } => "BLOCKCHAIN_ERROR",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::Fetch { .. } => "FETCH_ERROR",
            Error::TokenStep { .. } | Error::CollectionStep { .. } => "PIPELINE_ERROR",
            Error::BadRequest { .. } => "BAD_REQUEST",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Json(_) => "SERIALIZATION_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal { .. } | Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

// ============================================================================
// Error Response for API
// ============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        // Don't expose internal error details in production
        let safe_message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "An internal error occurred".to_string()
        } else {
            message
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code,
                message: safe_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Error::DocNotFound {
                path: "unknown".to_string(),
            },
            _ => Error::Store {
                message: err.to_string().into(),
                source: Some(err),
            },
        }
    }
}

impl From<std::env::VarError> for Error {
    fn from(_err: std::env::VarError) -> Self {
        Error::Config {
            message: "Environment variable error".into(),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::blockchain("connection reset").is_retryable());
        assert!(Error::RateLimited {
            retry_after_ms: 1000
        }
        .is_retryable());
        assert!(!Error::InvalidRpcRequest {
            message: "bad params".into()
        }
        .is_retryable());
        assert!(!Error::EventDecode {
            event: "Transfer",
            message: "missing topic".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            Error::bad_request("invalid").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::UnsupportedChain {
                chain_id: "999".to_string()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Internal { source: None }.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_step_error_persists_discriminator() {
        let err = Error::token_step(RefreshStep::Image, "missing content type");
        let stored = err.to_stored();
        assert_eq!(stored.discriminator, "image");

        let err = Error::blockchain("socket closed");
        assert!(err.to_stored().is_unknown());
    }
}
