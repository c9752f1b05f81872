//! Application error hierarchy and HTTP response conversion.
//!
//! The taxonomy mirrors the error handling design: [`SignatureError`](Error::SignatureError) for
//! webhook verification failures, [`SourceApiError`](Error::SourceApiError) for failures talking
//! to the payment processor, [`Database`](Error::Database) for any persistence failure,
//! [`DuplicateEndpoint`](Error::DuplicateEndpoint) for the managed-webhook race backstop,
//! [`StaleRun`](Error::StaleRun) for sync runs cancelled by the stale-run sweep, and
//! [`Migration`](Error::Migration)/[`Config`](Error::Config) for startup-time failures.

use crate::db::errors::DbError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Webhook signature missing, malformed, mismatched, or outside the tolerance window.
    #[error("webhook signature verification failed: {message}")]
    SignatureError { message: String },

    /// The payment processor's API rejected or failed to service a request.
    #[error("source API error: {message}")]
    SourceApiError { message: String },

    /// Any database failure.
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unique-constraint violation on a managed webhook's `(account_id, url)`; the caller should
    /// re-read and return the existing row rather than treat this as fatal.
    #[error("managed webhook already exists for this account and URL")]
    DuplicateEndpoint,

    /// A sync run was cancelled by `cancel_stale_runs` because its most recently touched object
    /// run went quiet past the stale interval.
    #[error("stale sync run: {message}")]
    StaleRun { message: String },

    /// Schema migration failed, or a legacy (pre-this-system) install was detected.
    #[error("migration error: {message}")]
    Migration { message: String },

    /// A required credential or setting was missing after env + prompt resolution.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Invalid request data.
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found.
    #[error("{resource} with id {id} not found")]
    NotFound { resource: String, id: String },

    /// Generic internal error with an operation description.
    #[error("failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::SignatureError { .. } => StatusCode::BAD_REQUEST,
            Error::SourceApiError { .. } => StatusCode::BAD_GATEWAY,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::DuplicateEndpoint => StatusCode::CONFLICT,
            Error::StaleRun { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Migration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A message safe to return in a response body, per the §4.3 failure policy: signature
    /// errors and downstream errors both surface their message, everything 5xx-ish stays generic.
    pub fn user_message(&self) -> String {
        match self {
            Error::SignatureError { message } => message.clone(),
            Error::SourceApiError { message } => message.clone(),
            Error::Database(_) => self.to_string(),
            Error::DuplicateEndpoint => self.to_string(),
            Error::StaleRun { message } => message.clone(),
            Error::Migration { message } => message.clone(),
            Error::Config { message } => message.clone(),
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with id {id} not found"),
            Error::Internal { .. } => "internal server error".to_string(),
            Error::Other(_) => "internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("internal error: {:#}", self);
            }
            Error::SignatureError { .. } => {
                tracing::info!("webhook signature rejected: {}", self);
            }
            Error::SourceApiError { .. } => {
                tracing::warn!("source API error: {}", self);
            }
            Error::StaleRun { .. } => {
                tracing::warn!("stale run cancelled: {}", self);
            }
            _ => {
                tracing::debug!("request error: {}", self);
            }
        }

        let status = self.status_code();
        // The webhook route's contract is exactly `{received: true}` on success; errors fall
        // through to a plain-text body carrying the user-safe message.
        (status, self.user_message()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
