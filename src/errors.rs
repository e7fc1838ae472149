//! Application error model with HTTP response mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to the HTTP status + message envelope the control API
//! returns. Infrastructure failures never leak their details to API callers.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers all error cases the relay may encounter: domain constraint
/// violations surfaced by the control API, IMAP session failures surfaced by
/// the workers, and wrapped infrastructure errors.
#[derive(Debug, Error)]
pub enum AppError {
    /// No bot user with the given telegram id
    #[error("bot user with telegram_id:{0} doesn't exist")]
    UserNotFound(i64),
    /// Insert hit the bot user primary key
    #[error("bot user already exists")]
    UserAlreadyExists,
    /// No email service with the given id
    #[error("email service with id:{0} doesn't exist")]
    ServiceNotFound(i64),
    /// The service table is empty
    #[error("no email services available")]
    ServicesNotAvailable,
    /// No email box with the given id
    #[error("email box with id:{0} not found")]
    BoxNotFound(i64),
    /// Insert hit the `(user, login, service)` uniqueness constraint
    #[error("email box already exists")]
    BoxAlreadyExists,
    /// The box exists but belongs to a different user
    #[error("email box is not owned by the requesting user")]
    BoxNotOwnedByUser,
    /// The user has no boxes at all
    #[error("user has no email boxes")]
    BoxesNotFound,
    /// A filter set was expected but the box has none
    #[error("no filters applied to email box with id:{0}")]
    FiltersNotFound(i64),
    /// IMAP LOGIN rejected the credentials
    #[error("email credentials rejected by the IMAP server")]
    CredentialsInvalid,
    /// An IMAP operation exceeded its timeout
    #[error("IMAP server timed out: {0}")]
    ServerTimeout(String),
    /// Attempt to operate on a session that was never opened or already closed
    #[error("IMAP session is not connected")]
    NotConnected,
    /// Key-value store failure
    #[error("kv store error: {0}")]
    Kv(#[from] redis::RedisError),
    /// Database failure
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    /// Outbound HTTP failure
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    /// Credential cipher failure
    #[error("crypto error: {0}")]
    Crypto(String),
    /// HTML rasterization failure
    #[error("render error: {0}")]
    Render(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `Internal`
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// HTTP status + user-visible message for this error
    ///
    /// Domain errors keep the exact phrasing the bot front end matches on.
    /// Everything infrastructural collapses to a generic 500 so transient
    /// failures never leak stack traces or connection strings.
    pub fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            Self::UserNotFound(id) => (
                StatusCode::NOT_FOUND,
                format!("Requested bot user with telegram_id:{id} doesn't exist"),
            ),
            Self::UserAlreadyExists => {
                (StatusCode::BAD_REQUEST, "Bot user already exists".to_owned())
            }
            Self::ServiceNotFound(id) => (
                StatusCode::NOT_FOUND,
                format!("Requested email service with id:{id} doesn't exist"),
            ),
            Self::ServicesNotAvailable => (
                StatusCode::NOT_FOUND,
                "No available services found".to_owned(),
            ),
            Self::BoxNotFound(id) => (
                StatusCode::NOT_FOUND,
                format!("Requested email box with id:{id} not found"),
            ),
            Self::BoxAlreadyExists => (
                StatusCode::BAD_REQUEST,
                "This email box already exists".to_owned(),
            ),
            Self::BoxNotOwnedByUser => (
                StatusCode::BAD_REQUEST,
                "Requested bot user doesn't have this email box".to_owned(),
            ),
            Self::BoxesNotFound => (
                StatusCode::NOT_FOUND,
                "You do not have any email boxes yet".to_owned(),
            ),
            Self::FiltersNotFound(id) => (
                StatusCode::NOT_FOUND,
                format!("There are no applied filters for the email box with id:{id}"),
            ),
            Self::CredentialsInvalid => (
                StatusCode::BAD_REQUEST,
                "Your email credentials are incorrect".to_owned(),
            ),
            Self::ServerTimeout(_) => (
                StatusCode::BAD_REQUEST,
                "IMAP server is not responding".to_owned(),
            ),
            Self::NotConnected
            | Self::Kv(_)
            | Self::Db(_)
            | Self::Http(_)
            | Self::Crypto(_)
            | Self::Render(_)
            | Self::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_owned(),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "message": message }))).into_response()
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;
    use axum::http::StatusCode;

    #[test]
    fn domain_errors_keep_their_api_phrasing() {
        let (status, message) = AppError::CredentialsInvalid.status_and_message();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(message, "Your email credentials are incorrect");

        let (status, message) = AppError::UserNotFound(42).status_and_message();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            message,
            "Requested bot user with telegram_id:42 doesn't exist"
        );

        let (status, message) = AppError::ServerTimeout("IDLE".to_owned()).status_and_message();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(message, "IMAP server is not responding");
    }

    #[test]
    fn infrastructure_errors_collapse_to_opaque_500() {
        let (status, message) =
            AppError::Internal("connection pool exhausted".to_owned()).status_and_message();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(message, "Internal server error");
        assert!(!message.contains("pool"));
    }
}
