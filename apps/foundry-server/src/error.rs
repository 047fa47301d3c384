use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use foundry_protocol::ProblemDetails;

use crate::archive::ArchiveError;
use crate::auth::AuthError;
use crate::validate::ValidationError;

/// Everything that can end a request before a stream starts.
#[derive(Debug, thiserror::Error)]
pub(crate) enum FoundryError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("rate limit exceeded; retry in {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("insufficient capability")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("internal error: {0}")]
    Internal(String),
}

impl FoundryError {
    pub fn code(&self) -> &'static str {
        match self {
            FoundryError::Auth(e) => e.code(),
            FoundryError::Validation(e) => e.code(),
            FoundryError::Archive(e) => e.code(),
            FoundryError::RateLimited { .. } => "rate_limited",
            FoundryError::Forbidden => "forbidden",
            FoundryError::BadRequest(_) => "bad_request",
            FoundryError::PayloadTooLarge => "payload_too_large",
            FoundryError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            FoundryError::Auth(_) => StatusCode::UNAUTHORIZED,
            FoundryError::Validation(_) | FoundryError::BadRequest(_) => StatusCode::BAD_REQUEST,
            FoundryError::Archive(e) => match e {
                ArchiveError::InvalidToken | ArchiveError::InvalidUpload(_) => StatusCode::BAD_REQUEST,
                ArchiveError::TokenNotFound
                | ArchiveError::FileOpenFailed(_)
                | ArchiveError::PathNotFound(_) => StatusCode::NOT_FOUND,
                ArchiveError::PathNotReadable(_) => StatusCode::FORBIDDEN,
                ArchiveError::EngineUnavailable(_) | ArchiveError::CreateFailed(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            FoundryError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            FoundryError::Forbidden => StatusCode::FORBIDDEN,
            FoundryError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            FoundryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            FoundryError::Auth(_) => "Unauthorized",
            FoundryError::Validation(_) => "Command Rejected",
            FoundryError::Archive(_) => "Archive Error",
            FoundryError::RateLimited { .. } => "Too Many Requests",
            FoundryError::Forbidden => "Forbidden",
            FoundryError::BadRequest(_) => "Bad Request",
            FoundryError::PayloadTooLarge => "Payload Too Large",
            FoundryError::Internal(_) => "Internal Error",
        }
    }

    pub fn problem(&self) -> ProblemDetails {
        // Auth failures keep their detail terse; the code says enough.
        let detail = match self {
            FoundryError::Auth(_) => None,
            FoundryError::Internal(_) => Some("internal error".to_string()),
            other => Some(other.to_string()),
        };
        ProblemDetails {
            r#type: "about:blank".into(),
            title: self.title().into(),
            status: self.status().as_u16(),
            detail,
            instance: None,
            code: Some(self.code().into()),
        }
    }
}

impl IntoResponse for FoundryError {
    fn into_response(self) -> Response {
        if let FoundryError::Internal(msg) = &self {
            tracing::error!("internal error: {msg}");
        }
        let mut response = (self.status(), Json(self.problem())).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        if let FoundryError::RateLimited { retry_after } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
