use axum::http::StatusCode;
use axum::http::header::CACHE_CONTROL;
use axum::response::{IntoResponse, Redirect, Response};
use url::Url;

use crate::flow::FlowError;

/// Authentication errors for the middleware layer.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No valid session found.
    #[error("Not authenticated")]
    Unauthenticated,

    /// Sign-in flow failed; the browser is sent to `destination`.
    #[error("Sign-in failed: {error}")]
    Flow { error: FlowError, destination: Url },

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()).into_response(),
            Self::Flow { ref error, .. } if error.is_malformed_request() => {
                (StatusCode::BAD_REQUEST, error.to_string()).into_response()
            }
            Self::Flow { destination, .. } => (
                [(CACHE_CONTROL, "no-store")],
                Redirect::to(destination.as_str()),
            )
                .into_response(),
            Self::Config(_) => {
                tracing::error!(error = %self, "Auth internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
        }
    }
}
