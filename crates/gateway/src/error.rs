//! Mapping of session errors onto HTTP responses.

use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    statusbot_whatsapp::Error,
    tracing::warn,
};

/// A session error on its way out of a handler. The body is always
/// `{"error": "<message>"}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidIdentity(_) => StatusCode::BAD_REQUEST,
            Error::AlreadyConnected(_)
            | Error::AlreadyRunning(_)
            | Error::Superseded
            | Error::StaleHandle => StatusCode::CONFLICT,
            Error::PairingTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Pairing(_) | Error::Transport(_) => StatusCode::BAD_GATEWAY,
            Error::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            Error::Store(_)
            | Error::Codec(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::EmptyReactionSet => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.0, "request failed");
        }
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
