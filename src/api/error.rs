//! HTTP mapping for `FulfillmentError`.

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};

use crate::FulfillmentError;

const TRY_AGAIN: &str = "Something went wrong on our side. Please try again in a few minutes.";

impl FulfillmentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Policy(_) => StatusCode::FORBIDDEN,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FulfillmentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Upstream(_) | Self::Timeout(_) | Self::Storage(_) => {
                tracing::error!(status = status.as_u16(), error = %self, "request failed");
                TRY_AGAIN.to_string()
            }
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
