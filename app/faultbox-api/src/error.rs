//! Mapping fault errors onto protocol responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use faultbox_error::FaultError;

/// A fault error on its way out to the orchestrator.
#[derive(Debug)]
pub struct ApiError(pub FaultError);

impl From<FaultError> for ApiError {
    fn from(err: FaultError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FaultError::InvalidConfig(_) | FaultError::Unsupported { .. } => {
                StatusCode::BAD_REQUEST
            }
            FaultError::TargetGone(_) => StatusCode::NOT_FOUND,
            FaultError::Conflict(_) => StatusCode::CONFLICT,
            FaultError::HostNetworkRefused => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases = [
            (FaultError::invalid_config("x"), StatusCode::BAD_REQUEST),
            (FaultError::target_gone("x"), StatusCode::NOT_FOUND),
            (FaultError::conflict("x"), StatusCode::CONFLICT),
            (
                FaultError::HostNetworkRefused,
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (FaultError::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
