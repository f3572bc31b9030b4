//! InferenceError → HTTPレスポンス

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::InferenceError;

impl IntoResponse for InferenceError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            InferenceError::NotFound(_) => (StatusCode::NOT_FOUND, "Image file not found".to_string()),
            InferenceError::Input(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            InferenceError::NotReady(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service is not ready".to_string(),
            ),
            // 詳細はリクエストIDと共にハンドラ側でログに出す
            InferenceError::Config(_) | InferenceError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An internal error occurred".to_string(),
            ),
        };

        let body = Json(json!({
            "error": true,
            "kind": self.kind(),
            "message": message,
        }));

        (status, body).into_response()
    }
}
