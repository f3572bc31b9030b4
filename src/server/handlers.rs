//! HTTPハンドラ

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{InferenceError, Result};
use crate::ml::{ImageSource, Prediction};
use crate::service::InferenceService;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// 推論リクエスト
///
/// `image_path` と `image_base64` のどちらか一方を指定する。
#[derive(Debug, Default, Deserialize)]
pub struct InferRequest {
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

impl InferRequest {
    fn into_source(self) -> Result<ImageSource> {
        match (self.image_path, self.image_base64) {
            (Some(path), None) => Ok(ImageSource::Path(PathBuf::from(path))),
            (None, Some(encoded)) => decode_base64(&encoded).map(ImageSource::Bytes),
            (Some(_), Some(_)) => Err(InferenceError::Input(
                "specify only one of image_path or image_base64".to_string(),
            )),
            (None, None) => Err(InferenceError::Input(
                "image_path or image_base64 is required".to_string(),
            )),
        }
    }
}

/// `data:image/png;base64,` 形式のプレフィックスも受け付ける
fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    let payload = match encoded.find("base64,") {
        Some(pos) if encoded.starts_with("data:") => &encoded[pos + "base64,".len()..],
        _ => encoded,
    };
    STANDARD
        .decode(payload.trim())
        .map_err(|e| InferenceError::Input(format!("invalid base64 image: {}", e)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InferResponse {
    pub predictions: Vec<Prediction>,
}

pub async fn root<B: Backend>(State(service): State<Arc<InferenceService<B>>>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "Succulent Identifier ML Service",
        "status": "running",
        "model_loaded": service.health().ready,
        "device": service.device_name(),
    }))
}

/// Readyなら200、それ以外は503
pub async fn health<B: Backend>(State(service): State<Arc<InferenceService<B>>>) -> Response {
    let health = service.health();
    let status = if health.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = Json(json!({
        "status": if health.ready { "healthy" } else { "unavailable" },
        "ready": health.ready,
        "class_count": health.class_count,
        "phase": health.phase,
        "device": health.device,
    }));

    (status, body).into_response()
}

pub async fn infer<B: Backend>(
    State(service): State<Arc<InferenceService<B>>>,
    payload: std::result::Result<Json<InferRequest>, JsonRejection>,
) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let result = run_inference(service, payload, &request_id).await;

    match &result {
        Ok(predictions) => {
            if let Some(top) = predictions.first() {
                tracing::info!(
                    request_id = %request_id,
                    label = %top.label,
                    confidence = top.confidence,
                    "inference completed"
                );
            }
        }
        Err(e @ (InferenceError::Internal(_) | InferenceError::Config(_))) => {
            tracing::error!(request_id = %request_id, error = %e, "inference failed");
        }
        Err(e) => {
            tracing::warn!(request_id = %request_id, kind = e.kind(), error = %e, "inference rejected");
        }
    }

    let mut response = match result {
        Ok(predictions) => Json(InferResponse { predictions }).into_response(),
        Err(e) => e.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn run_inference<B: Backend>(
    service: Arc<InferenceService<B>>,
    payload: std::result::Result<Json<InferRequest>, JsonRejection>,
    request_id: &str,
) -> Result<Vec<Prediction>> {
    let Json(request) = payload.map_err(|rejection| InferenceError::Input(rejection.body_text()))?;
    let top_k = request.top_k;
    let source = request.into_source()?;

    if let ImageSource::Path(path) = &source {
        tracing::info!(request_id = %request_id, path = %path.display(), "inference request");
    } else {
        tracing::info!(request_id = %request_id, "inference request (uploaded image)");
    }

    // 順伝播はCPUを占有するのでブロッキングプールで実行
    tokio::task::spawn_blocking(move || service.infer(&source, top_k))
        .await
        .map_err(|e| InferenceError::Internal(format!("inference task failed: {}", e)))?
}
