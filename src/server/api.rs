//! ルーティング定義

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use burn::tensor::backend::Backend;
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;
use crate::model::ServerSettings;
use crate::service::InferenceService;

async fn handle_404() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": true,
            "kind": "route_not_found",
            "message": "Not found. Available endpoints: GET /, GET /health, POST /infer",
        })),
    )
}

/// ルーターを作成
pub fn create_router<B: Backend>(service: Arc<InferenceService<B>>, settings: &ServerSettings) -> Router {
    Router::new()
        .route("/", get(handlers::root::<B>))
        .route("/health", get(handlers::health::<B>))
        .route("/infer", post(handlers::infer::<B>))
        .fallback(handle_404)
        .layer(DefaultBodyLimit::max(settings.max_body_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}
