//! 推論サービスのHTTP境界
//!
//! `GET /`, `GET /health`, `POST /infer` を公開します。

mod api;
mod error;
pub mod handlers;

pub use api::create_router;

use burn::tensor::backend::Backend;
use std::sync::Arc;

use crate::model::ServerSettings;
use crate::service::InferenceService;

/// 初期化済みのサービスでHTTPサーバーを起動し、終了シグナルまで待つ
pub async fn run_server<B: Backend>(
    service: Arc<InferenceService<B>>,
    settings: ServerSettings,
) -> anyhow::Result<()> {
    let app = create_router(service.clone(), &settings);

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "listening");

    let draining = service.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            draining.begin_shutdown();
        })
        .await?;

    service.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
