//! 推論サービスの起動エントリポイント

use anyhow::Context;
use burn::tensor::backend::Backend;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use succulent_identifier_lib::model::AppConfig;
use succulent_identifier_lib::server::run_server;
use succulent_identifier_lib::{DeviceType, InferenceService};

#[derive(Parser, Debug)]
#[command(name = "succulent_identifier", version, about = "Succulent species classifier inference service")]
struct Cli {
    /// 設定ファイル（存在しなければデフォルト設定）
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "succulent_identifier=info,succulent_identifier_lib=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default(&config_path);
    config.apply_env_overrides();
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate().context("invalid configuration")?;
    config.log_summary();

    match config.device_type {
        DeviceType::Cpu => serve::<NdArray<f32>>(config, NdArrayDevice::Cpu).await,
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            serve::<burn_wgpu::Wgpu>(config, burn_wgpu::WgpuDevice::default()).await
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => anyhow::bail!("this build does not include the wgpu backend; set device_type to \"cpu\""),
    }
}

async fn serve<B: Backend>(config: AppConfig, device: B::Device) -> anyhow::Result<()> {
    let service = Arc::new(InferenceService::<B>::new(
        config.model.clone(),
        device,
        config.device_type.to_string(),
    ));

    // 起動時の読み込みは一度だけ。失敗したら待ち受けずに終了する
    let initializing = service.clone();
    tokio::task::spawn_blocking(move || initializing.initialize())
        .await
        .context("initialization task panicked")?
        .context("failed to initialize inference service")?;

    run_server(service, config.server).await
}
