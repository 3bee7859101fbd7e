mod application;
mod domain;
mod infrastructure;
mod logging;

use crate::application::PipelineRunner;
use crate::domain::config::AppConfig;
use crate::infrastructure::{HighguiDisplay, OpenCvCapture, TransformChain};
use crate::logging::init_logging;
use std::sync::Arc;

fn main() {
    let _guard = init_logging("info", false, None);
    // 注意: _guardはmain終了まで保持する必要がある

    tracing::info!("framesmith starting...");

    match run() {
        Ok(_) => {
            tracing::info!("framesmith terminated gracefully.");
        }
        Err(e) => {
            tracing::error!("Fatal error: {:?}", e);
            std::process::exit(1);
        }
    }
}

/// アプリケーションのメイン処理
fn run() -> anyhow::Result<()> {
    // 設定ファイルの読み込み（存在しない場合はデフォルト設定を使用）
    let mut config = match AppConfig::from_file("config.toml") {
        Ok(config) => {
            tracing::info!("Loaded configuration from config.toml");
            config
        }
        Err(e) => {
            tracing::warn!("Failed to load config.toml: {:?}, using defaults", e);
            AppConfig::default()
        }
    };

    // 位置引数でキャプチャソースを上書きできる
    if let Some(source) = std::env::args().nth(1) {
        tracing::info!(source = %source, "Capture source overridden by CLI argument");
        config.capture.source = source;
    }

    config.validate()?;
    tracing::info!("Configuration validated successfully");
    tracing::info!(
        source = %config.capture.source,
        parallel = config.pipeline.parallel,
        workers = config.pipeline.resolve_worker_threads(),
        "Pipeline configuration"
    );

    tracing::info!("Opening capture source...");
    let capture = OpenCvCapture::open(&config.capture)?;

    let display = HighguiDisplay::new(&config)?;
    let transform = Arc::new(TransformChain::new()?);

    // パイプラインの起動（ブロッキング）
    let runner = PipelineRunner::new(capture, display, transform, &config);
    runner.run()?;

    Ok(())
}
