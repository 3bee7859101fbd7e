//! ログ基盤
//!
//! tracingによる統一的なログ出力。標準出力またはtracing-appenderによる
//! 非同期ファイル出力を選択できる。
//!
//! `RUST_LOG` 環境変数が設定されていればそちらが優先される。

use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ログシステムを初期化
///
/// # Arguments
/// - `log_level`: デフォルトのログレベル（"info", "debug"等）
/// - `json_format`: JSON形式で出力するか
/// - `log_dir`: ログファイル出力先（None = 標準出力）
///
/// # Returns
/// ファイル出力時は `Some(WorkerGuard)`。main終了まで保持する必要がある
/// （Drop時にログスレッドがフラッシュされる）。
pub fn init_logging(
    log_level: &str,
    json_format: bool,
    log_dir: Option<PathBuf>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match log_dir {
        Some(dir) => {
            if std::fs::create_dir_all(&dir).is_err() {
                return None;
            }

            let file_appender = tracing_appender::rolling::daily(dir, "framesmith.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let subscriber = tracing_subscriber::registry().with(env_filter);
            let result = if json_format {
                subscriber
                    .with(fmt::layer().json().with_writer(non_blocking))
                    .try_init()
            } else {
                subscriber
                    .with(
                        fmt::layer()
                            .with_target(true)
                            .with_thread_ids(true)
                            .with_ansi(false) // ファイル出力時はANSIエスケープ無効
                            .with_writer(non_blocking),
                    )
                    .try_init()
            };

            if result.is_err() {
                return None;
            }
            tracing::info!(level = log_level, "Logging initialized (async file)");
            Some(guard)
        }
        None => {
            let subscriber = tracing_subscriber::registry().with(env_filter);
            let result = if json_format {
                subscriber.with(fmt::layer().json()).try_init()
            } else {
                subscriber
                    .with(fmt::layer().with_target(true).with_thread_ids(true))
                    .try_init()
            };

            if result.is_ok() {
                tracing::info!(level = log_level, "Logging initialized (stdout)");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_stdout() {
        // 他のテストで既に初期化済みでもエラーにならないこと
        let guard = init_logging("debug", false, None);
        assert!(guard.is_none());

        tracing::info!("Test log message");
    }

    #[test]
    fn test_init_logging_file_creates_directory() {
        let temp_dir = std::env::temp_dir().join("framesmith_test_logs");

        let guard = init_logging("info", false, Some(temp_dir.clone()));
        if guard.is_none() {
            // グローバルsubscriberが設定済みの場合はスキップ
            return;
        }

        assert!(temp_dir.exists());
        tracing::info!("Test file log");
        drop(guard);

        std::fs::remove_dir_all(temp_dir).ok();
    }
}
