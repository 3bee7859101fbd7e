/// エラー型定義
///
/// Domain層の統一エラー型。thiserrorを使用して型安全なエラー処理を提供します。
///
/// # 設計方針
/// - unwrap()の使用を禁止し、明示的なエラーハンドリングを強制
/// - ステージ単位の失敗（Stage）とソース単位の失敗（EndOfStream/Device）を型で区別
/// - 空のキーポイント集合や0件マッチは「縮退した正常結果」でありエラーにしない

use thiserror::Error;

/// Domain層の統一エラー型
#[derive(Error, Debug)]
pub enum PipelineError {
    /// キャプチャソースが開けない（リトライ上限到達、起動不能）
    #[error("Capture source unavailable: {0}")]
    CaptureUnavailable(String),

    /// ストリーム終端（ファイル再生の終了など）
    ///
    /// キャプチャループにとっては終了条件であり、異常系ではない。
    #[error("End of stream")]
    EndOfStream,

    /// キャプチャデバイスのエラー（切断等、ループ継続不能）
    #[error("Capture device error: {0}")]
    Device(String),

    /// 変換ステージの失敗（該当フレームのみスキップして継続）
    #[error("Transform stage failed: {0}")]
    Stage(String),

    /// 表示・出力側のエラー
    #[error("Display error: {0}")]
    Display(String),

    /// 設定関連のエラー
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// パイプラインが満杯（pending がプールサイズに達している）
    #[error("Pipeline is at capacity")]
    PipelineFull,
}

impl PipelineError {
    /// フレーム単位で回復可能なエラーか
    ///
    /// trueの場合、該当フレームをスキップしてパイプラインは継続する。
    pub fn is_frame_local(&self) -> bool {
        matches!(self, Self::Stage(_) | Self::PipelineFull)
    }
}

/// Domain層の統一Result型
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_local_classification() {
        assert!(PipelineError::Stage("x".to_string()).is_frame_local());
        assert!(PipelineError::PipelineFull.is_frame_local());
        assert!(!PipelineError::EndOfStream.is_frame_local());
        assert!(!PipelineError::Device("gone".to_string()).is_frame_local());
        assert!(!PipelineError::CaptureUnavailable("timeout".to_string()).is_frame_local());
    }

    #[test]
    fn test_error_display() {
        let e = PipelineError::Stage("canny failed".to_string());
        assert_eq!(e.to_string(), "Transform stage failed: canny failed");
    }
}
