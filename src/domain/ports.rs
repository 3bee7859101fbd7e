/// Port定義（Clean Architectureのインターフェース）
///
/// Domain層が外部実装に依存するための抽象trait。
/// Infrastructure層がこれらを実装し、Application層がDIで注入する。

use crate::domain::{
    config::{TrackbarState, TransformSnapshot},
    error::PipelineResult,
    types::{Frame, ProcessedFrame},
};

/// キャプチャポート: フレーム取得を抽象化
pub trait CapturePort: Send {
    /// 次のフレームを読み取る
    ///
    /// # Returns
    /// - `Ok(Frame)`: 取得成功（seqは未採番、呼び出し側が設定する）
    /// - `Err(PipelineError::EndOfStream)`: ストリーム終端
    /// - `Err(PipelineError::Device)`: デバイスエラー（ループ継続不能）
    fn read_frame(&mut self) -> PipelineResult<Frame>;

    /// キャプチャデバイスの情報を取得
    fn device_info(&self) -> DeviceInfo;
}

/// デバイス情報
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub width: u32,
    pub height: u32,
    pub name: String,
}

/// 変換ポート: 1フレーム分の変換チェーン実行を抽象化
///
/// ワーカースレッドから並行に呼ばれるため `&self` で受け、
/// 内部の共有資源（検出器等）は実装側で直列化する。
pub trait TransformPort: Send + Sync {
    /// 変換チェーンを適用する
    ///
    /// # Arguments
    /// - `frame`: 現在のフレーム
    /// - `prev`: 前フレーム（差分ステージ用）
    /// - `snapshot`: submit時点の設定スナップショット
    ///
    /// # Returns
    /// - `Ok(ProcessedFrame)`: 出力フレームと更新済み前フレーム
    /// - `Err(PipelineError::Stage)`: ステージ失敗（フレーム単位で回復）
    fn process(
        &self,
        frame: &Frame,
        prev: &Frame,
        snapshot: &TransformSnapshot,
    ) -> PipelineResult<ProcessedFrame>;
}

/// 入力イベント
///
/// Display側のキー入力から変換される制御イベント。
/// submitとsubmitの間にメインスレッドでのみ適用される。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// イベントなし
    None,
    /// 並列/逐次モード切り替え（スペース）
    ToggleParallel,
    /// 特徴マッチング ('a')
    ToggleFeatureMatch,
    /// Harrisコーナー検出 ('c')
    ToggleCorners,
    /// フレーム差分 ('d')
    ToggleDiff,
    /// Cannyエッジ ('e')
    ToggleEdges,
    /// 生フレーム表示 ('f')
    ToggleFrames,
    /// ガウシアン平滑化 ('g')
    ToggleGaussian,
    /// Laplacian勾配 ('l')
    ToggleLaplacian,
    /// メディアンフィルタ ('m')
    ToggleMedian,
    /// 空間的非最大抑制 ('n')
    ToggleNms,
    /// ORB特徴点描画 ('o')
    ToggleOrb,
    /// マッチ対象フレームのキャプチャ ('p')
    CaptureMatchFrame,
    /// Sobel勾配 ('s')
    ToggleSobel,
    /// 動画書き出し ('v')
    ToggleRecording,
    /// 終了（ESC）
    Terminate,
}

/// 表示ポート: ウィンドウ表示・トラックバー・キー入力・永続化を抽象化
pub trait DisplayPort {
    /// 出力フレームを診断オーバーレイ付きで表示する
    fn show(&mut self, frame: &Frame, overlay: &[String]) -> PipelineResult<()>;

    /// マッチ合成画像を別ウィンドウに表示する
    fn show_match(&mut self, image: &Frame) -> PipelineResult<()>;

    /// キャプチャ画像（1枚または左右連結）を別ウィンドウに表示する
    fn show_capture(&mut self, a: &Frame, b: Option<&Frame>) -> PipelineResult<()>;

    /// キー入力をポーリングして制御イベントに変換する
    fn poll_event(&mut self) -> PipelineResult<ControlEvent>;

    /// Cannyしきい値トラックバーを（未作成なら）作成する
    fn ensure_canny_trackbars(&mut self) -> PipelineResult<()>;

    /// ガウシアンσトラックバーを（未作成なら）作成する
    fn ensure_gaussian_trackbar(&mut self) -> PipelineResult<()>;

    /// トラックバーの現在値を読み出す
    fn trackbar_state(&self) -> TrackbarState;

    /// 動画出力に1フレーム書き込む
    fn write_video_frame(&mut self, frame: &Frame) -> PipelineResult<()>;

    /// 静止画を書き出す
    fn save_image(&mut self, path: &str, frame: &Frame) -> PipelineResult<()>;
}

/// 診断オーバーレイのテキストを組み立てるヘルパー
///
/// # Arguments
/// - `parallel`: 現在のスケジューリングモード
/// - `latency_ms`: 平滑化済みレイテンシ（ミリ秒）
/// - `interval_ms`: 平滑化済みフレーム間隔（ミリ秒）
pub fn diagnostics_overlay(parallel: bool, latency_ms: f64, interval_ms: f64) -> Vec<String> {
    vec![
        format!("threaded      :  {}", parallel),
        format!("latency        :  {:.1} ms", latency_ms),
        format!("frame interval :  {:.1} ms", interval_ms),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_overlay_format() {
        let lines = diagnostics_overlay(true, 12.34, 8.25);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("true"));
        assert!(lines[1].contains("12.3 ms"));
        assert!(lines[2].contains("8.2 ms") || lines[2].contains("8.3 ms"));
    }
}
