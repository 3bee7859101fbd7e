//! 設定管理
//!
//! TOML設定ファイルの読み込みと、フレームごとに固定されるスナップショット設定。
//!
//! # 設計方針
//! ワーカーが処理中に参照する設定は、submit時点で採られた不変の
//! `TransformSnapshot` のみ。入力イベントによる変更は `ActiveConfig` に
//! 対してメインスレッド上でだけ行われ、処理中のフレームには影響しない。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{Frame, PipelineError, PipelineResult};

/// アプリケーション設定のルート構造
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AppConfig {
    /// キャプチャ設定
    pub capture: CaptureConfig,
    /// パイプライン設定
    pub pipeline: PipelineConfig,
    /// 変換チェーンの初期状態
    pub transform: TransformConfig,
    /// 録画・静止画出力設定
    pub recording: RecordingConfig,
}

/// キャプチャ設定
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CaptureConfig {
    /// キャプチャソース
    ///
    /// デバイス番号（"0"等）またはファイルパス/URI。
    /// `:key=value` 形式のパラメータを付加できる（例: "0:size=640x480"）
    pub source: String,

    /// ソースオープンのリトライ回数
    ///
    /// デフォルト: 100回
    pub open_retry_attempts: u32,

    /// リトライ間隔（ミリ秒）
    ///
    /// デフォルト: 100ms
    pub open_retry_interval_ms: u64,
}

impl CaptureConfig {
    /// デフォルトのリトライ回数
    pub const DEFAULT_OPEN_RETRY_ATTEMPTS: u32 = 100;
    /// デフォルトのリトライ間隔（ミリ秒）
    pub const DEFAULT_OPEN_RETRY_INTERVAL_MS: u64 = 100;

    pub fn open_retry_interval(&self) -> Duration {
        Duration::from_millis(self.open_retry_interval_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: "0".to_string(),
            open_retry_attempts: Self::DEFAULT_OPEN_RETRY_ATTEMPTS,
            open_retry_interval_ms: Self::DEFAULT_OPEN_RETRY_INTERVAL_MS,
        }
    }
}

/// パイプライン設定
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineConfig {
    /// 並列モードで起動するか
    ///
    /// 実行中はスペースキーで逐次モードと切り替え可能
    pub parallel: bool,

    /// ワーカースレッド数
    ///
    /// 0 = 利用可能な論理CPU数に自動設定
    pub worker_threads: usize,

    /// 統計情報の出力間隔（秒）
    pub stats_interval_sec: u64,
}

impl PipelineConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_sec)
    }

    /// 実際に使用するワーカー数を解決
    pub fn resolve_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            worker_threads: 0,
            stats_interval_sec: 10,
        }
    }
}

/// 変換チェーンの初期トグル状態とパラメータ
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransformConfig {
    /// 生フレームを表示するか
    pub show_frames: bool,
    /// Cannyエッジを表示するか
    pub show_edges: bool,
    /// 前フレームとの差分表示
    pub diff_frames: bool,
    /// ガウシアン平滑化
    pub gaussian: bool,
    /// メディアンフィルタ
    pub median: bool,
    /// Sobel勾配
    pub sobel: bool,
    /// Laplacian勾配
    pub laplacian: bool,
    /// Harrisコーナー検出ステージ
    pub harris_corners: bool,
    /// ORB特徴点の描画ステージ
    pub orb_features: bool,
    /// 特徴マッチングステージ
    pub feature_match: bool,
    /// 空間的非最大抑制（NMS）
    pub nms: bool,

    /// Canny下側しきい値（トラックバー初期値、0-255）
    pub canny_lower: i32,
    /// Canny上側しきい値（トラックバー初期値、0-255）
    pub canny_upper: i32,
    /// ガウシアンσインデックス（σ = index * √2/2、0 = 恒等）
    pub sigma_index: i32,
    /// 特徴点抑制の許容率（SSC tolerance）
    pub corner_tolerance: f32,
    /// 表示する最良マッチ数の上限
    pub max_matches: usize,
    /// 構造化要素の直径（コーナー抑制・境界除外に使用、奇数）
    pub se_diameter: i32,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            show_frames: true,
            show_edges: false,
            diff_frames: false,
            gaussian: false,
            median: false,
            sobel: false,
            laplacian: false,
            harris_corners: false,
            orb_features: false,
            feature_match: false,
            nms: false,
            canny_lower: 100,
            canny_upper: 200,
            sigma_index: 0,
            corner_tolerance: 0.1,
            max_matches: 50,
            se_diameter: 7,
        }
    }
}

/// 録画・静止画出力設定
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RecordingConfig {
    /// 'v' トグルで書き出す動画ファイル
    pub video_path: String,
    /// 動画のフレームレート
    pub video_fps: f64,
    /// 'p' キャプチャの1枚目の出力先
    pub capture_image_path: String,
    /// 'p' キャプチャの2枚目の出力先
    pub capture_image_path_2: String,
    /// マッチ合成画像の出力先
    pub match_image_path: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            video_path: "vid_out.avi".to_string(),
            video_fps: 20.0,
            capture_image_path: "cap_out.jpg".to_string(),
            capture_image_path_2: "cap_out2.jpg".to_string(),
            match_image_path: "match.jpg".to_string(),
        }
    }
}

impl AppConfig {
    /// TOMLファイルから設定を読み込む
    pub fn from_file<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            PipelineError::Configuration(format!("Failed to parse config file: {}", e))
        })
    }

    /// デフォルト設定をTOMLファイルに書き出す
    pub fn write_default<P: AsRef<Path>>(path: P) -> PipelineResult<()> {
        let config = Self::default();
        let content = toml::to_string_pretty(&config).map_err(|e| {
            PipelineError::Configuration(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, content).map_err(|e| {
            PipelineError::Configuration(format!("Failed to write config file: {}", e))
        })
    }

    /// 設定の妥当性を検証
    pub fn validate(&self) -> PipelineResult<()> {
        if self.capture.open_retry_attempts == 0 {
            return Err(PipelineError::Configuration(
                "open_retry_attempts must be greater than 0".to_string(),
            ));
        }

        let t = &self.transform;
        if !(0..=255).contains(&t.canny_lower) || !(0..=255).contains(&t.canny_upper) {
            return Err(PipelineError::Configuration(
                "Canny thresholds must be in 0-255".to_string(),
            ));
        }
        if !(0..=13).contains(&t.sigma_index) {
            return Err(PipelineError::Configuration(
                "sigma_index must be in 0-13".to_string(),
            ));
        }
        if t.corner_tolerance <= 0.0 || t.corner_tolerance >= 1.0 {
            return Err(PipelineError::Configuration(
                "corner_tolerance must be in (0, 1)".to_string(),
            ));
        }
        if t.max_matches == 0 {
            return Err(PipelineError::Configuration(
                "max_matches must be greater than 0".to_string(),
            ));
        }
        if t.se_diameter < 3 || t.se_diameter % 2 == 0 {
            return Err(PipelineError::Configuration(
                "se_diameter must be an odd number >= 3".to_string(),
            ));
        }
        if !t.show_frames && !t.show_edges {
            return Err(PipelineError::Configuration(
                "at least one of show_frames / show_edges must be enabled".to_string(),
            ));
        }

        if self.pipeline.stats_interval_sec == 0 {
            return Err(PipelineError::Configuration(
                "stats_interval_sec must be greater than 0".to_string(),
            ));
        }

        if self.recording.video_fps <= 0.0 {
            return Err(PipelineError::Configuration(
                "video_fps must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// トラックバーの現在値
///
/// Display側のトラックバーが保持する値を submit 時にまとめて読み出したもの。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackbarState {
    pub canny_lower: i32,
    pub canny_upper: i32,
    pub sigma_index: i32,
}

impl Default for TrackbarState {
    fn default() -> Self {
        Self {
            canny_lower: 100,
            canny_upper: 200,
            sigma_index: 0,
        }
    }
}

/// 実行中に入力イベントで変化するトグル状態
///
/// メインスレッド（制御パス）のみが書き換える。ワーカーへは `snapshot()` で
/// 採った不変コピーだけが渡る。
#[derive(Debug, Clone)]
pub struct ActiveConfig {
    pub show_frames: bool,
    pub show_edges: bool,
    pub diff_frames: bool,
    pub gaussian: bool,
    pub median: bool,
    pub sobel: bool,
    pub laplacian: bool,
    pub harris_corners: bool,
    pub orb_features: bool,
    pub feature_match: bool,
    pub nms: bool,

    pub corner_tolerance: f32,
    pub max_matches: usize,
    pub se_diameter: i32,

    /// 'p' キャプチャで採られたマッチ対象フレーム（古い方）
    pub match_frame_a: Option<Arc<Frame>>,
    /// 'p' キャプチャで採られたマッチ対象フレーム（新しい方）
    pub match_frame_b: Option<Arc<Frame>>,
}

impl ActiveConfig {
    pub fn from_transform(t: &TransformConfig) -> Self {
        Self {
            show_frames: t.show_frames,
            show_edges: t.show_edges,
            diff_frames: t.diff_frames,
            gaussian: t.gaussian,
            median: t.median,
            sobel: t.sobel,
            laplacian: t.laplacian,
            harris_corners: t.harris_corners,
            orb_features: t.orb_features,
            feature_match: t.feature_match,
            nms: t.nms,
            corner_tolerance: t.corner_tolerance,
            max_matches: t.max_matches,
            se_diameter: t.se_diameter,
            match_frame_a: None,
            match_frame_b: None,
        }
    }

    /// 表示モード不変条件の正規化
    ///
    /// 「フレームなし・エッジなし」は許容されないため、両方が落ちた場合は
    /// フレーム表示を復帰させる。
    pub fn normalize_display_mode(&mut self) {
        if !self.show_frames && !self.show_edges {
            self.show_frames = true;
        }
    }

    /// マッチ対象フレームを回転登録する
    ///
    /// 1枚目 → frame_a、2枚目 → frame_b、以降は b を a にずらして新フレームを b に。
    /// 戻り値は何枚目のキャプチャとして登録されたか（1 or 2）。
    pub fn push_match_frame(&mut self, frame: Arc<Frame>) -> usize {
        match (&self.match_frame_a, &self.match_frame_b) {
            (None, _) => {
                self.match_frame_a = Some(frame);
                1
            }
            (Some(_), None) => {
                self.match_frame_b = Some(frame);
                2
            }
            (Some(_), Some(_)) => {
                self.match_frame_a = self.match_frame_b.take();
                self.match_frame_b = Some(frame);
                2
            }
        }
    }

    /// submit時点の不変スナップショットを作成
    pub fn snapshot(&self, trackbars: &TrackbarState) -> TransformSnapshot {
        let match_frames = match (&self.match_frame_a, &self.match_frame_b) {
            (Some(a), Some(b)) => Some((Arc::clone(a), Arc::clone(b))),
            _ => None,
        };

        TransformSnapshot {
            show_frames: self.show_frames,
            show_edges: self.show_edges,
            diff_frames: self.diff_frames,
            gaussian: self.gaussian,
            median: self.median,
            sobel: self.sobel,
            laplacian: self.laplacian,
            harris_corners: self.harris_corners,
            orb_features: self.orb_features,
            feature_match: self.feature_match,
            nms: self.nms,
            canny_lower: trackbars.canny_lower,
            canny_upper: trackbars.canny_upper,
            sigma_index: trackbars.sigma_index,
            corner_tolerance: self.corner_tolerance,
            max_matches: self.max_matches,
            se_diameter: self.se_diameter,
            match_frames,
        }
    }
}

/// フレーム1枚に紐づく不変の設定スナップショット
///
/// submit後のトグル変更は、このスナップショットを持つ処理中フレームには
/// 一切影響しない。
#[derive(Debug, Clone)]
pub struct TransformSnapshot {
    pub show_frames: bool,
    pub show_edges: bool,
    pub diff_frames: bool,
    pub gaussian: bool,
    pub median: bool,
    pub sobel: bool,
    pub laplacian: bool,
    pub harris_corners: bool,
    pub orb_features: bool,
    pub feature_match: bool,
    pub nms: bool,

    pub canny_lower: i32,
    pub canny_upper: i32,
    pub sigma_index: i32,
    pub corner_tolerance: f32,
    pub max_matches: usize,
    pub se_diameter: i32,

    /// 外部で採られたマッチ対象フレームのペア（A = 古い方）
    pub match_frames: Option<(Arc<Frame>, Arc<Frame>)>,
}

impl TransformSnapshot {
    /// すべてのステージが無効なスナップショット（テスト・初期状態用）
    pub fn all_disabled() -> Self {
        let active = ActiveConfig::from_transform(&TransformConfig::default());
        active.snapshot(&TrackbarState::default())
    }

    /// 有効なステージが1つもないか（表示モードは生フレームのまま）
    pub fn is_passthrough(&self) -> bool {
        !self.show_edges
            && !self.diff_frames
            && !self.gaussian
            && !self.median
            && !self.sobel
            && !self.laplacian
            && !self.harris_corners
            && !self.orb_features
            && !self.feature_match
    }
}
