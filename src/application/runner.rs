//! パイプライン制御モジュール
//!
//! キャプチャ → スケジューラ → 表示のメインループを制御します。
//! 解放は常に提出順で行われ、入力イベントによる設定変更はsubmitの合間に
//! メインスレッド上でのみ適用されます。

use crate::application::{scheduler::FrameScheduler, stats::FrameStats};
use crate::domain::{
    config::{ActiveConfig, AppConfig, RecordingConfig},
    error::{PipelineError, PipelineResult},
    ports::{diagnostics_overlay, CapturePort, ControlEvent, DisplayPort, TransformPort},
    types::{Frame, ProcessedFrame},
};
use std::sync::Arc;
use std::time::Instant;

/// パイプライン実行コンテキスト
pub struct PipelineRunner<C, D, P>
where
    C: CapturePort,
    D: DisplayPort,
    P: TransformPort + 'static,
{
    capture: C,
    display: D,
    scheduler: FrameScheduler<P>,
    active: ActiveConfig,
    stats: FrameStats,
    recording: RecordingConfig,
    /// 'v' トグルの現在状態
    recording_enabled: bool,
    /// マッチ合成画像をこのトグル周期で既に表示したか
    match_shown: bool,
    /// 'p' キャプチャ用の直近の生フレーム
    last_raw: Option<Arc<Frame>>,
    /// キャプチャ順のシーケンス採番
    seq: u64,
}

impl<C, D, P> PipelineRunner<C, D, P>
where
    C: CapturePort,
    D: DisplayPort,
    P: TransformPort + 'static,
{
    /// 新しいPipelineRunnerを作成
    pub fn new(capture: C, display: D, transform: Arc<P>, config: &AppConfig) -> Self {
        let pool_size = config.pipeline.resolve_worker_threads();
        Self {
            capture,
            display,
            scheduler: FrameScheduler::new(transform, pool_size, config.pipeline.parallel),
            active: ActiveConfig::from_transform(&config.transform),
            stats: FrameStats::new(config.pipeline.stats_interval()),
            recording: config.recording.clone(),
            recording_enabled: false,
            match_shown: false,
            last_raw: None,
            seq: 0,
        }
    }

    /// パイプラインを起動（ブロッキング）
    ///
    /// # Returns
    /// - `Ok(())`: 終了イベントまたはストリーム終端による正常終了
    /// - `Err(PipelineError)`: ソース側の致命的エラー
    pub fn run(mut self) -> PipelineResult<()> {
        // 最初のフレームで前フレームを初期化する
        let first = self.capture.read_frame()?;
        let info = self.capture.device_info();
        tracing::info!(
            width = info.width,
            height = info.height,
            name = %info.name,
            "Capture source opened"
        );

        let mut prev = first;

        loop {
            // 完了済みタスクを提出順に解放する
            while let Some(outcome) = self.scheduler.next_ready() {
                match outcome.result {
                    Ok(processed) => {
                        self.stats.record_release(outcome.submitted_at.elapsed());
                        prev = self.release(processed)?;
                    }
                    Err(e) if e.is_frame_local() => {
                        // 該当フレームのみスキップし、FIFOはそのまま前進する
                        self.stats.record_skip();
                        tracing::warn!("Dropping failed frame: {}", e);
                    }
                    Err(e) => return Err(e),
                }

                if self.stats.should_report() {
                    self.stats.report_and_reset();
                }
            }

            // pendingに空きがあれば次のフレームを取り込む
            if self.scheduler.has_capacity() {
                let mut frame = match self.capture.read_frame() {
                    Ok(frame) => frame,
                    Err(PipelineError::EndOfStream) => {
                        // 処理中のタスクは待たずに破棄する（フラッシュなし）
                        tracing::info!("End of stream, terminating capture loop");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };

                let now = Instant::now();
                self.stats.record_capture(now);
                self.seq += 1;
                frame.seq = self.seq;
                self.last_raw = Some(Arc::new(frame.clone()));

                let snapshot = self.active.snapshot(&self.display.trackbar_state());
                self.scheduler.submit(frame, prev.clone(), snapshot, now)?;
            }

            // 入力イベントはsubmitの合間に適用する
            match self.display.poll_event()? {
                ControlEvent::Terminate => {
                    tracing::info!("Terminate requested");
                    return Ok(());
                }
                ControlEvent::None => {}
                event => self.apply_event(event)?,
            }
        }
    }

    /// 解放された1フレームを表示・記録し、次の前フレームを返す
    fn release(&mut self, processed: ProcessedFrame) -> PipelineResult<Frame> {
        let ProcessedFrame {
            output,
            prev,
            match_view,
        } = processed;

        // マッチ合成画像はトグル周期ごとに1回だけ表示・保存する
        if self.active.feature_match && !self.match_shown {
            if let Some(view) = &match_view {
                self.display.show_match(&view.image)?;
                self.display
                    .save_image(&self.recording.match_image_path, &view.image)?;
                tracing::info!(
                    matches = view.match_count,
                    path = %self.recording.match_image_path,
                    "Match composite written"
                );
                self.match_shown = true;
            }
        }

        if self.recording_enabled {
            self.display.write_video_frame(&output)?;
        }

        let overlay = diagnostics_overlay(
            self.scheduler.is_parallel(),
            self.stats.latency_ms(),
            self.stats.interval_ms(),
        );
        self.display.show(&output, &overlay)?;

        Ok(prev)
    }

    /// 制御イベントをActiveConfigに適用する
    fn apply_event(&mut self, event: ControlEvent) -> PipelineResult<()> {
        match event {
            ControlEvent::ToggleParallel => {
                let parallel = !self.scheduler.is_parallel();
                self.scheduler.set_parallel(parallel);
                tracing::info!(parallel, "Scheduling mode switched");
            }
            ControlEvent::ToggleFeatureMatch => {
                self.active.feature_match = !self.active.feature_match;
                if self.active.feature_match {
                    self.match_shown = false;
                }
            }
            ControlEvent::ToggleCorners => {
                self.active.harris_corners = !self.active.harris_corners;
                // コーナー検出とORB描画は排他
                if self.active.harris_corners {
                    self.active.orb_features = false;
                }
            }
            ControlEvent::ToggleDiff => {
                self.active.diff_frames = !self.active.diff_frames;
            }
            ControlEvent::ToggleEdges => {
                self.active.show_edges = !self.active.show_edges;
                if self.active.show_edges {
                    self.display.ensure_canny_trackbars()?;
                }
                self.active.normalize_display_mode();
            }
            ControlEvent::ToggleFrames => {
                self.active.show_frames = !self.active.show_frames;
                self.active.normalize_display_mode();
            }
            ControlEvent::ToggleGaussian => {
                self.active.gaussian = !self.active.gaussian;
                if self.active.gaussian {
                    self.display.ensure_gaussian_trackbar()?;
                }
            }
            ControlEvent::ToggleLaplacian => {
                self.active.laplacian = !self.active.laplacian;
            }
            ControlEvent::ToggleMedian => {
                self.active.median = !self.active.median;
            }
            ControlEvent::ToggleNms => {
                self.active.nms = !self.active.nms;
            }
            ControlEvent::ToggleOrb => {
                self.active.orb_features = !self.active.orb_features;
            }
            ControlEvent::CaptureMatchFrame => self.capture_match_frame()?,
            ControlEvent::ToggleSobel => {
                self.active.sobel = !self.active.sobel;
            }
            ControlEvent::ToggleRecording => {
                self.recording_enabled = !self.recording_enabled;
                if self.recording_enabled {
                    tracing::info!(path = %self.recording.video_path, "Video recording enabled");
                } else {
                    tracing::info!("Video recording disabled");
                }
            }
            ControlEvent::None | ControlEvent::Terminate => {}
        }
        Ok(())
    }

    /// 直近の生フレームをマッチ対象として登録する（'p'）
    fn capture_match_frame(&mut self) -> PipelineResult<()> {
        let Some(raw) = self.last_raw.clone() else {
            // まだ1枚もキャプチャしていない
            return Ok(());
        };

        self.active.push_match_frame(raw);

        let a = self.active.match_frame_a.clone();
        let b = self.active.match_frame_b.clone();
        if let Some(a) = &a {
            self.display.show_capture(a, b.as_deref())?;
            self.display.save_image(&self.recording.capture_image_path, a)?;
        }
        if let Some(b) = &b {
            self.display
                .save_image(&self.recording.capture_image_path_2, b)?;
        }
        Ok(())
    }
}
