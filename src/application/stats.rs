//! 統計情報管理モジュール
//!
//! レイテンシとフレーム間隔の2つを指数平滑化で追跡し、表示サイクルごとに
//! オーバーレイへ、一定間隔でtracingへ出力します。

use std::time::{Duration, Instant};

/// 指数平滑化されたスカラー値
///
/// `value = c * value + (1 - c) * sample`。初回サンプルはそのまま採用。
#[derive(Debug, Clone, Copy)]
pub struct SmoothedValue {
    value: Option<f64>,
    smooth_coef: f64,
}

impl SmoothedValue {
    /// デフォルトの平滑化係数
    pub const DEFAULT_SMOOTH_COEF: f64 = 0.5;

    pub fn new(smooth_coef: f64) -> Self {
        Self {
            value: None,
            smooth_coef,
        }
    }

    /// サンプルを1つ取り込む
    pub fn update(&mut self, sample: f64) {
        self.value = Some(match self.value {
            None => sample,
            Some(v) => self.smooth_coef * v + (1.0 - self.smooth_coef) * sample,
        });
    }

    /// 現在の平滑化値（サンプル未投入なら0.0）
    pub fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SMOOTH_COEF)
    }
}

/// フレーム統計のアキュムレータ
///
/// 完了タスクごとに1回更新され、表示サイクルごとに1回読まれる。
/// プロセス終了後に残る永続状態はない。
#[derive(Debug)]
pub struct FrameStats {
    /// submitから解放までのレイテンシ（秒）
    latency: SmoothedValue,
    /// キャプチャ間隔（秒）
    interval: SmoothedValue,
    /// 直前のキャプチャ時刻
    last_capture: Option<Instant>,
    /// 解放済みフレーム数
    released_frames: u64,
    /// スキップされた（失敗）フレーム数
    skipped_frames: u64,
    /// 最後の統計出力時刻
    last_report: Instant,
    /// 統計出力間隔
    report_interval: Duration,
}

impl FrameStats {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            latency: SmoothedValue::default(),
            interval: SmoothedValue::default(),
            last_capture: None,
            released_frames: 0,
            skipped_frames: 0,
            last_report: Instant::now(),
            report_interval,
        }
    }

    /// キャプチャ1回を記録（フレーム間隔の更新）
    pub fn record_capture(&mut self, now: Instant) {
        if let Some(last) = self.last_capture {
            self.interval.update(now.duration_since(last).as_secs_f64());
        }
        self.last_capture = Some(now);
    }

    /// タスク解放1回を記録
    pub fn record_release(&mut self, latency: Duration) {
        self.latency.update(latency.as_secs_f64());
        self.released_frames += 1;
    }

    /// 失敗フレームのスキップを記録
    pub fn record_skip(&mut self) {
        self.skipped_frames += 1;
    }

    /// 平滑化済みレイテンシ（ミリ秒）
    pub fn latency_ms(&self) -> f64 {
        self.latency.value() * 1000.0
    }

    /// 平滑化済みフレーム間隔（ミリ秒）
    pub fn interval_ms(&self) -> f64 {
        self.interval.value() * 1000.0
    }

    /// 統計レポートを出力すべきか判定
    pub fn should_report(&self) -> bool {
        self.last_report.elapsed() >= self.report_interval
    }

    /// 統計レポートを出力してタイマーをリセット
    pub fn report_and_reset(&mut self) {
        tracing::info!(
            released = self.released_frames,
            skipped = self.skipped_frames,
            latency_ms = self.latency_ms(),
            interval_ms = self.interval_ms(),
            "Pipeline statistics"
        );
        self.last_report = Instant::now();
    }
}
