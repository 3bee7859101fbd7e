//! 変換チェーン実行モジュール
//!
//! 1フレームに対して固定順のステージ列を適用する。各ステージは
//! スナップショットのトグルで有効/無効が決まり、順序は常に一定:
//!
//! 1. ガウシアン平滑化（+ min-max正規化）
//! 2. 表示モード合成（Cannyエッジ単独 / エッジ+フレーム / 生フレーム）
//! 3. 前フレーム差分（差分前の画像が次の前フレームになる）
//! 4. 特徴マッチング合成画像の生成
//! 5. メディアンフィルタ
//! 6. Sobel勾配
//! 7. Laplacian勾配
//! 8. Harrisコーナー / ORB特徴点の注釈描画
//!
//! ワーカースレッドから並行に呼ばれるため共有資源は内部で直列化する。

use opencv::{core, imgproc, prelude::*};

use crate::domain::{
    config::TransformSnapshot,
    error::{PipelineError, PipelineResult},
    ports::TransformPort,
    types::{Frame, MatchView, ProcessedFrame},
};
use crate::infrastructure::{
    convert::{frame_to_mat, mat_to_frame},
    features::FeatureMatchEngine,
    harris::HarrisCornerEngine,
};

/// σインデックスから実σを計算する係数（√2/2）
const SQRT2_OVER_2: f64 = std::f64::consts::SQRT_2 / 2.0;

/// エッジ+フレーム合成時の固定Cannyしきい値
const OVERLAY_CANNY_LOWER: f64 = 100.0;
const OVERLAY_CANNY_UPPER: f64 = 200.0;

/// σからガウシアンカーネル幅を計算する
///
/// OpenCVのσ既定式の逆算。偶数になった場合は1足して奇数化する。
pub fn gaussian_kernel_size(sigma: f64) -> i32 {
    let mut ksize = ((((sigma - 0.8) / 0.3) + 1.0) / 0.5 + 1.0).round() as i32;
    if ksize % 2 == 0 {
        ksize += 1;
    }
    ksize
}

/// Cannyしきい値の実効値を計算する
///
/// 両方0なら上側を1に、下側が上側を超えていたら上側-1に丸める。
pub fn effective_canny_thresholds(lower: i32, upper: i32) -> (i32, i32) {
    let mut lower = lower;
    let mut upper = upper;
    if lower == 0 && upper == 0 {
        upper = 1;
    }
    if lower > upper {
        lower = upper - 1;
    }
    (lower, upper)
}

fn stage_err(stage: &str, e: opencv::Error) -> PipelineError {
    PipelineError::Stage(format!("{} failed: {}", stage, e))
}

/// 固定順ステージ列の実行器
pub struct TransformChain {
    harris: HarrisCornerEngine,
    features: FeatureMatchEngine,
}

impl TransformChain {
    /// 変換チェーンを構築する
    ///
    /// ORB・BFMatcherは遅延生成せず、ここで一度だけ生成する。
    pub fn new() -> PipelineResult<Self> {
        Ok(Self {
            harris: HarrisCornerEngine::new(),
            features: FeatureMatchEngine::new()?,
        })
    }

    /// ガウシアン平滑化ステージ
    ///
    /// σインデックス0は恒等。結果は32F中間を経てmin-maxで8bitに正規化する。
    fn gaussian_stage(&self, src: &Mat, sigma_index: i32) -> PipelineResult<Mat> {
        if sigma_index == 0 {
            return Ok(src.clone());
        }

        let sigma = sigma_index as f64 * SQRT2_OVER_2;
        let ksize = gaussian_kernel_size(sigma);

        let kernel = imgproc::get_gaussian_kernel(ksize, sigma, core::CV_64F)
            .map_err(|e| stage_err("gaussian kernel", e))?;

        let mut filtered = Mat::default();
        imgproc::sep_filter_2d(
            src,
            &mut filtered,
            core::CV_32F,
            &kernel,
            &kernel,
            core::Point::new(-1, -1),
            0.0,
            core::BORDER_REFLECT_101,
        )
        .map_err(|e| stage_err("sepFilter2D", e))?;

        // min-maxは全チャンネル横断で取る
        let flat = filtered
            .reshape(1, 0)
            .map_err(|e| stage_err("gaussian reshape", e))?;
        let (mut min_val, mut max_val) = (0.0f64, 0.0f64);
        core::min_max_loc(
            &flat,
            Some(&mut min_val),
            Some(&mut max_val),
            None,
            None,
            &core::no_array(),
        )
        .map_err(|e| stage_err("minMaxLoc", e))?;

        let mut rescaled = Mat::default();
        if max_val > min_val {
            let alpha = 255.0 / (max_val - min_val);
            filtered
                .convert_to(&mut rescaled, core::CV_8U, alpha, -min_val * alpha)
                .map_err(|e| stage_err("gaussian rescale", e))?;
        } else {
            filtered
                .convert_to(&mut rescaled, core::CV_8U, 1.0, 0.0)
                .map_err(|e| stage_err("gaussian convert", e))?;
        }
        Ok(rescaled)
    }

    /// 表示モード合成ステージ
    fn display_stage(&self, src: &Mat, snapshot: &TransformSnapshot) -> PipelineResult<Mat> {
        if snapshot.show_edges && !snapshot.show_frames {
            // エッジ単独表示
            let (lower, upper) =
                effective_canny_thresholds(snapshot.canny_lower, snapshot.canny_upper);
            let mut edges = Mat::default();
            imgproc::canny(src, &mut edges, upper as f64, lower as f64, 3, false)
                .map_err(|e| stage_err("canny", e))?;

            let mut bgr = Mat::default();
            imgproc::cvt_color(&edges, &mut bgr, imgproc::COLOR_GRAY2BGR, 0)
                .map_err(|e| stage_err("edges GRAY2BGR", e))?;
            Ok(bgr)
        } else if snapshot.show_edges && snapshot.show_frames {
            // エッジをフレームに重畳（しきい値は固定）
            let mut edges = Mat::default();
            imgproc::canny(
                src,
                &mut edges,
                OVERLAY_CANNY_LOWER,
                OVERLAY_CANNY_UPPER,
                3,
                false,
            )
            .map_err(|e| stage_err("canny", e))?;

            let mut edges_bgr = Mat::default();
            imgproc::cvt_color(&edges, &mut edges_bgr, imgproc::COLOR_GRAY2BGR, 0)
                .map_err(|e| stage_err("edges GRAY2BGR", e))?;

            let mut combined = Mat::default();
            core::add(src, &edges_bgr, &mut combined, &core::no_array(), -1)
                .map_err(|e| stage_err("edge overlay", e))?;
            Ok(combined)
        } else {
            Ok(src.clone())
        }
    }

    /// 特徴マッチングステージ
    ///
    /// 対象フレームのペアが揃っていない場合はNone。
    fn match_stage(&self, snapshot: &TransformSnapshot) -> PipelineResult<Option<MatchView>> {
        if !snapshot.feature_match {
            return Ok(None);
        }
        let Some((a, b)) = &snapshot.match_frames else {
            return Ok(None);
        };

        let view = self.features.match_frames(
            a,
            b,
            snapshot.nms,
            snapshot.corner_tolerance,
            snapshot.max_matches,
        )?;
        Ok(Some(view))
    }
}

impl TransformPort for TransformChain {
    fn process(
        &self,
        frame: &Frame,
        prev: &Frame,
        snapshot: &TransformSnapshot,
    ) -> PipelineResult<ProcessedFrame> {
        let mut current = frame_to_mat(frame)?;

        if snapshot.gaussian {
            current = self.gaussian_stage(&current, snapshot.sigma_index)?;
        }

        current = self.display_stage(&current, snapshot)?;

        // 差分前の画像が次フレームの比較基準になる
        let new_prev = mat_to_frame(&current, frame.seq)?;

        if snapshot.diff_frames {
            let prev_mat = frame_to_mat(prev)?;
            let mut diff = Mat::default();
            core::absdiff(&current, &prev_mat, &mut diff).map_err(|e| stage_err("absdiff", e))?;
            current = diff;
        }

        let match_view = self.match_stage(snapshot)?;

        if snapshot.median {
            let mut filtered = Mat::default();
            imgproc::median_blur(&current, &mut filtered, 5)
                .map_err(|e| stage_err("medianBlur", e))?;
            current = filtered;
        }

        if snapshot.sobel {
            let mut grad = Mat::default();
            imgproc::sobel(
                &current,
                &mut grad,
                core::CV_8U,
                1,
                0,
                5,
                1.0,
                0.0,
                core::BORDER_DEFAULT,
            )
            .map_err(|e| stage_err("sobel", e))?;
            current = grad;
        }

        if snapshot.laplacian {
            let mut grad = Mat::default();
            imgproc::laplacian(
                &current,
                &mut grad,
                core::CV_8U,
                1,
                1.0,
                0.0,
                core::BORDER_DEFAULT,
            )
            .map_err(|e| stage_err("laplacian", e))?;
            current = grad;
        }

        if snapshot.harris_corners {
            current = self
                .harris
                .annotate(&current, snapshot.nms, snapshot.se_diameter)?;
        }

        if snapshot.orb_features {
            current = self
                .features
                .annotate(&current, snapshot.nms, snapshot.corner_tolerance)?;
        }

        Ok(ProcessedFrame {
            output: mat_to_frame(&current, frame.seq)?,
            prev: new_prev,
            match_view,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::TrackbarState;
    use crate::domain::config::{ActiveConfig, TransformConfig};

    fn chain() -> TransformChain {
        TransformChain::new().expect("chain")
    }

    fn snapshot_with(f: impl FnOnce(&mut ActiveConfig)) -> TransformSnapshot {
        let mut active = ActiveConfig::from_transform(&TransformConfig::default());
        f(&mut active);
        active.snapshot(&TrackbarState::default())
    }

    fn gradient_frame(seq: u64, width: u32, height: u32) -> Frame {
        let mut frame = Frame::filled(seq, width, height, [0, 0, 0]);
        for y in 0..height {
            for x in 0..width {
                let i = ((y * width + x) * 3) as usize;
                let v = ((x * 255) / width.max(1)) as u8;
                frame.data[i] = v;
                frame.data[i + 1] = v;
                frame.data[i + 2] = v;
            }
        }
        frame
    }

    #[test]
    fn test_gaussian_kernel_size_is_odd() {
        for index in 1..=13 {
            let sigma = index as f64 * SQRT2_OVER_2;
            let ksize = gaussian_kernel_size(sigma);
            assert_eq!(ksize % 2, 1, "index {} gave even ksize {}", index, ksize);
            assert!(ksize >= 3);
        }
    }

    #[test]
    fn test_effective_canny_thresholds() {
        assert_eq!(effective_canny_thresholds(0, 0), (0, 1));
        assert_eq!(effective_canny_thresholds(200, 100), (99, 100));
        assert_eq!(effective_canny_thresholds(50, 150), (50, 150));
    }

    #[test]
    fn test_passthrough_returns_input_unchanged() {
        let chain = chain();
        let frame = gradient_frame(1, 32, 24);
        let prev = Frame::filled(0, 32, 24, [0, 0, 0]);
        let snap = snapshot_with(|_| {});
        assert!(snap.is_passthrough());

        let out = chain.process(&frame, &prev, &snap).expect("process");
        assert_eq!(out.output.data, frame.data);
        assert_eq!(out.prev.data, frame.data);
        assert!(out.match_view.is_none());
    }

    #[test]
    fn test_diff_of_identical_frames_is_black() {
        let chain = chain();
        let frame = gradient_frame(2, 32, 24);
        let snap = snapshot_with(|a| a.diff_frames = true);

        let out = chain.process(&frame, &frame, &snap).expect("process");
        assert!(out.output.data.iter().all(|&b| b == 0));
        // 差分前の画像が前フレームとして返る
        assert_eq!(out.prev.data, frame.data);
    }

    #[test]
    fn test_gaussian_identity_at_sigma_zero() {
        let chain = chain();
        let frame = gradient_frame(3, 16, 16);
        let prev = frame.clone();
        let snap = snapshot_with(|a| a.gaussian = true);
        assert_eq!(snap.sigma_index, 0);

        let out = chain.process(&frame, &prev, &snap).expect("process");
        assert_eq!(out.output.data, frame.data);
    }

    #[test]
    fn test_gaussian_smooths_and_stays_8bit() {
        let chain = chain();
        let mut frame = Frame::filled(4, 16, 16, [0, 0, 0]);
        // 中央に白点
        let center = ((8 * 16 + 8) * 3) as usize;
        frame.data[center] = 255;
        frame.data[center + 1] = 255;
        frame.data[center + 2] = 255;

        let prev = frame.clone();
        let mut snap = snapshot_with(|a| a.gaussian = true);
        snap.sigma_index = 4;

        let out = chain.process(&frame, &prev, &snap).expect("process");
        assert_eq!(out.output.data.len(), frame.data.len());
        // 点光源が広がり、中心の隣も非ゼロになる
        let neighbor = ((8 * 16 + 9) * 3) as usize;
        assert!(out.output.data[neighbor] > 0);
    }

    #[test]
    fn test_edges_alone_output_is_binary() {
        let chain = chain();
        let frame = gradient_frame(5, 64, 48);
        let prev = frame.clone();
        let snap = snapshot_with(|a| {
            a.show_frames = false;
            a.show_edges = true;
        });

        let out = chain.process(&frame, &prev, &snap).expect("process");
        assert!(out.output.data.iter().all(|&b| b == 0 || b == 255));
    }

    #[test]
    fn test_match_view_requires_frame_pair() {
        let chain = chain();
        let frame = gradient_frame(6, 32, 24);
        let prev = frame.clone();
        let snap = snapshot_with(|a| a.feature_match = true);
        assert!(snap.match_frames.is_none());

        let out = chain.process(&frame, &prev, &snap).expect("process");
        assert!(out.match_view.is_none());
    }

    #[test]
    fn test_stage_order_is_stable_for_combined_toggles() {
        let chain = chain();
        let frame = gradient_frame(7, 64, 48);
        let prev = gradient_frame(6, 64, 48);
        let snap = snapshot_with(|a| {
            a.gaussian = true;
            a.median = true;
            a.sobel = true;
            a.laplacian = true;
        });

        // 複合トグルでも1パスで完走し、サイズが保存される
        let out = chain.process(&frame, &prev, &snap).expect("process");
        assert_eq!(out.output.width, frame.width);
        assert_eq!(out.output.height, frame.height);
    }
}
