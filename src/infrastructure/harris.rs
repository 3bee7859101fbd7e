//! Harrisコーナー検出エンジン
//!
//! Harris応答 → 弱コーナー除去 → （任意で）形態学的NMS → 連結成分の重心 →
//! サブピクセル精緻化 → 近傍記述子抽出、の一連を実行する。
//! 検出結果は赤色マーカーとして入力フレームに描画される。

use opencv::{core, features2d, imgproc, prelude::*};

use crate::domain::{
    error::{PipelineError, PipelineResult},
    types::{Descriptor, Keypoint},
};

/// Harris応答のブロックサイズ
const BLOCK_SIZE: i32 = 5;
/// Sobelアパーチャ
const SOBEL_APERTURE: i32 = 5;
/// Harris自由パラメータk
const HARRIS_K: f64 = 0.05;
/// 弱コーナー除去のしきい値（最大応答に対する比率）
const STRENGTH_RATIO: f64 = 0.02;
/// サブピクセル探索の半窓サイズ
const SUBPIX_WINDOW: i32 = 5;
/// サブピクセル反復回数の上限
const SUBPIX_MAX_ITER: i32 = 30;
/// サブピクセル収束判定のイプシロン
const SUBPIX_EPSILON: f64 = 0.1;
/// NMS時の膨張反復回数
const DILATE_ITERATIONS: i32 = 2;

fn stage_err(what: &str, e: opencv::Error) -> PipelineError {
    PipelineError::Stage(format!("harris {} failed: {}", what, e))
}

/// 1フレーム分の検出結果
#[derive(Debug, Clone, Default)]
pub struct CornerDetection {
    pub keypoints: Vec<Keypoint>,
    /// 各キーポイントの平均差し引き済み近傍記述子（長さ se_diameter^2）
    pub descriptors: Vec<Descriptor>,
}

/// Harrisコーナー検出エンジン
///
/// 内部状態を持たないため、ワーカー間で自由に共有できる。
pub struct HarrisCornerEngine;

impl HarrisCornerEngine {
    pub fn new() -> Self {
        Self
    }

    /// コーナーを検出する
    ///
    /// # Arguments
    /// - `bgr`: 入力画像（8UC3）
    /// - `nms`: 形態学的な非最大抑制を行うか
    /// - `se_diameter`: 構造化要素の直径（境界除外マージン・記述子窓も兼ねる）
    ///
    /// コーナーが1つも見つからない場合は空の結果を返す（エラーではない）。
    pub fn detect(
        &self,
        bgr: &Mat,
        nms: bool,
        se_diameter: i32,
    ) -> PipelineResult<CornerDetection> {
        let mut gray_u8 = Mat::default();
        imgproc::cvt_color(bgr, &mut gray_u8, imgproc::COLOR_BGR2GRAY, 0)
            .map_err(|e| stage_err("BGR2GRAY", e))?;
        let mut gray = Mat::default();
        gray_u8
            .convert_to(&mut gray, core::CV_32F, 1.0, 0.0)
            .map_err(|e| stage_err("gray convert", e))?;

        let mut strength = Mat::default();
        imgproc::corner_harris(
            &gray,
            &mut strength,
            BLOCK_SIZE,
            SOBEL_APERTURE,
            HARRIS_K,
            core::BORDER_DEFAULT,
        )
        .map_err(|e| stage_err("cornerHarris", e))?;

        // 負の応答は切り捨てる
        let mut clipped = Mat::default();
        imgproc::threshold(&strength, &mut clipped, 0.0, 0.0, imgproc::THRESH_TOZERO)
            .map_err(|e| stage_err("clip", e))?;

        let mut max_strength = 0.0f64;
        core::min_max_loc(
            &clipped,
            None,
            Some(&mut max_strength),
            None,
            None,
            &core::no_array(),
        )
        .map_err(|e| stage_err("minMaxLoc", e))?;
        if max_strength <= 0.0 {
            return Ok(CornerDetection::default());
        }

        let mut strong = Mat::default();
        imgproc::threshold(
            &clipped,
            &mut strong,
            STRENGTH_RATIO * max_strength,
            0.0,
            imgproc::THRESH_TOZERO,
        )
        .map_err(|e| stage_err("threshold", e))?;

        let mut positive = Mat::default();
        core::compare(&strong, &core::Scalar::all(0.0), &mut positive, core::CMP_GT)
            .map_err(|e| stage_err("compare", e))?;

        let mask = if nms {
            let se = imgproc::get_structuring_element(
                imgproc::MORPH_ELLIPSE,
                core::Size::new(se_diameter, se_diameter),
                core::Point::new(-1, -1),
            )
            .map_err(|e| stage_err("structuring element", e))?;

            let mut dilated = Mat::default();
            imgproc::dilate(
                &strong,
                &mut dilated,
                &se,
                core::Point::new(-1, -1),
                DILATE_ITERATIONS,
                core::BORDER_CONSTANT,
                imgproc::morphology_default_border_value()
                    .map_err(|e| stage_err("border value", e))?,
            )
            .map_err(|e| stage_err("dilate", e))?;

            // 膨張結果と一致する画素 = 局所最大
            let mut local_max = Mat::default();
            core::compare(&strong, &dilated, &mut local_max, core::CMP_EQ)
                .map_err(|e| stage_err("compare", e))?;

            let mut mask = Mat::default();
            core::bitwise_and(&local_max, &positive, &mut mask, &core::no_array())
                .map_err(|e| stage_err("bitwise_and", e))?;
            mask
        } else {
            positive
        };

        let mut labels = Mat::default();
        let mut stats = Mat::default();
        let mut centroids = Mat::default();
        let label_count = imgproc::connected_components_with_stats(
            &mask,
            &mut labels,
            &mut stats,
            &mut centroids,
            8,
            core::CV_32S,
        )
        .map_err(|e| stage_err("connectedComponents", e))?;

        // ラベル0は背景成分
        if label_count <= 1 {
            return Ok(CornerDetection::default());
        }

        let mut corners = core::Vector::<core::Point2f>::new();
        for label in 1..label_count {
            let x = *centroids
                .at_2d::<f64>(label, 0)
                .map_err(|e| stage_err("centroid access", e))?;
            let y = *centroids
                .at_2d::<f64>(label, 1)
                .map_err(|e| stage_err("centroid access", e))?;
            corners.push(core::Point2f::new(x as f32, y as f32));
        }

        let criteria = core::TermCriteria::new(
            core::TermCriteria_COUNT + core::TermCriteria_EPS,
            SUBPIX_MAX_ITER,
            SUBPIX_EPSILON,
        )
        .map_err(|e| stage_err("criteria", e))?;
        imgproc::corner_sub_pix(
            &gray,
            &mut corners,
            core::Size::new(SUBPIX_WINDOW, SUBPIX_WINDOW),
            core::Size::new(-1, -1),
            criteria,
        )
        .map_err(|e| stage_err("cornerSubPix", e))?;

        self.collect_descriptors(&gray, &strength, &corners, se_diameter)
    }

    /// 精緻化済みコーナーから境界内のものだけを記述子付きで集める
    fn collect_descriptors(
        &self,
        gray: &Mat,
        strength: &Mat,
        corners: &core::Vector<core::Point2f>,
        se_diameter: i32,
    ) -> PipelineResult<CornerDetection> {
        let width = gray.cols();
        let height = gray.rows();
        let nstart = se_diameter / 2;
        let nstop = (se_diameter + 1) / 2;

        let mut detection = CornerDetection::default();
        for corner in corners.iter() {
            let x = corner.x as i32;
            let y = corner.y as i32;

            // 近傍窓が画像内に収まらないコーナーは捨てる
            if x < se_diameter || x > width - se_diameter || y < se_diameter || y > height - se_diameter
            {
                continue;
            }

            let roi = Mat::roi(
                gray,
                core::Rect::new(x - nstart, y - nstart, se_diameter, se_diameter),
            )
            .map_err(|e| stage_err("roi", e))?;

            // 全ゼロ近傍は無情報なので捨てる
            let nonzero =
                core::count_non_zero(&roi).map_err(|e| stage_err("count_non_zero", e))?;
            if nonzero == 0 {
                continue;
            }

            let mean = core::mean(&roi, &core::no_array()).map_err(|e| stage_err("mean", e))?[0];
            let mut values = Vec::with_capacity((se_diameter * se_diameter) as usize);
            for row in 0..se_diameter {
                for col in 0..se_diameter {
                    let v = *roi
                        .at_2d::<f32>(row, col)
                        .map_err(|e| stage_err("roi access", e))?;
                    values.push(v - mean as f32);
                }
            }

            let response = *strength
                .at_2d::<f32>(y, x)
                .map_err(|e| stage_err("strength access", e))?;

            detection.keypoints.push(Keypoint {
                x: x as f32,
                y: y as f32,
                size: se_diameter as f32,
                response,
            });
            detection.descriptors.push(Descriptor(values));
        }

        Ok(detection)
    }

    /// 検出結果を赤色マーカーで描画したフレームを返す
    pub fn annotate(&self, bgr: &Mat, nms: bool, se_diameter: i32) -> PipelineResult<Mat> {
        let detection = self.detect(bgr, nms, se_diameter)?;

        let mut keypoints = core::Vector::<core::KeyPoint>::new();
        for kp in &detection.keypoints {
            keypoints.push(
                core::KeyPoint::new_coords(kp.x, kp.y, kp.size, -1.0, kp.response, 0, -1)
                    .map_err(|e| stage_err("keypoint", e))?,
            );
        }

        let mut annotated = Mat::default();
        features2d::draw_keypoints(
            bgr,
            &keypoints,
            &mut annotated,
            core::Scalar::new(0.0, 0.0, 255.0, 0.0),
            features2d::DrawMatchesFlags::DEFAULT,
        )
        .map_err(|e| stage_err("drawKeypoints", e))?;

        Ok(annotated)
    }
}

impl Default for HarrisCornerEngine {
    fn default() -> Self {
        Self::new()
    }
}
