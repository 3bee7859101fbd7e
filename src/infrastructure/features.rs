//! 特徴マッチングエンジン
//!
//! ORBによる特徴点検出・記述、ランダム化SSCによる空間的抑制、
//! クロスチェック付きBFマッチング（ハミング距離）を実行する。
//!
//! ORBとBFMatcherは構築時に一度だけ生成し、以後すべての呼び出しで再利用する。
//! これらは再入安全ではないためMutexで直列化し、チェーンの他ステージは
//! 並列のまま動かせるようにする。

use opencv::{core, features2d, prelude::*};
use rand::seq::SliceRandom;
use std::sync::Mutex;

use crate::domain::{
    error::{PipelineError, PipelineResult},
    types::{Frame, MatchPair, MatchView},
};
use crate::infrastructure::convert::{frame_to_mat, mat_to_frame};

/// ORB検出器の特徴点数上限
const ORB_MAX_FEATURES: i32 = 5000;
/// ピラミッドのスケール係数
const ORB_SCALE_FACTOR: f32 = 1.2;
/// ピラミッド段数
const ORB_LEVELS: i32 = 8;
/// エッジしきい値（パッチサイズと同値）
const ORB_EDGE_THRESHOLD: i32 = 31;
const ORB_PATCH_SIZE: i32 = 31;
const ORB_FAST_THRESHOLD: i32 = 10;

fn stage_err(what: &str, e: opencv::Error) -> PipelineError {
    PipelineError::Stage(format!("features {} failed: {}", what, e))
}

fn lock_err(what: &str) -> PipelineError {
    PipelineError::Stage(format!("{} lock poisoned", what))
}

/// SSC（Suppression via Square Covering）による空間的非最大抑制
///
/// セル幅を二分探索し、許容率内で最も代表的な部分集合を貪欲に残す。
/// 呼び出し側が事前にシャッフルしていれば順序依存のバイアスはない。
pub fn ssc(
    keypoints: &[core::KeyPoint],
    num_ret_points: usize,
    tolerance: f32,
    cols: i32,
    rows: i32,
) -> Vec<core::KeyPoint> {
    if keypoints.len() <= 1 || num_ret_points <= 1 {
        return keypoints.to_vec();
    }

    let cols_f = cols as f64;
    let rows_f = rows as f64;
    let k = num_ret_points as f64;

    // 上界は被覆方程式の解、下界は均等分布を仮定したセル幅
    let exp1 = rows_f + cols_f + 2.0 * k;
    let exp2 = 4.0 * cols_f + 4.0 * k + 4.0 * k * rows_f + rows_f * rows_f + cols_f * cols_f
        - 2.0 * rows_f * cols_f
        + 4.0 * k * rows_f * cols_f;
    let exp3 = exp2.sqrt();
    let exp4 = k - 1.0;
    let sol1 = (-(exp1 + exp3) / exp4).round();
    let sol2 = (-(exp1 - exp3) / exp4).round();

    let mut high = sol1.max(sol2);
    let mut low = (keypoints.len() as f64 / k).sqrt().floor();

    let k_min = (k - k * tolerance as f64).round() as usize;
    let k_max = (k + k * tolerance as f64).round() as usize;

    let mut prev_width = -1.0f64;
    let selected: Vec<usize>;
    let mut result: Vec<usize> = Vec::new();

    loop {
        let width = low + (high - low) / 2.0;
        if width == prev_width || low > high {
            selected = result;
            break;
        }

        let c = width / 2.0;
        if c <= 0.0 {
            selected = result;
            break;
        }
        let num_cell_cols = (cols_f / c).floor() as i64;
        let num_cell_rows = (rows_f / c).floor() as i64;
        let span = (width / c).floor() as i64;

        let mut covered =
            vec![vec![false; (num_cell_cols + 1) as usize]; (num_cell_rows + 1) as usize];
        result = Vec::new();

        for (i, kp) in keypoints.iter().enumerate() {
            let row = ((kp.pt().y as f64 / c).floor() as i64).clamp(0, num_cell_rows);
            let col = ((kp.pt().x as f64 / c).floor() as i64).clamp(0, num_cell_cols);
            if covered[row as usize][col as usize] {
                continue;
            }

            result.push(i);
            let row_min = (row - span).max(0);
            let row_max = (row + span).min(num_cell_rows);
            let col_min = (col - span).max(0);
            let col_max = (col + span).min(num_cell_cols);
            for r in row_min..=row_max {
                for cc in col_min..=col_max {
                    covered[r as usize][cc as usize] = true;
                }
            }
        }

        if result.len() >= k_min && result.len() <= k_max {
            selected = result;
            break;
        } else if result.len() < k_min {
            high = width - 1.0;
        } else {
            low = width + 1.0;
        }
        prev_width = width;
    }

    selected.into_iter().map(|i| keypoints[i].clone()).collect()
}

/// ORB + BFマッチングの実行エンジン
pub struct FeatureMatchEngine {
    orb: Mutex<core::Ptr<features2d::ORB>>,
    matcher: Mutex<core::Ptr<features2d::BFMatcher>>,
}

impl FeatureMatchEngine {
    /// 検出器とマッチャーを生成する
    pub fn new() -> PipelineResult<Self> {
        let orb = features2d::ORB::create(
            ORB_MAX_FEATURES,
            ORB_SCALE_FACTOR,
            ORB_LEVELS,
            ORB_EDGE_THRESHOLD,
            0,
            2,
            features2d::ORB_ScoreType::HARRIS_SCORE,
            ORB_PATCH_SIZE,
            ORB_FAST_THRESHOLD,
        )
        .map_err(|e| stage_err("ORB create", e))?;

        let matcher = features2d::BFMatcher::create(core::NORM_HAMMING, true)
            .map_err(|e| stage_err("BFMatcher create", e))?;

        Ok(Self {
            orb: Mutex::new(orb),
            matcher: Mutex::new(matcher),
        })
    }

    /// 特徴点と記述子を抽出する
    ///
    /// 抑制が有効な場合はシャッフル後にSSCで間引き、残った点に対してだけ
    /// 記述子を再計算する。
    fn extract(
        &self,
        image: &Mat,
        nms: bool,
        tolerance: f32,
    ) -> PipelineResult<(core::Vector<core::KeyPoint>, Mat)> {
        let mut orb = self.orb.lock().map_err(|_| lock_err("detector"))?;

        let mut keypoints = core::Vector::<core::KeyPoint>::new();
        let mut descriptors = Mat::default();
        orb.detect_and_compute(
            image,
            &core::no_array(),
            &mut keypoints,
            &mut descriptors,
            false,
        )
        .map_err(|e| stage_err("detectAndCompute", e))?;

        if nms && keypoints.len() > 1 {
            let mut shuffled: Vec<core::KeyPoint> = keypoints.to_vec();
            shuffled.shuffle(&mut rand::thread_rng());

            let kept = ssc(
                &shuffled,
                shuffled.len(),
                tolerance,
                image.cols(),
                image.rows(),
            );
            keypoints = core::Vector::from_iter(kept);
            descriptors = Mat::default();
            orb.compute(image, &mut keypoints, &mut descriptors)
                .map_err(|e| stage_err("compute", e))?;
        }

        Ok((keypoints, descriptors))
    }

    /// 2フレーム間の一対一マッチを距離昇順で返す
    pub fn match_pairs(
        &self,
        a: &Mat,
        b: &Mat,
        nms: bool,
        tolerance: f32,
        max_matches: usize,
    ) -> PipelineResult<Vec<MatchPair>> {
        let (kp1, des1) = self.extract(a, nms, tolerance)?;
        let (kp2, des2) = self.extract(b, nms, tolerance)?;
        if kp1.is_empty() || kp2.is_empty() {
            return Ok(Vec::new());
        }

        let matches = self.cross_check_matches(&des1, &des2)?;
        let mut pairs: Vec<MatchPair> = matches
            .iter()
            .map(|m| MatchPair {
                query_idx: m.query_idx as usize,
                train_idx: m.train_idx as usize,
                distance: m.distance,
            })
            .collect();
        pairs.sort_by(|x, y| x.distance.total_cmp(&y.distance));
        pairs.truncate(max_matches);
        Ok(pairs)
    }

    fn cross_check_matches(
        &self,
        des1: &Mat,
        des2: &Mat,
    ) -> PipelineResult<core::Vector<core::DMatch>> {
        let matcher = self.matcher.lock().map_err(|_| lock_err("matcher"))?;
        let mut matches = core::Vector::<core::DMatch>::new();
        matcher
            .train_match(des1, des2, &mut matches, &core::no_array())
            .map_err(|e| stage_err("match", e))?;
        Ok(matches)
    }

    /// 2フレームをマッチングし、対応線を描いた左右連結画像を作る
    ///
    /// どちらかのフレームに特徴点が1つもない場合は、未加工の連結画像と
    /// マッチ数0を返す（エラーではない）。
    pub fn match_frames(
        &self,
        a: &Frame,
        b: &Frame,
        nms: bool,
        tolerance: f32,
        max_matches: usize,
    ) -> PipelineResult<MatchView> {
        let mat_a = frame_to_mat(a)?;
        let mat_b = frame_to_mat(b)?;

        let (kp1, des1) = self.extract(&mat_a, nms, tolerance)?;
        let (kp2, des2) = self.extract(&mat_b, nms, tolerance)?;

        if kp1.is_empty() || kp2.is_empty() {
            let mut composite = Mat::default();
            core::hconcat2(&mat_a, &mat_b, &mut composite)
                .map_err(|e| stage_err("hconcat", e))?;
            return Ok(MatchView {
                image: mat_to_frame(&composite, 0)?,
                match_count: 0,
            });
        }

        let matches = self.cross_check_matches(&des1, &des2)?;
        let mut sorted: Vec<core::DMatch> = matches.to_vec();
        sorted.sort_by(|x, y| x.distance.total_cmp(&y.distance));
        sorted.truncate(max_matches);
        let best = core::Vector::<core::DMatch>::from_iter(sorted);

        let mut composite = Mat::default();
        features2d::draw_matches(
            &mat_a,
            &kp1,
            &mat_b,
            &kp2,
            &best,
            &mut composite,
            core::Scalar::all(-1.0),
            core::Scalar::all(-1.0),
            &core::Vector::<i8>::new(),
            features2d::DrawMatchesFlags::NOT_DRAW_SINGLE_POINTS,
        )
        .map_err(|e| stage_err("drawMatches", e))?;

        Ok(MatchView {
            image: mat_to_frame(&composite, 0)?,
            match_count: best.len(),
        })
    }

    /// 検出した特徴点を緑色で描画したフレームを返す
    pub fn annotate(&self, bgr: &Mat, nms: bool, tolerance: f32) -> PipelineResult<Mat> {
        let (keypoints, _) = self.extract(bgr, nms, tolerance)?;

        let mut annotated = Mat::default();
        features2d::draw_keypoints(
            bgr,
            &keypoints,
            &mut annotated,
            core::Scalar::new(0.0, 255.0, 0.0, 0.0),
            features2d::DrawMatchesFlags::DEFAULT,
        )
        .map_err(|e| stage_err("drawKeypoints", e))?;

        Ok(annotated)
    }
}
