//! Frame ⇔ Mat 変換ヘルパー
//!
//! パイプライン内部の `Frame`（BGR連続バッファ）とOpenCVの `Mat` を相互変換する。
//! キャプチャ・変換チェーン・表示の3箇所から共用される。

use opencv::{core, imgproc, prelude::*};

use crate::domain::{
    error::{PipelineError, PipelineResult},
    types::Frame,
};

/// FrameをBGR 8UC3のMatに変換する
///
/// 入力バッファは借用のままOpenCV側にコピーされ、戻り値のMatは独立所有となる。
pub fn frame_to_mat(frame: &Frame) -> PipelineResult<Mat> {
    if !frame.is_well_formed() {
        return Err(PipelineError::Stage(format!(
            "malformed frame buffer: seq={} {}x{} len={}",
            frame.seq,
            frame.width,
            frame.height,
            frame.data.len()
        )));
    }

    let view = unsafe {
        Mat::new_rows_cols_with_data_unsafe(
            frame.height as i32,
            frame.width as i32,
            core::CV_8UC3,
            frame.data.as_ptr() as *mut std::ffi::c_void,
            core::Mat_AUTO_STEP,
        )
    }
    .map_err(|e| PipelineError::Stage(format!("Mat view creation failed: {}", e)))?;

    view.try_clone()
        .map_err(|e| PipelineError::Stage(format!("Mat clone failed: {}", e)))
}

/// MatをFrameに変換する
///
/// 8UC1はBGRへ昇格し、8UC3はそのままコピーする。それ以外の型はエラー。
pub fn mat_to_frame(mat: &Mat, seq: u64) -> PipelineResult<Frame> {
    let bgr = match mat.typ() {
        t if t == core::CV_8UC3 => mat.try_clone(),
        t if t == core::CV_8UC1 => {
            let mut converted = Mat::default();
            imgproc::cvt_color(mat, &mut converted, imgproc::COLOR_GRAY2BGR, 0)
                .map_err(|e| PipelineError::Stage(format!("GRAY2BGR failed: {}", e)))?;
            Ok(converted)
        }
        t => {
            return Err(PipelineError::Stage(format!(
                "unsupported Mat type for frame conversion: {}",
                t
            )))
        }
    }
    .map_err(|e| PipelineError::Stage(format!("Mat clone failed: {}", e)))?;

    // data_bytesは連続バッファを要求する
    let contiguous = if bgr.is_continuous() {
        bgr
    } else {
        bgr.try_clone()
            .map_err(|e| PipelineError::Stage(format!("Mat clone failed: {}", e)))?
    };

    let data = contiguous
        .data_bytes()
        .map_err(|e| PipelineError::Stage(format!("Mat data access failed: {}", e)))?
        .to_vec();

    Ok(Frame {
        seq,
        width: contiguous.cols() as u32,
        height: contiguous.rows() as u32,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_mat_roundtrip() {
        let frame = Frame::filled(7, 4, 3, [10, 20, 30]);
        let mat = frame_to_mat(&frame).expect("frame to mat");

        assert_eq!(mat.cols(), 4);
        assert_eq!(mat.rows(), 3);
        assert_eq!(mat.typ(), core::CV_8UC3);

        let back = mat_to_frame(&mat, frame.seq).expect("mat to frame");
        assert_eq!(back.seq, 7);
        assert_eq!(back.width, 4);
        assert_eq!(back.height, 3);
        assert_eq!(back.data, frame.data);
    }

    #[test]
    fn test_gray_mat_is_promoted_to_bgr() {
        let gray = Mat::new_rows_cols_with_default(2, 2, core::CV_8UC1, core::Scalar::all(128.0))
            .expect("gray mat");

        let frame = mat_to_frame(&gray, 1).expect("gray to frame");
        assert_eq!(frame.data.len(), 2 * 2 * 3);
        assert!(frame.data.iter().all(|&b| b == 128));
    }

    #[test]
    fn test_malformed_frame_is_rejected() {
        let mut frame = Frame::filled(1, 4, 4, [0, 0, 0]);
        frame.data.pop();

        assert!(matches!(
            frame_to_mat(&frame),
            Err(PipelineError::Stage(_))
        ));
    }
}
