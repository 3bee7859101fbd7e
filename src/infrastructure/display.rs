//! 表示・入出力アダプタ
//!
//! highguiウィンドウ・トラックバー・キー入力と、動画/静止画の書き出しを
//! `DisplayPort` として提供する。トラックバー値はコールバックからAtomicに
//! 書き込み、submit時にまとめて読み出す。

use opencv::{core, highgui, imgcodecs, imgproc, prelude::*, videoio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::domain::{
    config::{AppConfig, RecordingConfig, TrackbarState},
    error::{PipelineError, PipelineResult},
    ports::{ControlEvent, DisplayPort},
    types::Frame,
};
use crate::infrastructure::convert::frame_to_mat;

/// メインウィンドウ名
const WINDOW_MAIN: &str = "video";
/// マッチ合成画像のウィンドウ名
const WINDOW_MATCH: &str = "Matched points";
/// キャプチャ画像のウィンドウ名
const WINDOW_CAPTURE: &str = "capture";

/// Cannyしきい値トラックバーの最大値
const CANNY_SLIDER_MAX: i32 = 255;
/// ガウシアンσインデックスの最大値
const GAUSS_SLIDER_MAX: i32 = 13;

fn display_err(what: &str, e: opencv::Error) -> PipelineError {
    PipelineError::Display(format!("{} failed: {}", what, e))
}

/// キーコードを制御イベントに変換する
pub fn key_to_event(key: i32) -> ControlEvent {
    match key {
        27 => ControlEvent::Terminate,
        k if k == ' ' as i32 => ControlEvent::ToggleParallel,
        k if k == 'a' as i32 => ControlEvent::ToggleFeatureMatch,
        k if k == 'c' as i32 => ControlEvent::ToggleCorners,
        k if k == 'd' as i32 => ControlEvent::ToggleDiff,
        k if k == 'e' as i32 => ControlEvent::ToggleEdges,
        k if k == 'f' as i32 => ControlEvent::ToggleFrames,
        k if k == 'g' as i32 => ControlEvent::ToggleGaussian,
        k if k == 'l' as i32 => ControlEvent::ToggleLaplacian,
        k if k == 'm' as i32 => ControlEvent::ToggleMedian,
        k if k == 'n' as i32 => ControlEvent::ToggleNms,
        k if k == 'o' as i32 => ControlEvent::ToggleOrb,
        k if k == 'p' as i32 => ControlEvent::CaptureMatchFrame,
        k if k == 's' as i32 => ControlEvent::ToggleSobel,
        k if k == 'v' as i32 => ControlEvent::ToggleRecording,
        _ => ControlEvent::None,
    }
}

/// 縁取り付きのテキストを描く
fn draw_str(img: &mut Mat, x: i32, y: i32, text: &str) -> PipelineResult<()> {
    imgproc::put_text(
        img,
        text,
        core::Point::new(x + 1, y + 1),
        imgproc::FONT_HERSHEY_PLAIN,
        1.0,
        core::Scalar::all(0.0),
        2,
        imgproc::LINE_AA,
        false,
    )
    .map_err(|e| display_err("putText", e))?;
    imgproc::put_text(
        img,
        text,
        core::Point::new(x, y),
        imgproc::FONT_HERSHEY_PLAIN,
        1.0,
        core::Scalar::all(255.0),
        1,
        imgproc::LINE_AA,
        false,
    )
    .map_err(|e| display_err("putText", e))
}

/// highguiベースの表示アダプタ
pub struct HighguiDisplay {
    recording: RecordingConfig,
    writer: Option<videoio::VideoWriter>,
    canny_lower: Arc<AtomicI32>,
    canny_upper: Arc<AtomicI32>,
    sigma_index: Arc<AtomicI32>,
    canny_trackbars_created: bool,
    gaussian_trackbar_created: bool,
}

impl HighguiDisplay {
    /// メインウィンドウを作成する
    pub fn new(config: &AppConfig) -> PipelineResult<Self> {
        highgui::named_window(WINDOW_MAIN, highgui::WINDOW_AUTOSIZE)
            .map_err(|e| display_err("namedWindow", e))?;

        Ok(Self {
            recording: config.recording.clone(),
            writer: None,
            canny_lower: Arc::new(AtomicI32::new(config.transform.canny_lower)),
            canny_upper: Arc::new(AtomicI32::new(config.transform.canny_upper)),
            sigma_index: Arc::new(AtomicI32::new(config.transform.sigma_index)),
            canny_trackbars_created: false,
            gaussian_trackbar_created: false,
        })
    }

    fn create_trackbar(
        name: &str,
        max: i32,
        target: &Arc<AtomicI32>,
    ) -> PipelineResult<()> {
        let slot = Arc::clone(target);
        highgui::create_trackbar(
            name,
            WINDOW_MAIN,
            None,
            max,
            Some(Box::new(move |value| {
                slot.store(value, Ordering::Relaxed);
            })),
        )
        .map_err(|e| display_err("createTrackbar", e))?;

        highgui::set_trackbar_pos(name, WINDOW_MAIN, target.load(Ordering::Relaxed))
            .map_err(|e| display_err("setTrackbarPos", e))?;
        Ok(())
    }

    fn ensure_writer(&mut self, frame: &Frame) -> PipelineResult<&mut videoio::VideoWriter> {
        if self.writer.is_none() {
            let fourcc = videoio::VideoWriter::fourcc('X', 'V', 'I', 'D')
                .map_err(|e| display_err("fourcc", e))?;
            let writer = videoio::VideoWriter::new(
                &self.recording.video_path,
                fourcc,
                self.recording.video_fps,
                core::Size::new(frame.width as i32, frame.height as i32),
                true,
            )
            .map_err(|e| display_err("VideoWriter", e))?;
            self.writer = Some(writer);
        }
        // 直前で必ずSomeにしている
        self.writer
            .as_mut()
            .ok_or_else(|| PipelineError::Display("video writer missing".to_string()))
    }
}

impl DisplayPort for HighguiDisplay {
    fn show(&mut self, frame: &Frame, overlay: &[String]) -> PipelineResult<()> {
        let mut mat = frame_to_mat(frame)?;
        for (i, line) in overlay.iter().enumerate() {
            draw_str(&mut mat, 20, 20 + 20 * i as i32, line)?;
        }
        highgui::imshow(WINDOW_MAIN, &mat).map_err(|e| display_err("imshow", e))
    }

    fn show_match(&mut self, image: &Frame) -> PipelineResult<()> {
        highgui::named_window(WINDOW_MATCH, highgui::WINDOW_AUTOSIZE)
            .map_err(|e| display_err("namedWindow", e))?;
        let mat = frame_to_mat(image)?;
        highgui::imshow(WINDOW_MATCH, &mat).map_err(|e| display_err("imshow", e))
    }

    fn show_capture(&mut self, a: &Frame, b: Option<&Frame>) -> PipelineResult<()> {
        highgui::named_window(WINDOW_CAPTURE, highgui::WINDOW_AUTOSIZE)
            .map_err(|e| display_err("namedWindow", e))?;

        let mat_a = frame_to_mat(a)?;
        let mat = match b {
            Some(b) => {
                let mat_b = frame_to_mat(b)?;
                let mut joined = Mat::default();
                core::hconcat2(&mat_a, &mat_b, &mut joined)
                    .map_err(|e| display_err("hconcat", e))?;
                joined
            }
            None => mat_a,
        };
        highgui::imshow(WINDOW_CAPTURE, &mat).map_err(|e| display_err("imshow", e))
    }

    fn poll_event(&mut self) -> PipelineResult<ControlEvent> {
        let key = highgui::wait_key(1).map_err(|e| display_err("waitKey", e))?;
        Ok(key_to_event(key & 0xff))
    }

    fn ensure_canny_trackbars(&mut self) -> PipelineResult<()> {
        if self.canny_trackbars_created {
            return Ok(());
        }
        Self::create_trackbar("upper", CANNY_SLIDER_MAX, &self.canny_upper)?;
        Self::create_trackbar("lower", CANNY_SLIDER_MAX, &self.canny_lower)?;
        self.canny_trackbars_created = true;
        Ok(())
    }

    fn ensure_gaussian_trackbar(&mut self) -> PipelineResult<()> {
        if self.gaussian_trackbar_created {
            return Ok(());
        }
        Self::create_trackbar("rt2/2 * ", GAUSS_SLIDER_MAX, &self.sigma_index)?;
        self.gaussian_trackbar_created = true;
        Ok(())
    }

    fn trackbar_state(&self) -> TrackbarState {
        TrackbarState {
            canny_lower: self.canny_lower.load(Ordering::Relaxed),
            canny_upper: self.canny_upper.load(Ordering::Relaxed),
            sigma_index: self.sigma_index.load(Ordering::Relaxed),
        }
    }

    fn write_video_frame(&mut self, frame: &Frame) -> PipelineResult<()> {
        let mat = frame_to_mat(frame)?;
        let writer = self.ensure_writer(frame)?;
        writer.write(&mat).map_err(|e| display_err("video write", e))
    }

    fn save_image(&mut self, path: &str, frame: &Frame) -> PipelineResult<()> {
        let mat = frame_to_mat(frame)?;
        let written = imgcodecs::imwrite(path, &mat, &core::Vector::<i32>::new())
            .map_err(|e| display_err("imwrite", e))?;
        if !written {
            return Err(PipelineError::Display(format!(
                "image could not be written to '{}'",
                path
            )));
        }
        tracing::info!(path, "Image written");
        Ok(())
    }
}
