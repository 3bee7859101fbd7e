//! キャプチャ入力モジュール
//!
//! OpenCVの `VideoCapture` を `CapturePort` として適合させる。
//! ソース文字列はカメラ番号・ファイルパス・URIのいずれかで、
//! `:key=value` 形式のパラメータ（現状 `size=WxH` のみ）を付加できる。

use opencv::{prelude::*, videoio};
use std::thread;

use crate::domain::{
    config::CaptureConfig,
    error::{PipelineError, PipelineResult},
    ports::{CapturePort, DeviceInfo},
    types::Frame,
};
use crate::infrastructure::convert::mat_to_frame;

/// パース済みキャプチャソース
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub target: SourceTarget,
    /// `size=WxH` 指定（カメラにのみ適用）
    pub size: Option<(i32, i32)>,
}

/// キャプチャ対象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceTarget {
    /// カメラデバイス番号
    Camera(i32),
    /// ファイルパスまたはURI
    Uri(String),
}

/// ソース文字列をパースする
///
/// # Examples
/// - `"0"` → カメラ0
/// - `"0:size=640x480"` → カメラ0、解像度指定
/// - `"clip.avi"` / `"c:\videos\clip.avi"` → ファイル
pub fn parse_source(source: &str) -> PipelineResult<SourceSpec> {
    if source.is_empty() {
        return Err(PipelineError::Configuration(
            "capture source must not be empty".to_string(),
        ));
    }

    let mut chunks: Vec<&str> = source.split(':').collect();

    // Windowsのドライブレター（"c:\..."）はパスの一部として扱う
    let mut head = chunks.remove(0).to_string();
    if head.len() == 1 && head.chars().all(|c| c.is_ascii_alphabetic()) && !chunks.is_empty() {
        head = format!("{}:{}", head, chunks.remove(0));
    }

    let mut size = None;
    let mut target_parts = vec![head];
    for chunk in chunks {
        match chunk.split_once('=') {
            Some(("size", value)) => {
                let (w, h) = value.split_once('x').ok_or_else(|| {
                    PipelineError::Configuration(format!("invalid size parameter: '{}'", value))
                })?;
                let w: i32 = w.parse().map_err(|_| {
                    PipelineError::Configuration(format!("invalid size width: '{}'", w))
                })?;
                let h: i32 = h.parse().map_err(|_| {
                    PipelineError::Configuration(format!("invalid size height: '{}'", h))
                })?;
                size = Some((w, h));
            }
            Some((key, _)) => {
                return Err(PipelineError::Configuration(format!(
                    "unknown source parameter: '{}'",
                    key
                )));
            }
            // '='を含まない部分はURIの一部（例: rtsp://host:554/...）
            None => target_parts.push(chunk.to_string()),
        }
    }

    let target_str = target_parts.join(":");
    let target = match target_str.parse::<i32>() {
        Ok(index) if index >= 0 => SourceTarget::Camera(index),
        _ => SourceTarget::Uri(target_str),
    };

    Ok(SourceSpec { target, size })
}

/// OpenCVベースのキャプチャアダプタ
pub struct OpenCvCapture {
    capture: videoio::VideoCapture,
    info: DeviceInfo,
}

impl OpenCvCapture {
    /// ソースを開く
    ///
    /// デバイスの準備が間に合わない場合に備え、設定されたリトライ回数まで
    /// 一定間隔でオープンを試みる。
    pub fn open(config: &CaptureConfig) -> PipelineResult<Self> {
        let spec = parse_source(&config.source)?;

        let mut last_error = String::new();
        for attempt in 1..=config.open_retry_attempts {
            match Self::try_open(&spec) {
                Ok(capture) => {
                    let info = Self::probe_info(&capture, &spec)?;
                    tracing::info!(
                        source = %config.source,
                        attempt,
                        width = info.width,
                        height = info.height,
                        "Capture source opened"
                    );
                    return Ok(Self { capture, info });
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::debug!(
                        source = %config.source,
                        attempt,
                        error = %last_error,
                        "Capture open attempt failed"
                    );
                    if attempt < config.open_retry_attempts {
                        thread::sleep(config.open_retry_interval());
                    }
                }
            }
        }

        Err(PipelineError::CaptureUnavailable(format!(
            "source '{}' could not be opened after {} attempts: {}",
            config.source, config.open_retry_attempts, last_error
        )))
    }

    fn try_open(spec: &SourceSpec) -> PipelineResult<videoio::VideoCapture> {
        let mut capture = match &spec.target {
            SourceTarget::Camera(index) => videoio::VideoCapture::new(*index, videoio::CAP_ANY),
            SourceTarget::Uri(uri) => videoio::VideoCapture::from_file(uri, videoio::CAP_ANY),
        }
        .map_err(|e| PipelineError::CaptureUnavailable(format!("VideoCapture failed: {}", e)))?;

        let opened = capture
            .is_opened()
            .map_err(|e| PipelineError::CaptureUnavailable(format!("is_opened failed: {}", e)))?;
        if !opened {
            return Err(PipelineError::CaptureUnavailable(
                "source reported not opened".to_string(),
            ));
        }

        if let (SourceTarget::Camera(_), Some((w, h))) = (&spec.target, spec.size) {
            capture
                .set(videoio::CAP_PROP_FRAME_WIDTH, w as f64)
                .map_err(|e| PipelineError::Device(format!("set frame width failed: {}", e)))?;
            capture
                .set(videoio::CAP_PROP_FRAME_HEIGHT, h as f64)
                .map_err(|e| PipelineError::Device(format!("set frame height failed: {}", e)))?;
        }

        Ok(capture)
    }

    fn probe_info(capture: &videoio::VideoCapture, spec: &SourceSpec) -> PipelineResult<DeviceInfo> {
        let width = capture
            .get(videoio::CAP_PROP_FRAME_WIDTH)
            .map_err(|e| PipelineError::Device(format!("get frame width failed: {}", e)))?;
        let height = capture
            .get(videoio::CAP_PROP_FRAME_HEIGHT)
            .map_err(|e| PipelineError::Device(format!("get frame height failed: {}", e)))?;

        let name = match &spec.target {
            SourceTarget::Camera(index) => format!("camera {}", index),
            SourceTarget::Uri(uri) => uri.clone(),
        };

        Ok(DeviceInfo {
            width: width as u32,
            height: height as u32,
            name,
        })
    }
}

impl CapturePort for OpenCvCapture {
    fn read_frame(&mut self) -> PipelineResult<Frame> {
        let mut mat = Mat::default();
        let ok = self
            .capture
            .read(&mut mat)
            .map_err(|e| PipelineError::Device(format!("frame read failed: {}", e)))?;

        // 読み取り失敗はストリーム終端として扱う（ファイル末尾・切断の両方）
        if !ok || mat.empty() {
            return Err(PipelineError::EndOfStream);
        }

        mat_to_frame(&mat, 0)
    }

    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_camera_index() {
        let spec = parse_source("0").expect("parse");
        assert_eq!(spec.target, SourceTarget::Camera(0));
        assert_eq!(spec.size, None);
    }

    #[test]
    fn test_parse_camera_with_size() {
        let spec = parse_source("1:size=640x480").expect("parse");
        assert_eq!(spec.target, SourceTarget::Camera(1));
        assert_eq!(spec.size, Some((640, 480)));
    }

    #[test]
    fn test_parse_file_path() {
        let spec = parse_source("clip.avi").expect("parse");
        assert_eq!(spec.target, SourceTarget::Uri("clip.avi".to_string()));
    }

    #[test]
    fn test_parse_drive_letter_path() {
        let spec = parse_source(r"c:\videos\clip.avi").expect("parse");
        assert_eq!(
            spec.target,
            SourceTarget::Uri(r"c:\videos\clip.avi".to_string())
        );
    }

    #[test]
    fn test_parse_uri_with_colons() {
        let spec = parse_source("rtsp://localhost:8554/stream").expect("parse");
        assert_eq!(
            spec.target,
            SourceTarget::Uri("rtsp://localhost:8554/stream".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_bad_size() {
        assert!(parse_source("0:size=640").is_err());
        assert!(parse_source("0:size=axb").is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_parameter() {
        assert!(parse_source("0:fps=30").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_source() {
        assert!(parse_source("").is_err());
    }
}
