// Frame source backed by OpenCV's VideoCapture. Each call opens its own
// capture, so decoding is safe from any number of worker threads.

use arena_prep::core_modules::frame_source::{FrameSource, VideoProbe};
use arena_prep::{PrepError, Result};
use image::RgbaImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use std::path::Path;

#[derive(Default)]
pub struct OpenCvSource;

fn open(video: &Path) -> Result<VideoCapture> {
    let failed = |reason: String| PrepError::FrameDecode {
        video: video.to_path_buf(),
        timestamp: 0.0,
        reason,
    };
    let path = video
        .to_str()
        .ok_or_else(|| failed("path is not valid UTF-8".into()))?;
    let cap = VideoCapture::from_file(path, videoio::CAP_ANY).map_err(|e| failed(e.to_string()))?;
    if !cap.is_opened().map_err(|e| failed(e.to_string()))? {
        return Err(failed("could not open video".into()));
    }
    Ok(cap)
}

impl FrameSource for OpenCvSource {
    fn probe(&self, video: &Path) -> Result<VideoProbe> {
        let cap = open(video)?;
        let prop = |id| {
            cap.get(id).map_err(|e| PrepError::FrameDecode {
                video: video.to_path_buf(),
                timestamp: 0.0,
                reason: e.to_string(),
            })
        };
        let fps = prop(videoio::CAP_PROP_FPS)?;
        let frames = prop(videoio::CAP_PROP_FRAME_COUNT)?;
        let duration = if fps > 0.0 { frames / fps } else { 0.0 };
        Ok(VideoProbe {
            duration,
            native_width: prop(videoio::CAP_PROP_FRAME_WIDTH)? as u32,
            native_height: prop(videoio::CAP_PROP_FRAME_HEIGHT)? as u32,
        })
    }

    fn decode_frame(&self, video: &Path, timestamp: f64) -> Result<RgbaImage> {
        let failed = |reason: String| PrepError::FrameDecode {
            video: video.to_path_buf(),
            timestamp,
            reason,
        };
        let mut cap = open(video)?;
        cap.set(videoio::CAP_PROP_POS_MSEC, timestamp * 1000.0)
            .map_err(|e| failed(e.to_string()))?;

        let mut frame = Mat::default();
        if !cap.read(&mut frame).map_err(|e| failed(e.to_string()))? || frame.empty() {
            return Err(failed("no frame at timestamp".into()));
        }

        // OpenCV hands out BGR; the engine works in RGBA.
        let mut rgba = Mat::default();
        imgproc::cvt_color(&frame, &mut rgba, imgproc::COLOR_BGR2RGBA, 0).map_err(|e| failed(e.to_string()))?;
        let width = rgba.cols() as u32;
        let height = rgba.rows() as u32;
        let bytes = rgba.data_bytes().map_err(|e| failed(e.to_string()))?.to_vec();
        RgbaImage::from_raw(width, height, bytes).ok_or_else(|| failed("frame buffer size mismatch".into()))
    }
}
