// Synthetic footage used across the unit tests.

use crate::core_modules::frame_source::{FrameSource, VideoProbe};
use crate::error::{PrepError, Result};
use image::{Rgba, RgbaImage};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// 640x480, 10 s at 10 fps. Gray everywhere except a red square that is on
/// screen in 8 of every 10 frames, hopping between 8 non-overlapping slots so
/// that any single pixel is covered in only 10% of frames.
pub struct SyntheticVideo {
    pub width: u32,
    pub height: u32,
    pub duration: f64,
    pub fps: f64,
    pub background: Rgba<u8>,
    pub square: Rgba<u8>,
    pub side: u32,
}

impl Default for SyntheticVideo {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            duration: 10.0,
            fps: 10.0,
            background: Rgba([128, 128, 128, 255]),
            square: Rgba([220, 30, 30, 255]),
            side: 60,
        }
    }
}

impl SyntheticVideo {
    fn frame_index(&self, timestamp: f64) -> u64 {
        let last = (self.duration * self.fps) as u64 - 1;
        ((timestamp.max(0.0) * self.fps).floor() as u64).min(last)
    }

    /// Top-left corner of the square at `timestamp`, if it is on screen.
    pub fn square_at(&self, timestamp: f64) -> Option<(u32, u32)> {
        let slot = self.frame_index(timestamp) % 10;
        (slot < 8).then(|| (40 + slot as u32 * 70, 200))
    }

    pub fn frame_at(&self, timestamp: f64) -> RgbaImage {
        let mut frame = RgbaImage::from_pixel(self.width, self.height, self.background);
        if let Some((x0, y0)) = self.square_at(timestamp) {
            for y in y0..y0 + self.side {
                for x in x0..x0 + self.side {
                    frame.put_pixel(x, y, self.square);
                }
            }
        }
        frame
    }
}

impl FrameSource for SyntheticVideo {
    fn probe(&self, _video: &Path) -> Result<VideoProbe> {
        Ok(VideoProbe {
            duration: self.duration,
            native_width: self.width,
            native_height: self.height,
        })
    }

    fn decode_frame(&self, _video: &Path, timestamp: f64) -> Result<RgbaImage> {
        Ok(self.frame_at(timestamp))
    }
}

pub struct ConstantVideo {
    width: u32,
    height: u32,
    color: Rgba<u8>,
}

impl ConstantVideo {
    pub fn new(width: u32, height: u32, color: Rgba<u8>) -> Self {
        Self { width, height, color }
    }
}

impl FrameSource for ConstantVideo {
    fn probe(&self, _video: &Path) -> Result<VideoProbe> {
        Ok(VideoProbe {
            duration: 10.0,
            native_width: self.width,
            native_height: self.height,
        })
    }

    fn decode_frame(&self, _video: &Path, _timestamp: f64) -> Result<RgbaImage> {
        Ok(RgbaImage::from_pixel(self.width, self.height, self.color))
    }
}

/// Probes fine, never decodes.
pub struct BrokenVideo;

impl FrameSource for BrokenVideo {
    fn probe(&self, _video: &Path) -> Result<VideoProbe> {
        Ok(VideoProbe {
            duration: 10.0,
            native_width: 64,
            native_height: 48,
        })
    }

    fn decode_frame(&self, video: &Path, timestamp: f64) -> Result<RgbaImage> {
        Err(PrepError::FrameDecode {
            video: video.to_path_buf(),
            timestamp,
            reason: "corrupt stream".into(),
        })
    }
}

/// Fails every other decode call.
pub struct FlakyVideo<V> {
    inner: V,
    calls: AtomicUsize,
}

impl<V> FlakyVideo<V> {
    pub fn new(inner: V) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }
}

impl<V: FrameSource> FrameSource for FlakyVideo<V> {
    fn probe(&self, video: &Path) -> Result<VideoProbe> {
        self.inner.probe(video)
    }

    fn decode_frame(&self, video: &Path, timestamp: f64) -> Result<RgbaImage> {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return BrokenVideo.decode_frame(video, timestamp);
        }
        self.inner.decode_frame(video, timestamp)
    }
}

/// Synthetic footage for every video except the ones listed as broken.
pub struct SelectiveSource {
    pub inner: SyntheticVideo,
    pub broken: HashSet<PathBuf>,
}

impl SelectiveSource {
    pub fn new(broken: &[&Path]) -> Self {
        Self {
            inner: SyntheticVideo::default(),
            broken: broken.iter().map(|p| p.to_path_buf()).collect(),
        }
    }
}

impl FrameSource for SelectiveSource {
    fn probe(&self, video: &Path) -> Result<VideoProbe> {
        self.inner.probe(video)
    }

    fn decode_frame(&self, video: &Path, timestamp: f64) -> Result<RgbaImage> {
        if self.broken.contains(video) {
            return BrokenVideo.decode_frame(video, timestamp);
        }
        self.inner.decode_frame(video, timestamp)
    }
}
