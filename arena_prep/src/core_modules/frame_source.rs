// THEORY:
// Decoding video is an external concern. The engine only needs two questions
// answered about a video: "how long and how large is it" (`probe`) and "what does
// it look like at time t" (`decode_frame`). `FrameSource` is that seam. The
// engine is handed an implementation at construction and never assumes a codec.
//
// `ImageSequenceSource` is the built-in implementation: a video `X.mp4` is
// represented by a directory `X.frames/` of PNG files named by their timestamp
// in milliseconds. It needs no native media libraries, which makes it the
// default for the runner and a convenient fixture format.

use crate::error::{PrepError, Result};
use image::RgbaImage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identity of a video: the path of its source file.
pub type VideoId = PathBuf;

/// Static properties of a video.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProbe {
    /// Duration in seconds.
    pub duration: f64,
    pub native_width: u32,
    pub native_height: u32,
}

/// Supplies decoded frames for a video. Implementations must be thread safe:
/// the engine decodes from blocking worker threads.
pub trait FrameSource: Send + Sync {
    fn probe(&self, video: &Path) -> Result<VideoProbe>;

    /// Decodes the frame shown at `timestamp` seconds as an RGBA raster.
    fn decode_frame(&self, video: &Path, timestamp: f64) -> Result<RgbaImage>;
}

/// Frames stored as `<video>.frames/<millis>.png`.
#[derive(Default)]
pub struct ImageSequenceSource {
    listings: Mutex<HashMap<PathBuf, Arc<Vec<u64>>>>,
}

impl ImageSequenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// The directory holding the frames of `video`.
    pub fn frames_dir(video: &Path) -> PathBuf {
        video.with_extension("frames")
    }

    fn listing(&self, video: &Path) -> Result<Arc<Vec<u64>>> {
        if let Some(listing) = self.listings.lock().get(video) {
            return Ok(listing.clone());
        }

        let dir = Self::frames_dir(video);
        let mut stamps = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_png = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
            if !is_png {
                continue;
            }
            if let Some(millis) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                stamps.push(millis);
            }
        }
        stamps.sort_unstable();
        stamps.dedup();

        if stamps.is_empty() {
            return Err(PrepError::FrameDecode {
                video: video.to_path_buf(),
                timestamp: 0.0,
                reason: format!("no <millis>.png frames in {}", dir.display()),
            });
        }

        let listing = Arc::new(stamps);
        self.listings
            .lock()
            .insert(video.to_path_buf(), listing.clone());
        Ok(listing)
    }

    fn frame_path(video: &Path, millis: u64) -> PathBuf {
        Self::frames_dir(video).join(format!("{millis}.png"))
    }
}

impl FrameSource for ImageSequenceSource {
    fn probe(&self, video: &Path) -> Result<VideoProbe> {
        let listing = self.listing(video)?;
        let first = listing[0];
        let last = listing[listing.len() - 1];
        // The last frame stays on screen for one frame interval.
        let interval = if listing.len() > 1 {
            last - listing[listing.len() - 2]
        } else {
            0
        };
        let (native_width, native_height) = image::image_dimensions(Self::frame_path(video, first))?;
        Ok(VideoProbe {
            duration: (last + interval) as f64 / 1000.0,
            native_width,
            native_height,
        })
    }

    fn decode_frame(&self, video: &Path, timestamp: f64) -> Result<RgbaImage> {
        let listing = self.listing(video)?;
        let wanted = (timestamp.max(0.0) * 1000.0).round() as u64;
        // Frame on screen at `timestamp`: the last one starting at or before it.
        let index = listing.partition_point(|&millis| millis <= wanted).saturating_sub(1);
        let path = Self::frame_path(video, listing[index]);
        let frame = image::open(&path).map_err(|e| PrepError::FrameDecode {
            video: video.to_path_buf(),
            timestamp,
            reason: e.to_string(),
        })?;
        Ok(frame.to_rgba8())
    }
}
