// THEORY:
// Every fallible operation in the engine reports through one error enum. The
// variants mirror the operator-facing failure kinds: geometry and naming errors
// are rejected at the call that caused them, decode failures are per-video, and
// persistence failures come from the sidecar backend. "No foreground" is not
// here on purpose: segmentation reports it as a status alongside a valid
// (all-zero) label matrix.

use std::path::PathBuf;

/// The error type shared by every module of the preprocessing engine.
#[derive(Debug, thiserror::Error)]
pub enum PrepError {
    #[error("Invalid arena: {width:.1}x{height:.1} px is below the {min_width}x{min_height} px minimum or inverted")]
    InvalidArena {
        width: f64,
        height: f64,
        min_width: f64,
        min_height: f64,
    },

    #[error("Invalid timing window [{start:.3}, {end:.3}]: {reason}")]
    InvalidWindow { start: f64, end: f64, reason: String },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("No frame could be decoded from {video} ({attempted} timestamps tried)")]
    DecodeFailure { video: PathBuf, attempted: usize },

    #[error("Failed to decode {video} at {timestamp:.3}s: {reason}")]
    FrameDecode {
        video: PathBuf,
        timestamp: f64,
        reason: String,
    },

    #[error("Region name already in use: {0}")]
    NameCollision(String),

    #[error("Unknown region: {0}")]
    UnknownRegion(String),

    #[error("File name does not match the <prefix>.day<N><suffix> pattern: {0}")]
    GroupPatternMismatch(String),

    #[error("Persist failed: {0}")]
    PersistFailure(String),

    #[error("Corrupt sidecar: {0}")]
    CorruptSidecar(String),

    #[error("Unknown setup {name:?} for facility {facility:?}")]
    UnknownSetup { facility: String, name: String },

    #[error("Background estimation already running for {0}")]
    Busy(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PrepError>;
