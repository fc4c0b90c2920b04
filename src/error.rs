//! Error taxonomy for the substitution pipeline

use std::path::PathBuf;

use thiserror::Error;

use crate::capture::frame::PixelFormat;
use crate::network::ConnectionState;

pub type Result<T> = std::result::Result<T, VcamError>;

#[derive(Debug, Error)]
pub enum VcamError {
    /// Pool exhaustion or a failed allocation. Degrades to pass-through.
    #[error("buffer allocation failed for {width}x{height} {format:?}: {reason}")]
    AllocationFailed {
        width: u32,
        height: u32,
        format: PixelFormat,
        reason: &'static str,
    },

    #[error("invalid geometry: {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },

    #[error("decode failed for {source_name}: {reason}")]
    DecodeFailed { source_name: String, reason: String },

    /// The latest network frame was not fresh enough to be used this tick.
    #[error("network frame slot read timed out after {waited_ms} ms")]
    SlotReadTimeout { waited_ms: u64 },

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("invalid connection transition from {from:?} via {operation}")]
    InvalidTransition {
        from: ConnectionState,
        operation: &'static str,
    },

    #[error("unsupported pixel format {0:?} for this operation")]
    UnsupportedFormat(PixelFormat),

    #[error("resize failed: {0}")]
    Resize(String),

    #[error("frame buffer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl VcamError {
    pub(crate) fn decode(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::DecodeFailed {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Failures that belong to one frame and must never escape the capture tick.
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            Self::AllocationFailed { .. }
                | Self::InvalidGeometry { .. }
                | Self::DecodeFailed { .. }
                | Self::SlotReadTimeout { .. }
                | Self::SizeMismatch { .. }
                | Self::Resize(_)
        )
    }
}

impl From<fast_image_resize::ResizeError> for VcamError {
    fn from(err: fast_image_resize::ResizeError) -> Self {
        Self::Resize(err.to_string())
    }
}

impl From<fast_image_resize::ImageBufferError> for VcamError {
    fn from(err: fast_image_resize::ImageBufferError) -> Self {
        Self::Resize(err.to_string())
    }
}

impl From<fast_image_resize::CropBoxError> for VcamError {
    fn from(err: fast_image_resize::CropBoxError) -> Self {
        Self::Resize(err.to_string())
    }
}

impl From<config::ConfigError> for VcamError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
