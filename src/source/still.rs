use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument};

use crate::capture::decoder;
use crate::capture::frame::FrameBuffer;
use crate::error::Result;

/// A single image, decoded once and handed out on every tick.
///
/// The cached frame is shared read-only; the converter writes into pool
/// buffers, never into it.
#[derive(Debug, Clone)]
pub struct StillImageSource {
    path: Option<PathBuf>,
    frame: Arc<FrameBuffer>,
}

impl StillImageSource {
    /// Decode `path`, optionally pre-scaled to fit `max_resolution`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path, max_resolution: Option<(u32, u32)>) -> Result<Self> {
        let mut frame = decoder::decode_image_file(path)?;
        if let Some(max) = max_resolution {
            frame = decoder::fit_within(frame, max)?;
        }
        info!(width = frame.width(), height = frame.height(), "still image loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            frame: Arc::new(frame),
        })
    }

    pub fn from_frame(frame: FrameBuffer) -> Self {
        Self {
            path: None,
            frame: Arc::new(frame),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn fetch_latest(&self) -> Arc<FrameBuffer> {
        self.frame.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;

    #[test]
    fn every_fetch_returns_the_same_frame() {
        let frame = FrameBuffer::new(PixelFormat::Rgb24, 8, 8).unwrap();
        let source = StillImageSource::from_frame(frame);
        let a = source.fetch_latest();
        let b = source.fetch_latest();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn opens_and_prescales_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        image::RgbImage::from_pixel(400, 200, image::Rgb([9, 8, 7]))
            .save(&path)
            .unwrap();

        let source = StillImageSource::open(&path, Some((100, 100))).unwrap();
        let frame = source.fetch_latest();
        assert_eq!((frame.width(), frame.height()), (100, 50));
        assert_eq!(&frame.data()[..3], &[9, 8, 7]);
        assert_eq!(source.path(), Some(path.as_path()));
    }
}
