use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VcamError};

pub const MAX_PLANES: usize = 3;

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 8-bit R, G, B
    Rgb24,
    /// Packed 8-bit B, G, R, A
    Bgra32,
    /// Planar YUV 4:2:0 (Y, U, V)
    I420,
    /// Semi-planar YUV 4:2:0 (Y, interleaved UV)
    Nv12,
}

impl PixelFormat {
    pub fn is_yuv(self) -> bool {
        matches!(self, Self::I420 | Self::Nv12)
    }

    pub fn plane_count(self) -> usize {
        match self {
            Self::Rgb24 | Self::Bgra32 => 1,
            Self::Nv12 => 2,
            Self::I420 => 3,
        }
    }

    /// Plane layouts for a tightly packed buffer of the given size.
    pub fn layout(self, width: u32, height: u32) -> [PlaneLayout; MAX_PLANES] {
        let w = width as usize;
        let h = height as usize;
        let cw = (width + 1) / 2;
        let ch = (height + 1) / 2;
        let mut planes = [PlaneLayout::EMPTY; MAX_PLANES];
        match self {
            Self::Rgb24 => planes[0] = PlaneLayout::new(0, width, height, 3),
            Self::Bgra32 => planes[0] = PlaneLayout::new(0, width, height, 4),
            Self::I420 => {
                planes[0] = PlaneLayout::new(0, width, height, 1);
                planes[1] = PlaneLayout::new(w * h, cw, ch, 1);
                planes[2] = PlaneLayout::new(w * h + planes[1].len(), cw, ch, 1);
            }
            Self::Nv12 => {
                planes[0] = PlaneLayout::new(0, width, height, 1);
                planes[1] = PlaneLayout::new(w * h, cw, ch, 2);
            }
        }
        planes
    }

    pub fn buffer_len(self, width: u32, height: u32) -> usize {
        self.layout(width, height)
            .iter()
            .take(self.plane_count())
            .map(PlaneLayout::len)
            .sum()
    }
}

/// Location of one plane inside a frame's contiguous pixel store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    pub stride: usize,
    pub width: u32,
    pub height: u32,
    /// Interleaved bytes per plane sample
    pub channels: u8,
}

impl PlaneLayout {
    const EMPTY: Self = Self {
        offset: 0,
        stride: 0,
        width: 0,
        height: 0,
        channels: 0,
    };

    fn new(offset: usize, width: u32, height: u32, channels: u8) -> Self {
        Self {
            offset,
            stride: width as usize * channels as usize,
            width,
            height,
            channels,
        }
    }

    pub fn len(&self) -> usize {
        self.stride * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pool bucket key: geometry plus pixel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameKey {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.format.buffer_len(self.width, self.height)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(VcamError::InvalidGeometry {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

/// Fixed-geometry, fixed-format pixel buffer.
///
/// Dimensions and format never change once built; only pixel content,
/// `sequence` and `timestamp` are rewritten when a pooled buffer is reused.
#[derive(Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    key: FrameKey,
    planes: [PlaneLayout; MAX_PLANES],
    data: Vec<u8>,

    /// Monotonic sequence number assigned by the producer
    pub sequence: u64,

    /// Capture or generation timestamp
    pub timestamp: Duration,
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.key.width)
            .field("height", &self.key.height)
            .field("format", &self.key.format)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl FrameBuffer {
    /// Allocate a zeroed buffer. Allocation failure is reported, not aborted on.
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Result<Self> {
        let key = FrameKey::new(width, height, format);
        key.validate()?;

        let len = key.byte_len();
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| VcamError::AllocationFailed {
                width,
                height,
                format,
                reason: "out of memory",
            })?;
        data.resize(len, 0);

        Ok(Self {
            key,
            planes: format.layout(width, height),
            data,
            sequence: 0,
            timestamp: Duration::ZERO,
        })
    }

    /// Wrap tightly packed pixel data.
    pub fn from_raw(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let key = FrameKey::new(width, height, format);
        key.validate()?;

        let expected = key.byte_len();
        if data.len() != expected {
            return Err(VcamError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            key,
            planes: format.layout(width, height),
            data,
            sequence: 0,
            timestamp: Duration::ZERO,
        })
    }

    /// Solid-color frame, handy for placeholders and tests.
    pub fn solid(format: PixelFormat, width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let mut frame = Self::new(format, width, height)?;
        frame.fill_rgb(rgb);
        Ok(frame)
    }

    pub fn width(&self) -> u32 {
        self.key.width
    }

    pub fn height(&self) -> u32 {
        self.key.height
    }

    pub fn format(&self) -> PixelFormat {
        self.key.format
    }

    pub fn key(&self) -> FrameKey {
        self.key
    }

    pub fn plane_count(&self) -> usize {
        self.key.format.plane_count()
    }

    pub fn plane_layout(&self, index: usize) -> PlaneLayout {
        self.planes[index]
    }

    pub fn stride(&self, index: usize) -> usize {
        self.planes[index].stride
    }

    pub fn plane(&self, index: usize) -> &[u8] {
        let p = &self.planes[index];
        &self.data[p.offset..p.offset + p.len()]
    }

    pub fn plane_mut(&mut self, index: usize) -> &mut [u8] {
        let p = self.planes[index];
        &mut self.data[p.offset..p.offset + p.len()]
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn view(&self) -> FrameView<'_> {
        FrameView {
            key: self.key,
            planes: self.planes,
            data: &self.data,
        }
    }

    /// Fill every pixel with one RGB color, encoded for this frame's format.
    pub fn fill_rgb(&mut self, rgb: [u8; 3]) {
        match self.key.format {
            PixelFormat::Rgb24 => {
                for px in self.data.chunks_exact_mut(3) {
                    px.copy_from_slice(&rgb);
                }
            }
            PixelFormat::Bgra32 => {
                for px in self.data.chunks_exact_mut(4) {
                    px.copy_from_slice(&[rgb[2], rgb[1], rgb[0], 255]);
                }
            }
            PixelFormat::I420 => {
                let [y, u, v] = crate::pipeline::convert::rgb_to_yuv(rgb);
                self.plane_mut(0).fill(y);
                self.plane_mut(1).fill(u);
                self.plane_mut(2).fill(v);
            }
            PixelFormat::Nv12 => {
                let [y, u, v] = crate::pipeline::convert::rgb_to_yuv(rgb);
                self.plane_mut(0).fill(y);
                for uv in self.plane_mut(1).chunks_exact_mut(2) {
                    uv[0] = u;
                    uv[1] = v;
                }
            }
        }
    }

    /// Re-key a buffer in place, reusing its allocation where possible.
    /// The pool does this when it evicts an idle buffer for a new size, and
    /// staging frames do it when the geometry changes.
    pub(crate) fn reshape(&mut self, key: FrameKey) -> Result<()> {
        key.validate()?;
        let len = key.byte_len();
        if len > self.data.capacity() {
            self.data
                .try_reserve_exact(len - self.data.len())
                .map_err(|_| VcamError::AllocationFailed {
                    width: key.width,
                    height: key.height,
                    format: key.format,
                    reason: "out of memory",
                })?;
        }
        self.data.resize(len, 0);
        self.key = key;
        self.planes = key.format.layout(key.width, key.height);
        self.sequence = 0;
        self.timestamp = Duration::ZERO;
        Ok(())
    }
}

/// Borrowed, tightly packed pixels with the same plane layout as a
/// [`FrameBuffer`]. Lets converters read straight out of a transport payload.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    key: FrameKey,
    planes: [PlaneLayout; MAX_PLANES],
    data: &'a [u8],
}

impl<'a> FrameView<'a> {
    pub fn new(format: PixelFormat, width: u32, height: u32, data: &'a [u8]) -> Result<Self> {
        let key = FrameKey::new(width, height, format);
        key.validate()?;
        let expected = key.byte_len();
        if data.len() != expected {
            return Err(VcamError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            key,
            planes: format.layout(width, height),
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.key.width
    }

    pub fn height(&self) -> u32 {
        self.key.height
    }

    pub fn format(&self) -> PixelFormat {
        self.key.format
    }

    pub fn key(&self) -> FrameKey {
        self.key
    }

    pub fn plane_count(&self) -> usize {
        self.key.format.plane_count()
    }

    pub fn plane_layout(&self, index: usize) -> PlaneLayout {
        self.planes[index]
    }

    pub fn plane(&self, index: usize) -> &'a [u8] {
        let p = &self.planes[index];
        &self.data[p.offset..p.offset + p.len()]
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Rotation of the capture connection the frame is delivered on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Portrait,
    PortraitUpsideDown,
    LandscapeRight,
    LandscapeLeft,
}

impl Orientation {
    pub fn is_landscape(self) -> bool {
        matches!(self, Self::LandscapeLeft | Self::LandscapeRight)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AspectPolicy {
    /// Letterbox or pillarbox to keep the source aspect ratio
    #[default]
    Preserve,
    /// Map source extents directly onto the target
    Stretch,
}

/// The geometry and pixel contract a consumer expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub orientation: Orientation,
    pub aspect: AspectPolicy,
    pub mirrored: bool,
}

impl FormatDescriptor {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
            orientation: Orientation::default(),
            aspect: AspectPolicy::default(),
            mirrored: false,
        }
    }

    pub fn with_aspect(mut self, aspect: AspectPolicy) -> Self {
        self.aspect = aspect;
        self
    }

    pub fn with_mirrored(mut self, mirrored: bool) -> Self {
        self.mirrored = mirrored;
        self
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn key(&self) -> FrameKey {
        FrameKey::new(self.width, self.height, self.pixel_format)
    }

    /// Descriptor that reproduces a frame's own geometry unchanged.
    pub fn of(frame: &FrameBuffer) -> Self {
        Self::new(frame.width(), frame.height(), frame.format()).with_aspect(AspectPolicy::Stretch)
    }
}

/// One upstream capture callback: what the host expects, and when it captured
#[derive(Debug, Clone, Copy)]
pub struct CaptureTick {
    pub format: FormatDescriptor,
    pub timestamp: Duration,
}

impl CaptureTick {
    pub fn new(format: FormatDescriptor, timestamp: Duration) -> Self {
        Self { format, timestamp }
    }
}
