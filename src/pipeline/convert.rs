//! Resize, pixel-format conversion, aspect fit and mirroring.
//!
//! `adapt` reads the source and writes only into the destination it is handed.
//! Geometry runs on `fast_image_resize`, one plane at a time with a bilinear
//! filter, straight into the letterbox region of the destination. When the
//! pixel format changes the source is first resized in its own format into a
//! staging frame, then converted while it is placed. YUV uses BT.601
//! full-range coefficients.
//!
//! The resizer's scratch and the staging frame live in the converter and are
//! reused, so repeated calls with the same geometry do not allocate.

use fast_image_resize as fir;
use fir::images::{TypedCroppedImageMut, TypedImage, TypedImageRef};
use fir::pixels::{U8x2, U8x3, U8x4, U8};
use fir::{FilterType, ResizeAlg, ResizeOptions, Resizer};

use crate::capture::frame::{
    AspectPolicy, FormatDescriptor, FrameBuffer, FrameKey, FrameView, PixelFormat, PlaneLayout,
};
use crate::error::{Result, VcamError};

/// Where the scaled source lands inside the target, in luma pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ContentRect {
    pub fn covers(&self, width: u32, height: u32) -> bool {
        self.x == 0 && self.y == 0 && self.width == width && self.height == height
    }
}

pub struct FormatConverter {
    /// Letterbox fill color
    pub fill: [u8; 3],
    resizer: Resizer,
    staging: Option<FrameBuffer>,
}

impl Default for FormatConverter {
    fn default() -> Self {
        Self::new([0, 0, 0])
    }
}

impl std::fmt::Debug for FormatConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatConverter")
            .field("fill", &self.fill)
            .field("staging", &self.staging.as_ref().map(FrameBuffer::key))
            .finish()
    }
}

impl FormatConverter {
    pub fn new(fill: [u8; 3]) -> Self {
        Self {
            fill,
            resizer: Resizer::new(),
            staging: None,
        }
    }

    /// Placement of a `src_width`x`src_height` image inside `target`.
    pub fn content_rect(src_width: u32, src_height: u32, target: &FormatDescriptor) -> ContentRect {
        let (dw, dh) = (target.width, target.height);
        match target.aspect {
            AspectPolicy::Stretch => ContentRect {
                x: 0,
                y: 0,
                width: dw,
                height: dh,
            },
            AspectPolicy::Preserve => {
                let (sw, sh) = (src_width as u64, src_height as u64);
                let (w, h) = if sw * dh as u64 > dw as u64 * sh {
                    // Source is wider: fit width, letterbox top and bottom
                    let h = (sh * dw as u64 + sw / 2) / sw;
                    (dw, (h as u32).clamp(1, dh))
                } else {
                    let w = (sw * dh as u64 + sh / 2) / sh;
                    ((w as u32).clamp(1, dw), dh)
                };
                ContentRect {
                    x: (dw - w) / 2,
                    y: (dh - h) / 2,
                    width: w,
                    height: h,
                }
            }
        }
    }

    /// Render `src` into `dst` according to `target`.
    ///
    /// `dst` must already have the target's geometry and pixel format.
    pub fn adapt(
        &mut self,
        src: &FrameBuffer,
        dst: &mut FrameBuffer,
        target: &FormatDescriptor,
    ) -> Result<()> {
        self.adapt_view(src.view(), dst, target)
    }

    /// [`adapt`](Self::adapt) for borrowed pixels.
    pub fn adapt_view(
        &mut self,
        src: FrameView<'_>,
        dst: &mut FrameBuffer,
        target: &FormatDescriptor,
    ) -> Result<()> {
        if target.width == 0 || target.height == 0 {
            return Err(VcamError::InvalidGeometry {
                width: target.width,
                height: target.height,
            });
        }
        if dst.width() != target.width || dst.height() != target.height {
            return Err(VcamError::InvalidGeometry {
                width: dst.width(),
                height: dst.height(),
            });
        }
        if dst.format() != target.pixel_format {
            return Err(VcamError::UnsupportedFormat(dst.format()));
        }

        let rect = Self::content_rect(src.width(), src.height(), target);
        let covers = rect.covers(target.width, target.height);
        let yuv = dst.format().is_yuv();
        // Chroma planes can only be addressed from even luma offsets
        let aligned = !yuv || (rect.x % 2 == 0 && rect.y % 2 == 0);
        // Reversing chroma rows equals a luma-space mirror only for even widths
        let mirror_rows = !target.mirrored || !yuv || target.width % 2 == 0;

        if src.format() == dst.format() && aligned && mirror_rows {
            if src.key() == dst.key() && covers {
                dst.data_mut().copy_from_slice(src.data());
            } else {
                if !covers {
                    dst.fill_rgb(self.fill);
                }
                resize_planes(&mut self.resizer, src, dst, rect)?;
            }
            if target.mirrored {
                mirror_planes(dst);
            }
            return Ok(());
        }

        let staged_key = FrameKey::new(rect.width, rect.height, src.format());
        if staged_key == src.key() {
            place(src, dst, rect, target.mirrored, self.fill);
            return Ok(());
        }

        let mut staging = match self.staging.take() {
            Some(mut frame) => {
                if frame.key() != staged_key {
                    frame.reshape(staged_key)?;
                }
                frame
            }
            None => FrameBuffer::new(src.format(), rect.width, rect.height)?,
        };
        let whole = ContentRect {
            x: 0,
            y: 0,
            width: rect.width,
            height: rect.height,
        };
        let resized = resize_planes(&mut self.resizer, src, &mut staging, whole);
        if resized.is_ok() {
            place(staging.view(), dst, rect, target.mirrored, self.fill);
        }
        self.staging = Some(staging);
        resized
    }
}

fn resize_options() -> ResizeOptions {
    ResizeOptions::new()
        .resize_alg(ResizeAlg::Convolution(FilterType::Bilinear))
        .use_alpha(false)
}

/// Resize one plane of `$pixel` samples into `$region` of the destination plane.
macro_rules! resize_plane {
    ($pixel:ty, $resizer:expr, $src:expr, $from:expr, $dst:expr, $to:expr, $region:expr) => {{
        let src_image = TypedImageRef::<$pixel>::from_buffer($from.width, $from.height, $src)?;
        let mut dst_image = TypedImage::<$pixel>::from_buffer($to.width, $to.height, $dst)?;
        let options = resize_options();
        if $region.covers($to.width, $to.height) {
            $resizer.resize_typed::<$pixel>(&src_image, &mut dst_image, &options)?;
        } else {
            let mut view = TypedCroppedImageMut::from_ref(
                &mut dst_image,
                $region.x,
                $region.y,
                $region.width,
                $region.height,
            )?;
            $resizer.resize_typed::<$pixel>(&src_image, &mut view, &options)?;
        }
    }};
}

/// Scale every plane of `src` into `rect` of a same-format `dst`.
fn resize_planes(
    resizer: &mut Resizer,
    src: FrameView<'_>,
    dst: &mut FrameBuffer,
    rect: ContentRect,
) -> Result<()> {
    let yuv = src.format().is_yuv();
    for plane in 0..src.plane_count() {
        let from = src.plane_layout(plane);
        let to = dst.plane_layout(plane);
        let sub = if yuv && plane > 0 { 2 } else { 1 };
        let (x, y) = (rect.x / sub, rect.y / sub);
        let region = ContentRect {
            x,
            y,
            width: rect.width.div_ceil(sub).min(to.width - x),
            height: rect.height.div_ceil(sub).min(to.height - y),
        };

        let src_plane = src.plane(plane);
        let dst_plane = dst.plane_mut(plane);
        match from.channels {
            1 => resize_plane!(U8, resizer, src_plane, from, dst_plane, to, region),
            2 => resize_plane!(U8x2, resizer, src_plane, from, dst_plane, to, region),
            3 => resize_plane!(U8x3, resizer, src_plane, from, dst_plane, to, region),
            _ => resize_plane!(U8x4, resizer, src_plane, from, dst_plane, to, region),
        }
    }
    Ok(())
}

/// Reverse every row of every plane in place.
fn mirror_planes(frame: &mut FrameBuffer) {
    for plane in 0..frame.plane_count() {
        let PlaneLayout {
            stride, channels, ..
        } = frame.plane_layout(plane);
        for row in frame.plane_mut(plane).chunks_exact_mut(stride) {
            row.reverse();
            if channels > 1 {
                for px in row.chunks_exact_mut(channels as usize) {
                    px.reverse();
                }
            }
        }
    }
}

/// Copy an already-scaled `src` into `rect` of `dst`, converting color and
/// mirroring in luma space on the way. Everything outside `rect` is `fill`.
fn place(
    src: FrameView<'_>,
    dst: &mut FrameBuffer,
    rect: ContentRect,
    mirrored: bool,
    fill: [u8; 3],
) {
    let sampler = Sampler(src);
    let (w, h) = (dst.width() as usize, dst.height() as usize);
    let inside = |lx: usize, ly: usize| {
        let x = lx.checked_sub(rect.x as usize)?;
        let y = ly.checked_sub(rect.y as usize)?;
        (x < rect.width as usize && y < rect.height as usize).then_some((x, y))
    };

    match dst.format() {
        PixelFormat::Rgb24 | PixelFormat::Bgra32 => {
            let bgra = dst.format() == PixelFormat::Bgra32;
            let layout = dst.plane_layout(0);
            let c = layout.channels as usize;
            let plane = dst.plane_mut(0);
            for py in 0..h {
                let row = &mut plane[py * layout.stride..][..w * c];
                for (px, out) in row.chunks_exact_mut(c).enumerate() {
                    let [r, g, b] = match inside(logical(px, w, mirrored), py) {
                        Some((x, y)) => sampler.rgb(x, y),
                        None => fill,
                    };
                    if bgra {
                        out.copy_from_slice(&[b, g, r, 255]);
                    } else {
                        out.copy_from_slice(&[r, g, b]);
                    }
                }
            }
        }
        PixelFormat::I420 | PixelFormat::Nv12 => {
            let [fill_y, fill_u, fill_v] = rgb_to_yuv(fill);
            let luma = dst.plane_layout(0);
            let chroma = dst.plane_layout(1);
            let nv12 = dst.format() == PixelFormat::Nv12;
            let v_offset = if nv12 { 0 } else { dst.plane_layout(2).offset };

            let data = dst.data_mut();
            let split = if nv12 { data.len() } else { v_offset };
            let (head, v_plane) = data.split_at_mut(split);
            let (y_plane, u_plane) = head.split_at_mut(chroma.offset);

            for py in 0..h {
                let row = &mut y_plane[py * luma.stride..][..w];
                for (px, out) in row.iter_mut().enumerate() {
                    *out = match inside(logical(px, w, mirrored), py) {
                        Some((x, y)) => to_u8(sampler.yuv(x, y)[0]),
                        None => fill_y,
                    };
                }
            }

            let (cw, ch) = (chroma.width as usize, chroma.height as usize);
            for cy in 0..ch {
                let ys = taps(2 * cy + 1, rect.y, rect.height);
                for cx in 0..cw {
                    // Center of the chroma sample on the luma grid, mirrored there
                    let edge = if mirrored { w - 2 * cx - 1 } else { 2 * cx + 1 };
                    let xs = taps(edge, rect.x, rect.width);
                    let (u, v) = sampler.chroma(xs, ys).unwrap_or((fill_u, fill_v));
                    if nv12 {
                        let i = cy * chroma.stride + cx * 2;
                        u_plane[i] = u;
                        u_plane[i + 1] = v;
                    } else {
                        let i = cy * chroma.stride + cx;
                        u_plane[i] = u;
                        v_plane[i] = v;
                    }
                }
            }
        }
    }
}

/// Luma columns (or rows) on either side of grid edge `edge`, relative to the
/// content origin and dropped when they fall outside it.
fn taps(edge: usize, origin: u32, extent: u32) -> [Option<usize>; 2] {
    [edge.checked_sub(1), Some(edge)].map(|t| {
        t.and_then(|t| t.checked_sub(origin as usize))
            .filter(|&t| t < extent as usize)
    })
}

/// Per-pixel reads from a packed frame in any format
struct Sampler<'a>(FrameView<'a>);

impl Sampler<'_> {
    fn rgb(&self, x: usize, y: usize) -> [u8; 3] {
        let view = &self.0;
        match view.format() {
            PixelFormat::Rgb24 | PixelFormat::Bgra32 => {
                let layout = view.plane_layout(0);
                let i = y * layout.stride + x * layout.channels as usize;
                let p = &view.plane(0)[i..];
                if view.format() == PixelFormat::Bgra32 {
                    [p[2], p[1], p[0]]
                } else {
                    [p[0], p[1], p[2]]
                }
            }
            PixelFormat::I420 | PixelFormat::Nv12 => {
                let [y, u, v] = self.yuv(x, y);
                yuv_to_rgb_f(y, u, v).map(to_u8)
            }
        }
    }

    fn yuv(&self, x: usize, y: usize) -> [f32; 3] {
        let view = &self.0;
        let (cx, cy) = (x / 2, y / 2);
        match view.format() {
            PixelFormat::Rgb24 | PixelFormat::Bgra32 => {
                let rgb = self.rgb(x, y).map(f32::from);
                let (u, v) = chroma_of(rgb);
                [luma_of(rgb), u, v]
            }
            PixelFormat::I420 => {
                let luma = view.plane(0)[y * view.plane_layout(0).stride + x];
                let i = cy * view.plane_layout(1).stride + cx;
                [luma, view.plane(1)[i], view.plane(2)[i]].map(f32::from)
            }
            PixelFormat::Nv12 => {
                let luma = view.plane(0)[y * view.plane_layout(0).stride + x];
                let i = cy * view.plane_layout(1).stride + cx * 2;
                let uv = view.plane(1);
                [luma, uv[i], uv[i + 1]].map(f32::from)
            }
        }
    }

    /// Average chroma over the taps that fall inside the content.
    fn chroma(&self, xs: [Option<usize>; 2], ys: [Option<usize>; 2]) -> Option<(u8, u8)> {
        let (mut u, mut v, mut n) = (0.0, 0.0, 0.0);
        for y in ys.into_iter().flatten() {
            for x in xs.into_iter().flatten() {
                let [_, cu, cv] = self.yuv(x, y);
                u += cu;
                v += cv;
                n += 1.0;
            }
        }
        (n > 0.0).then(|| (to_u8(u / n), to_u8(v / n)))
    }
}

fn logical(px: usize, width: usize, mirrored: bool) -> usize {
    if mirrored {
        width - 1 - px
    } else {
        px
    }
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn luma_of([r, g, b]: [f32; 3]) -> f32 {
    0.299 * r + 0.587 * g + 0.114 * b
}

fn chroma_of([r, g, b]: [f32; 3]) -> (f32, f32) {
    let u = -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
    let v = 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
    (u, v)
}

fn yuv_to_rgb_f(y: f32, u: f32, v: f32) -> [f32; 3] {
    let (u, v) = (u - 128.0, v - 128.0);
    [
        y + 1.402 * v,
        y - 0.344_136 * u - 0.714_136 * v,
        y + 1.772 * u,
    ]
}

pub fn rgb_to_yuv(rgb: [u8; 3]) -> [u8; 3] {
    let f = [rgb[0] as f32, rgb[1] as f32, rgb[2] as f32];
    let (u, v) = chroma_of(f);
    [to_u8(luma_of(f)), to_u8(u), to_u8(v)]
}

pub fn yuv_to_rgb(yuv: [u8; 3]) -> [u8; 3] {
    let [r, g, b] = yuv_to_rgb_f(yuv[0] as f32, yuv[1] as f32, yuv[2] as f32);
    [to_u8(r), to_u8(g), to_u8(b)]
}
