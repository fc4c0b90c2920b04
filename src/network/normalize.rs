//! Wire layouts to the canonical I420 frame.
//!
//! Runs on the delivering thread, before the slot is touched. Output is
//! written straight into the recycled slot buffer at the capped size. Packed
//! RGB payloads are read in place. Anything that needs compacting or scaling
//! goes through a staging frame kept between deliveries.

use super::session::{IncomingFrame, WireLayout};
use crate::capture::decoder;
use crate::capture::frame::{FormatDescriptor, FrameBuffer, FrameKey, FrameView, PixelFormat};
use crate::error::{Result, VcamError};
use crate::pipeline::convert::FormatConverter;

const SOURCE: &str = "network frame";

/// Per-source conversion scratch
#[derive(Debug, Default)]
pub(crate) struct Normalizer {
    converter: FormatConverter,
    staging: Option<FrameBuffer>,
}

impl Normalizer {
    /// Convert `frame` to I420, writing into `reuse` when given, scaled down to
    /// fit `cap` (either orientation).
    pub(crate) fn to_i420(
        &mut self,
        frame: &IncomingFrame,
        reuse: Option<FrameBuffer>,
        cap: (u32, u32),
    ) -> Result<FrameBuffer> {
        let payload = &frame.payload[..];
        let (width, height) = (frame.width, frame.height);
        let format = match frame.layout {
            WireLayout::Mjpeg => {
                let decoded = decoder::decode_mjpeg(payload)?;
                let mut out = fitted_buffer(decoded.width(), decoded.height(), cap, reuse)?;
                self.scale_into(decoded.view(), &mut out)?;
                return Ok(out);
            }
            WireLayout::I420 { .. } | WireLayout::Nv12 { .. } => PixelFormat::I420,
            WireLayout::Rgb24 { .. } => PixelFormat::Rgb24,
            WireLayout::Bgra32 { .. } => PixelFormat::Bgra32,
        };
        let source = FrameKey::new(width, height, format);
        source.validate()?;
        let mut out = fitted_buffer(width, height, cap, reuse)?;

        if let WireLayout::Rgb24 { stride } | WireLayout::Bgra32 { stride } = frame.layout {
            let row = format.layout(width, height)[0].stride;
            if stride == row {
                let len = check_extent(payload, 0, stride, row, height as usize)?;
                let view = FrameView::new(format, width, height, &payload[..len])?;
                self.scale_into(view, &mut out)?;
                return Ok(out);
            }
        }

        if out.key() == source {
            unpack(frame, &mut out)?;
            return Ok(out);
        }

        let mut staging = match self.staging.take() {
            Some(mut staging) => {
                if staging.key() != source {
                    staging.reshape(source)?;
                }
                staging
            }
            None => FrameBuffer::new(format, width, height)?,
        };
        let scaled = unpack(frame, &mut staging)
            .and_then(|()| self.scale_into(staging.view(), &mut out));
        self.staging = Some(staging);
        scaled.map(|()| out)
    }

    fn scale_into(&mut self, src: FrameView<'_>, out: &mut FrameBuffer) -> Result<()> {
        let target = FormatDescriptor::of(out);
        self.converter.adapt_view(src, out, &target)
    }
}

/// I420 buffer sized to fit `cap`, portrait sources taking the cap rotated
fn fitted_buffer(
    width: u32,
    height: u32,
    cap: (u32, u32),
    reuse: Option<FrameBuffer>,
) -> Result<FrameBuffer> {
    let cap = if height > width { (cap.1, cap.0) } else { cap };
    let (width, height) = decoder::fitted_size(width, height, cap);
    buffer_for(FrameKey::new(width, height, PixelFormat::I420), reuse)
}

fn buffer_for(key: FrameKey, reuse: Option<FrameBuffer>) -> Result<FrameBuffer> {
    match reuse {
        Some(frame) if frame.key() == key => Ok(frame),
        Some(mut frame) => {
            frame.reshape(key)?;
            Ok(frame)
        }
        None => FrameBuffer::new(key.format, key.width, key.height),
    }
}

/// Copy a raw payload into a packed frame of the same size. YUV layouts land
/// as I420, RGB layouts keep their format.
fn unpack(frame: &IncomingFrame, dst: &mut FrameBuffer) -> Result<()> {
    let payload = &frame.payload[..];
    let (w, h) = (frame.width as usize, frame.height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

    match frame.layout {
        WireLayout::I420 {
            y_stride,
            u_stride,
            v_stride,
        } => {
            let u_offset = plane_end(0, y_stride, h)?;
            let v_offset = plane_end(u_offset, u_stride, ch)?;
            copy_rows(payload, 0, y_stride, w, h, dst.plane_mut(0))?;
            copy_rows(payload, u_offset, u_stride, cw, ch, dst.plane_mut(1))?;
            copy_rows(payload, v_offset, v_stride, cw, ch, dst.plane_mut(2))
        }
        WireLayout::Nv12 { y_stride, uv_stride } => {
            let uv_offset = plane_end(0, y_stride, h)?;
            copy_rows(payload, 0, y_stride, w, h, dst.plane_mut(0))?;
            check_extent(payload, uv_offset, uv_stride, cw * 2, ch)?;
            for (plane, phase) in [(1, 0), (2, 1)] {
                let out = dst.plane_mut(plane);
                for row in 0..ch {
                    let src = &payload[uv_offset + row * uv_stride..][..cw * 2];
                    for (x, px) in out[row * cw..(row + 1) * cw].iter_mut().enumerate() {
                        *px = src[x * 2 + phase];
                    }
                }
            }
            Ok(())
        }
        WireLayout::Rgb24 { stride } | WireLayout::Bgra32 { stride } => {
            let row = dst.stride(0);
            copy_rows(payload, 0, stride, row, h, dst.data_mut())
        }
        WireLayout::Mjpeg => Err(VcamError::decode(SOURCE, "compressed payload has no raw planes")),
    }
}

fn overflow() -> VcamError {
    VcamError::decode(SOURCE, "plane extent overflows")
}

/// Byte offset just past `rows` rows of `stride` starting at `offset`
fn plane_end(offset: usize, stride: usize, rows: usize) -> Result<usize> {
    stride
        .checked_mul(rows)
        .and_then(|len| len.checked_add(offset))
        .ok_or_else(overflow)
}

/// Check the payload holds `rows` rows at `stride`, returning the bytes needed.
fn check_extent(
    payload: &[u8],
    offset: usize,
    stride: usize,
    row_bytes: usize,
    rows: usize,
) -> Result<usize> {
    if stride < row_bytes {
        return Err(VcamError::decode(
            SOURCE,
            format!("stride {stride} shorter than row of {row_bytes} bytes"),
        ));
    }
    let needed = plane_end(offset, stride, rows.saturating_sub(1))?
        .checked_add(row_bytes)
        .ok_or_else(overflow)?;
    if payload.len() < needed {
        return Err(VcamError::SizeMismatch {
            expected: needed,
            actual: payload.len(),
        });
    }
    Ok(needed)
}

fn copy_rows(
    payload: &[u8],
    offset: usize,
    stride: usize,
    row_bytes: usize,
    rows: usize,
    dst: &mut [u8],
) -> Result<()> {
    check_extent(payload, offset, stride, row_bytes, rows)?;
    for (row, out) in dst.chunks_exact_mut(row_bytes).take(rows).enumerate() {
        let start = offset + row * stride;
        out.copy_from_slice(&payload[start..start + row_bytes]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    const NO_CAP: (u32, u32) = (4096, 4096);

    fn to_i420(
        frame: &IncomingFrame,
        reuse: Option<FrameBuffer>,
        cap: (u32, u32),
    ) -> Result<FrameBuffer> {
        Normalizer::default().to_i420(frame, reuse, cap)
    }

    fn incoming(width: u32, height: u32, layout: WireLayout, payload: Vec<u8>) -> IncomingFrame {
        IncomingFrame {
            width,
            height,
            layout,
            payload: Bytes::from(payload),
            timestamp: Duration::ZERO,
        }
    }

    #[test]
    fn padded_i420_rows_are_compacted() {
        // 4x2 luma with 2 bytes of padding per row, 2x1 chroma with 1 byte
        let payload = vec![
            1, 2, 3, 4, 0, 0, //
            5, 6, 7, 8, 0, 0, //
            10, 11, 0, //
            20, 21, 0,
        ];
        let layout = WireLayout::I420 {
            y_stride: 6,
            u_stride: 3,
            v_stride: 3,
        };
        let out = to_i420(&incoming(4, 2, layout, payload), None, NO_CAP).unwrap();
        assert_eq!(out.plane(0), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(out.plane(1), &[10, 11]);
        assert_eq!(out.plane(2), &[20, 21]);
    }

    #[test]
    fn nv12_chroma_is_deinterleaved() {
        let payload = vec![9, 9, 9, 9, 100, 200];
        let layout = WireLayout::Nv12 {
            y_stride: 2,
            uv_stride: 2,
        };
        let out = to_i420(&incoming(2, 2, layout, payload), None, NO_CAP).unwrap();
        assert_eq!(out.plane(1), &[100]);
        assert_eq!(out.plane(2), &[200]);
    }

    #[test]
    fn bgra_is_converted_and_reuses_buffer() {
        let mut payload = Vec::new();
        for _ in 0..16 {
            payload.extend_from_slice(&[0, 0, 255, 255]);
        }
        let reuse = FrameBuffer::new(PixelFormat::I420, 16, 16).unwrap();
        let frame = incoming(4, 4, WireLayout::Bgra32 { stride: 16 }, payload);
        let out = to_i420(&frame, Some(reuse), NO_CAP).unwrap();
        assert_eq!(out.key(), FrameKey::new(4, 4, PixelFormat::I420));
        let [y, _, v] = crate::pipeline::convert::rgb_to_yuv([255, 0, 0]);
        assert!(out.plane(0).iter().all(|&p| p == y));
        assert!(out.plane(2).iter().all(|&p| p == v));
    }

    #[test]
    fn oversized_frames_fit_the_cap_in_either_orientation() {
        let rgb = vec![50; 400 * 200 * 3];
        let wide = incoming(400, 200, WireLayout::Rgb24 { stride: 1200 }, rgb);
        let out = to_i420(&wide, None, (200, 150)).unwrap();
        assert_eq!((out.width(), out.height()), (200, 100));

        let rgb = vec![50; 200 * 400 * 3];
        let tall = incoming(200, 400, WireLayout::Rgb24 { stride: 600 }, rgb);
        let out = to_i420(&tall, None, (200, 150)).unwrap();
        assert_eq!((out.width(), out.height()), (100, 200));
    }

    #[test]
    fn short_payload_is_rejected() {
        let frame = incoming(4, 4, WireLayout::packed_i420(4), vec![0; 10]);
        let err = to_i420(&frame, None, NO_CAP).unwrap_err();
        assert!(matches!(err, VcamError::SizeMismatch { .. }));
    }

    #[test]
    fn overflowing_strides_are_rejected() {
        let layout = WireLayout::I420 {
            y_stride: usize::MAX / 2,
            u_stride: 2,
            v_stride: 2,
        };
        let err = to_i420(&incoming(4, 4, layout, vec![0; 24]), None, NO_CAP).unwrap_err();
        assert!(matches!(err, VcamError::DecodeFailed { .. }), "{err:?}");

        let layout = WireLayout::Nv12 {
            y_stride: 4,
            uv_stride: usize::MAX / 2,
        };
        let err = to_i420(&incoming(4, 6, layout, vec![0; 36]), None, NO_CAP).unwrap_err();
        assert!(matches!(err, VcamError::DecodeFailed { .. }), "{err:?}");
    }

    #[test]
    fn capped_frames_are_written_into_the_recycled_buffer() {
        let mut normalizer = Normalizer::default();
        let frame = incoming(400, 200, WireLayout::packed_i420(400), vec![90; 400 * 200 * 3 / 2]);
        let reuse = FrameBuffer::new(PixelFormat::I420, 200, 100).unwrap();
        let ptr = reuse.data().as_ptr();

        let out = normalizer.to_i420(&frame, Some(reuse), (200, 150)).unwrap();
        assert_eq!(out.key(), FrameKey::new(200, 100, PixelFormat::I420));
        assert_eq!(out.data().as_ptr(), ptr);
        assert!(out.plane(0).iter().all(|&p| p == 90));

        let staged = normalizer.staging.as_ref().map(|f| f.data().as_ptr());
        let out = normalizer.to_i420(&frame, Some(out), (200, 150)).unwrap();
        assert_eq!(out.data().as_ptr(), ptr);
        assert_eq!(normalizer.staging.as_ref().map(|f| f.data().as_ptr()), staged);
    }

    #[test]
    fn packed_rgb_is_read_in_place() {
        let mut normalizer = Normalizer::default();
        let packed = incoming(8, 4, WireLayout::Rgb24 { stride: 24 }, vec![10; 8 * 4 * 3]);
        normalizer.to_i420(&packed, None, NO_CAP).unwrap();
        assert!(normalizer.staging.is_none());

        let padded = incoming(8, 4, WireLayout::Rgb24 { stride: 32 }, vec![10; 32 * 4]);
        let out = normalizer.to_i420(&padded, None, NO_CAP).unwrap();
        assert!(normalizer.staging.is_some());
        assert_eq!(out.plane(0)[0], crate::pipeline::convert::rgb_to_yuv([10, 10, 10])[0]);
    }

    #[test]
    fn mjpeg_payload_is_decoded() {
        let src = FrameBuffer::solid(PixelFormat::Rgb24, 16, 8, [200, 200, 200]).unwrap();
        let jpeg = decoder::encode_jpeg(&src, 90).unwrap();
        let out = to_i420(&incoming(0, 0, WireLayout::Mjpeg, jpeg), None, NO_CAP).unwrap();
        assert_eq!((out.width(), out.height(), out.format()), (16, 8, PixelFormat::I420));
    }
}
