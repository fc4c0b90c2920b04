use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};
use tracing::debug;

use super::frame::{AspectPolicy, FormatDescriptor, FrameBuffer, PixelFormat};
use crate::error::{Result, VcamError};
use crate::pipeline::convert::FormatConverter;

/// Decode a JPEG/PNG file into an RGB frame
pub fn decode_image_file(path: &Path) -> Result<FrameBuffer> {
    let data = std::fs::read(path).map_err(|e| VcamError::io(path, e))?;
    decode_image_bytes(&data, &path.display().to_string())
}

/// Decode in-memory JPEG/PNG data into an RGB frame
pub fn decode_image_bytes(data: &[u8], source_name: &str) -> Result<FrameBuffer> {
    let image = image::load_from_memory(data).map_err(|e| VcamError::decode(source_name, e))?;
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    debug!(source = source_name, width, height, "decoded image");
    FrameBuffer::from_raw(PixelFormat::Rgb24, width, height, rgb.into_raw())
}

/// Decode one MJPEG frame into an RGB frame
pub fn decode_mjpeg(data: &[u8]) -> Result<FrameBuffer> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode().map_err(|e| VcamError::decode("mjpeg", e))?;
    let info = decoder
        .info()
        .ok_or_else(|| VcamError::decode("mjpeg", "missing frame header"))?;
    let (width, height) = (info.width as u32, info.height as u32);

    let rgb = match info.pixel_format {
        JpegPixelFormat::RGB24 => pixels,
        JpegPixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        other => {
            return Err(VcamError::decode(
                "mjpeg",
                format!("unsupported jpeg pixel format {other:?}"),
            ))
        }
    };
    FrameBuffer::from_raw(PixelFormat::Rgb24, width, height, rgb)
}

/// Decode image data straight into a frame of the requested format and size
pub fn frame_from_encoded(data: &[u8], target: &FormatDescriptor) -> Result<FrameBuffer> {
    let decoded = decode_image_bytes(data, "encoded image")?;
    let mut frame = FrameBuffer::new(target.pixel_format, target.width, target.height)?;
    FormatConverter::default().adapt(&decoded, &mut frame, target)?;
    Ok(frame)
}

/// Size of a `width`x`height` image scaled down to fit inside `max` with its
/// aspect ratio kept. Images that already fit keep their size.
pub fn fitted_size(width: u32, height: u32, max: (u32, u32)) -> (u32, u32) {
    let (max_w, max_h) = max;
    if width <= max_w && height <= max_h {
        return (width, height);
    }
    let bounds = FormatDescriptor::new(max_w, max_h, PixelFormat::Rgb24);
    let rect = FormatConverter::content_rect(width, height, &bounds);
    (rect.width, rect.height)
}

/// Scale a frame down so it fits inside `max` (aspect preserved).
/// Frames that already fit are returned unchanged.
pub fn fit_within(frame: FrameBuffer, max: (u32, u32)) -> Result<FrameBuffer> {
    let (width, height) = fitted_size(frame.width(), frame.height(), max);
    if (width, height) == (frame.width(), frame.height()) {
        return Ok(frame);
    }

    let target =
        FormatDescriptor::new(width, height, frame.format()).with_aspect(AspectPolicy::Stretch);
    let mut scaled = FrameBuffer::new(frame.format(), width, height)?;
    FormatConverter::default().adapt(&frame, &mut scaled, &target)?;
    debug!(
        from_width = frame.width(),
        from_height = frame.height(),
        to_width = width,
        to_height = height,
        "pre-scaled source frame"
    );
    Ok(scaled)
}

/// JPEG snapshot of a frame, for still-photo capture paths
pub fn encode_jpeg(frame: &FrameBuffer, quality: u8) -> Result<Vec<u8>> {
    let rgb;
    let pixels = if frame.format() == PixelFormat::Rgb24 {
        frame.data()
    } else {
        let mut converted = FrameBuffer::new(PixelFormat::Rgb24, frame.width(), frame.height())?;
        let target = FormatDescriptor::of(&converted);
        FormatConverter::default().adapt(frame, &mut converted, &target)?;
        rgb = converted;
        rgb.data()
    };

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(pixels, frame.width(), frame.height(), image::ExtendedColorType::Rgb8)
        .map_err(|e| VcamError::decode("jpeg encoder", e))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg_of(frame: &FrameBuffer) -> Vec<u8> {
        encode_jpeg(frame, 95).unwrap()
    }

    #[test]
    fn jpeg_snapshot_decodes_back() {
        let frame = FrameBuffer::solid(PixelFormat::I420, 32, 16, [40, 160, 220]).unwrap();
        let jpeg = jpeg_of(&frame);
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = decode_mjpeg(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
        let px = &decoded.data()[..3];
        for (got, want) in px.iter().zip([40u8, 160, 220]) {
            assert!((*got as i32 - want as i32).abs() <= 6, "{px:?}");
        }
    }

    #[test]
    fn encoded_data_lands_in_requested_format() {
        let frame = FrameBuffer::solid(PixelFormat::Rgb24, 64, 48, [255, 255, 255]).unwrap();
        let target = FormatDescriptor::new(20, 10, PixelFormat::Nv12);
        let out = frame_from_encoded(&jpeg_of(&frame), &target).unwrap();
        assert_eq!((out.width(), out.height(), out.format()), (20, 10, PixelFormat::Nv12));
    }

    #[test]
    fn garbage_is_a_decode_failure() {
        assert!(matches!(
            decode_image_bytes(b"not an image", "garbage"),
            Err(VcamError::DecodeFailed { .. })
        ));
        assert!(matches!(decode_mjpeg(b"\xFF\xD8junk"), Err(VcamError::DecodeFailed { .. })));
    }

    #[test]
    fn fit_within_preserves_aspect() {
        let frame = FrameBuffer::new(PixelFormat::Rgb24, 1920, 1080).unwrap();
        let scaled = fit_within(frame, (640, 640)).unwrap();
        assert_eq!((scaled.width(), scaled.height()), (640, 360));

        let small = FrameBuffer::new(PixelFormat::Rgb24, 100, 50).unwrap();
        assert_eq!(fit_within(small, (640, 640)).unwrap().width(), 100);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            decode_image_file(Path::new("/nonexistent/still.png")),
            Err(VcamError::Io { .. })
        ));
    }
}
