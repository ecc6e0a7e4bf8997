//! Frame transform: raw pixels in, one JPEG packet out
//!
//! Pure per-frame work with no device state; the scratch buffers are reused
//! across calls to avoid per-frame heap churn, which is a performance
//! contract only.

pub mod yuv;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageBuffer, Rgb};
use jpeg_decoder::Decoder;

use crate::capture::frame::{Frame, PixelFormat};
use crate::error::TransformError;
use crate::TransformConfig;

/// Stateless-per-frame JPEG encoder with reusable scratch space.
pub struct JpegTransform {
    quality: u8,
    target_width: Option<u32>,
    rgb_scratch: Vec<u8>,
    jpeg_scratch: Vec<u8>,
}

impl JpegTransform {
    pub fn new(config: &TransformConfig) -> Result<Self, TransformError> {
        if !(1..=100).contains(&config.jpeg_quality) {
            return Err(TransformError::InvalidQuality(config.jpeg_quality));
        }
        Ok(Self {
            quality: config.jpeg_quality,
            target_width: config.target_width,
            rgb_scratch: Vec::new(),
            jpeg_scratch: Vec::new(),
        })
    }

    /// Encode one frame. Failures are per-frame: the caller skips the frame
    /// and keeps the stream running.
    pub fn encode(&mut self, frame: &Frame) -> Result<Bytes, TransformError> {
        let meta = &frame.meta;
        let (width, height) = match meta.format {
            PixelFormat::Yuyv => {
                yuv::yuyv_to_rgb(frame.data(), meta.width, meta.height, &mut self.rgb_scratch)?;
                (meta.width, meta.height)
            }
            PixelFormat::Rgb24 => {
                let expected = meta.width as usize * meta.height as usize * 3;
                if frame.len() < expected {
                    return Err(TransformError::Truncated {
                        expected,
                        actual: frame.len(),
                    });
                }
                self.rgb_scratch.clear();
                self.rgb_scratch.extend_from_slice(&frame.data()[..expected]);
                (meta.width, meta.height)
            }
            PixelFormat::Mjpeg => self.decode_mjpeg(frame.data())?,
        };
        self.encode_rgb(width, height)
    }

    /// Decode a camera MJPEG frame into the RGB scratch buffer so quality
    /// and size settings apply on the way back out.
    fn decode_mjpeg(&mut self, data: &[u8]) -> Result<(u32, u32), TransformError> {
        let mut decoder = Decoder::new(data);
        let pixels = decoder.decode()?;
        let info = decoder
            .info()
            .ok_or_else(|| TransformError::Unsupported("JPEG stream without header".into()))?;
        if info.pixel_format != jpeg_decoder::PixelFormat::RGB24 {
            return Err(TransformError::Unsupported(format!(
                "JPEG pixel format {:?}",
                info.pixel_format
            )));
        }
        self.rgb_scratch.clear();
        self.rgb_scratch.extend_from_slice(&pixels);
        Ok((info.width as u32, info.height as u32))
    }

    fn encode_rgb(&mut self, width: u32, height: u32) -> Result<Bytes, TransformError> {
        self.jpeg_scratch.clear();
        let mut encoder = JpegEncoder::new_with_quality(&mut self.jpeg_scratch, self.quality);

        match self.target_width {
            Some(target) if target > 0 && target < width => {
                let scaled_height =
                    ((height as u64 * target as u64) / width as u64).max(1) as u32;
                let view =
                    ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, self.rgb_scratch.as_slice())
                        .ok_or_else(|| {
                            TransformError::Unsupported(format!(
                                "pixel buffer does not match {width}x{height}"
                            ))
                        })?;
                let resized =
                    image::imageops::resize(&view, target, scaled_height, FilterType::Triangle);
                encoder.encode(
                    resized.as_raw(),
                    target,
                    scaled_height,
                    ExtendedColorType::Rgb8,
                )?;
            }
            _ => {
                encoder.encode(&self.rgb_scratch, width, height, ExtendedColorType::Rgb8)?;
            }
        }

        Ok(Bytes::copy_from_slice(&self.jpeg_scratch))
    }
}
