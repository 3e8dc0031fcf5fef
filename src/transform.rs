//! Defines the image transformation applied by the second pipeline
//! stage.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;
use thiserror::Error;

/// How the source is fitted into the target box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    /// Scale to cover the whole box, cropping the overflow.
    Cover,
    /// Stretch to the exact box, ignoring the aspect ratio.
    Fill,
}

/// Which part of the source is kept when cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Center,
    Top,
    Bottom,
    Left,
    Right,
}

/// The encoding of the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    /// The MIME type of images encoded in this format.
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }
}

/// A resize-and-encode operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformSpec {
    pub width: u32,
    pub height: u32,
    pub fit: FitMode,
    pub anchor: Anchor,
    pub format: OutputFormat,
    pub quality: u8,
}

/// The transformation applied to every processed image.
pub const THUMBNAIL: TransformSpec = TransformSpec {
    width: 300,
    height: 300,
    fit: FitMode::Cover,
    anchor: Anchor::Center,
    format: OutputFormat::Jpeg,
    quality: 80,
};

/// A failed transformation.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Input buffer contains unsupported image format: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Failed to encode processed image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Transform task aborted: {0}")]
    Aborted(String),
}

/// A pure function from source bytes to transformed bytes.
pub trait ImageTransform: Send + Sync {
    fn apply(&self, source: &[u8], spec: &TransformSpec) -> Result<Vec<u8>, TransformError>;
}

/// The image codec backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCodec;

impl ImageTransform for ImageCodec {
    fn apply(&self, source: &[u8], spec: &TransformSpec) -> Result<Vec<u8>, TransformError> {
        let img = image::load_from_memory(source).map_err(TransformError::Decode)?;
        let resized = match spec.fit {
            FitMode::Cover => cover(&img, spec.width, spec.height, spec.anchor),
            FitMode::Fill => img.resize_exact(spec.width, spec.height, FilterType::Lanczos3),
        };
        encode(&resized, spec.format, spec.quality)
    }
}

/// Crop the largest region of `img` with the aspect ratio of `width`
/// x `height` around the anchor, then scale it to that box. Cropping
/// first keeps memory bounded by the source size.
fn cover(img: &DynamicImage, width: u32, height: u32, anchor: Anchor) -> DynamicImage {
    let (src_w, src_h) = img.dimensions();
    let (crop_w, crop_h) = if src_w as u64 * height as u64 > src_h as u64 * width as u64 {
        let w = (src_h as u64 * width as u64 / height as u64) as u32;
        (w.clamp(1, src_w), src_h)
    } else {
        let h = (src_w as u64 * height as u64 / width as u64) as u32;
        (src_w, h.clamp(1, src_h))
    };

    let (spare_w, spare_h) = (src_w - crop_w, src_h - crop_h);
    let (x, y) = match anchor {
        Anchor::Center => (spare_w / 2, spare_h / 2),
        Anchor::Top => (spare_w / 2, 0),
        Anchor::Bottom => (spare_w / 2, spare_h),
        Anchor::Left => (0, spare_h / 2),
        Anchor::Right => (spare_w, spare_h / 2),
    };
    img.crop_imm(x, y, crop_w, crop_h)
        .resize_exact(width, height, FilterType::Lanczos3)
}

fn encode(
    img: &DynamicImage,
    format: OutputFormat,
    quality: u8,
) -> Result<Vec<u8>, TransformError> {
    let mut out = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb = img.to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
            encoder
                .encode(rgb.as_raw(), rgb.width(), rgb.height(), image::ColorType::Rgb8)
                .map_err(TransformError::Encode)?;
        }
        OutputFormat::Png => {
            img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
                .map_err(TransformError::Encode)?;
        }
    }
    Ok(out)
}
