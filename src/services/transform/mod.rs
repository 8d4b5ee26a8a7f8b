//! Image transformation: fit to width, grayscale, JPEG re-encode, watermark.
//!
//! Everything here works on in-memory buffers and is CPU bound; async
//! callers should run it on a blocking thread.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, ImageFormat};

use crate::constants::image::{
    DEFAULT_BRAND, MAX_WIDTH, QUALITY, WATERMARK_HEIGHT, WATERMARK_WIDTH,
};

pub mod font;

/// Text position inside the watermark box: left inset and baseline.
const TEXT_X: i64 = 10;
const TEXT_BASELINE: i64 = 35;
const TEXT_SCALE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOptions {
    pub max_width: u32,
    pub quality: u8,
    pub watermark_text: String,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self::with_brand(DEFAULT_BRAND)
    }
}

impl TransformOptions {
    pub fn with_brand(brand: &str) -> Self {
        Self {
            max_width: MAX_WIDTH,
            quality: QUALITY,
            watermark_text: format!("Processed by {brand}"),
        }
    }
}

/// Run the full pipeline over raw image bytes and return JPEG bytes.
pub fn transform(bytes: &[u8], options: &TransformOptions) -> Result<Vec<u8>, TransformError> {
    let image = image::load_from_memory(bytes)?;
    let resized = fit_width(image, options.max_width);
    let gray = DynamicImage::ImageLuma8(resized.to_luma8());
    let encoded = encode_jpeg(&gray, options.quality)?;

    watermark(&encoded, &options.watermark_text, options.quality)
}

/// Shrink to `max_width` keeping the aspect ratio. Never enlarges.
pub fn fit_width(image: DynamicImage, max_width: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width <= max_width {
        return image;
    }

    let scaled = (u64::from(height) * u64::from(max_width)) as f64 / f64::from(width);
    let new_height = (scaled.round() as u32).max(1);
    image.resize_exact(max_width, new_height, FilterType::Lanczos3)
}

/// Second pass over already-encoded JPEG bytes: composite the watermark
/// text into the bottom-right corner and re-encode.
pub fn watermark(jpeg: &[u8], text: &str, quality: u8) -> Result<Vec<u8>, TransformError> {
    let mut canvas = image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)?.to_luma8();
    draw_watermark(&mut canvas, text);
    encode_jpeg(&DynamicImage::ImageLuma8(canvas), quality)
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, TransformError> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    image.write_with_encoder(encoder)?;
    Ok(buf)
}

/// Blend `text` in white at 50% opacity inside a box anchored south-east.
/// Parts of the box that fall outside a small image are clipped.
fn draw_watermark(canvas: &mut GrayImage, text: &str) {
    let (width, height) = canvas.dimensions();
    let box_left = i64::from(width) - i64::from(WATERMARK_WIDTH);
    let box_top = i64::from(height) - i64::from(WATERMARK_HEIGHT);
    let box_right = i64::from(width);

    let scale = i64::from(TEXT_SCALE);
    let text_top = box_top + TEXT_BASELINE - i64::from(font::GLYPH_HEIGHT) * scale;

    for (index, c) in text.chars().enumerate() {
        let glyph_left = box_left + TEXT_X + index as i64 * i64::from(font::ADVANCE) * scale;
        if glyph_left >= box_right {
            break;
        }

        for (row, bits) in font::glyph(c).iter().enumerate() {
            for col in 0..font::GLYPH_WIDTH {
                if (bits >> (font::GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                    continue;
                }
                let x0 = glyph_left + i64::from(col) * scale;
                let y0 = text_top + row as i64 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        blend_white(canvas, x0 + dx, y0 + dy);
                    }
                }
            }
        }
    }
}

fn blend_white(canvas: &mut GrayImage, x: i64, y: i64) {
    let (width, height) = canvas.dimensions();
    if x < 0 || y < 0 || x >= i64::from(width) || y >= i64::from(height) {
        return;
    }
    let pixel = canvas.get_pixel_mut(x as u32, y as u32);
    let value = pixel.0[0];
    pixel.0[0] = value + (255 - value) / 2;
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("{0}")]
    Image(#[from] image::ImageError),

    #[error("transform task aborted: {0}")]
    Aborted(String),
}
