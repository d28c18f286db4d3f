//! Image fingerprint extraction.
//!
//! Turns raw upload bytes into everything the engine stores about an image:
//! a normalized JPEG rendition, an exact SHA-256 content hash of those
//! normalized bytes, a 64-bit perceptual hash, and best-effort EXIF metadata.
//! Pure and synchronous; the caller owns persistence.
//!
//! Normalization bounds both dimensions (never upscaling) and re-encodes at a
//! fixed quality, so the same picture uploaded as PNG, WebP, or an oversized
//! JPEG hashes to the same exact digest.

use std::collections::BTreeMap;
use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, ImageReader};
use sha2::{Digest, Sha256};

use crate::phash::{self, PerceptualHash};

/// Hard cap on raw upload size; larger inputs are rejected before decoding.
const MAX_SOURCE_BYTES: usize = 64 * 1024 * 1024;
/// Hard cap on either source dimension, checked from the header before the
/// full decode (decompression-bomb protection).
const MAX_SOURCE_DIMENSION: u32 = 16_384;
/// Most EXIF entries kept per image.
const MAX_METADATA_FIELDS: usize = 64;
/// Longest rendered EXIF value kept, in characters.
const MAX_METADATA_VALUE_CHARS: usize = 256;

/// Extraction error. Both variants are ingestion-time rejections of caller
/// input; neither is retryable.
#[derive(Debug)]
pub enum ExtractError {
    /// Decodable, but not one of the accepted raster formats.
    UnsupportedFormat(String),
    /// Undecodable, truncated, or over the size guards.
    CorruptImage(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedFormat(fmt) => {
                write!(f, "unsupported image format: {}", fmt)
            }
            ExtractError::CorruptImage(e) => write!(f, "corrupt image: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Everything computed from one uploaded image.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    /// Normalized JPEG bytes; this is what gets persisted and served.
    pub normalized: Vec<u8>,
    /// SHA-256 hex digest of `normalized`.
    pub content_hash: String,
    pub perceptual_hash: PerceptualHash,
    /// EXIF tag name → rendered value, read from the original bytes
    /// (normalization strips EXIF). Empty when absent or unparseable.
    pub metadata: BTreeMap<String, String>,
    /// Normalized pixel dimensions.
    pub width: u32,
    pub height: u32,
}

/// Decode, normalize, and fingerprint one uploaded image.
///
/// `max_dimension` bounds the normalized output (sources below the bound are
/// left at their own size); `jpeg_quality` is the fixed re-encode quality.
pub fn extract(
    raw: &[u8],
    max_dimension: u32,
    jpeg_quality: u8,
) -> Result<Fingerprint, ExtractError> {
    if raw.len() > MAX_SOURCE_BYTES {
        return Err(ExtractError::CorruptImage(format!(
            "input exceeds {} byte limit",
            MAX_SOURCE_BYTES
        )));
    }

    let reader = ImageReader::new(Cursor::new(raw))
        .with_guessed_format()
        .map_err(|e| ExtractError::CorruptImage(e.to_string()))?;
    let format = match reader.format() {
        Some(f) => f,
        None => {
            return Err(ExtractError::CorruptImage(
                "unrecognized image container".to_string(),
            ))
        }
    };
    if !matches!(
        format,
        ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP | ImageFormat::Gif
    ) {
        return Err(ExtractError::UnsupportedFormat(
            format.to_mime_type().to_string(),
        ));
    }

    // Header-declared dimensions, without paying for a decode.
    let (src_w, src_h) = reader
        .into_dimensions()
        .map_err(|e| ExtractError::CorruptImage(e.to_string()))?;
    if src_w > MAX_SOURCE_DIMENSION || src_h > MAX_SOURCE_DIMENSION {
        return Err(ExtractError::CorruptImage(format!(
            "{}x{} exceeds the {} px decode limit",
            src_w, src_h, MAX_SOURCE_DIMENSION
        )));
    }

    let img = ImageReader::new(Cursor::new(raw))
        .with_guessed_format()
        .map_err(|e| ExtractError::CorruptImage(e.to_string()))?
        .decode()
        .map_err(|e| ExtractError::CorruptImage(e.to_string()))?;

    let normalized_img = normalize(img, max_dimension);
    let normalized = encode_jpeg(&normalized_img, jpeg_quality)?;

    let mut hasher = Sha256::new();
    hasher.update(&normalized);
    let content_hash = hex::encode(hasher.finalize());

    let perceptual_hash = phash::hash_image(&normalized_img);
    let metadata = read_exif(raw);

    Ok(Fingerprint {
        width: normalized_img.width(),
        height: normalized_img.height(),
        normalized,
        content_hash,
        perceptual_hash,
        metadata,
    })
}

/// Downscale to fit `max_dimension` (never upscale) and flatten to RGB.
fn normalize(img: DynamicImage, max_dimension: u32) -> DynamicImage {
    let img = if img.width() > max_dimension || img.height() > max_dimension {
        img.thumbnail(max_dimension, max_dimension)
    } else {
        img
    };
    DynamicImage::ImageRgb8(img.to_rgb8())
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ExtractError> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode_image(&rgb)
        .map_err(|e| ExtractError::CorruptImage(e.to_string()))?;
    Ok(out)
}

/// Best-effort EXIF scrape from the primary image IFD. Unknown tags and
/// parse failures are skipped, never surfaced.
fn read_exif(raw: &[u8]) -> BTreeMap<String, String> {
    let mut cursor = Cursor::new(raw);
    let parsed = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(parsed) => parsed,
        Err(_) => return BTreeMap::new(),
    };

    let mut fields = BTreeMap::new();
    for field in parsed.fields() {
        if field.ifd_num != exif::In::PRIMARY {
            continue;
        }
        if fields.len() >= MAX_METADATA_FIELDS {
            break;
        }
        let tag = field.tag.to_string();
        if tag.starts_with("Tag(") {
            continue;
        }
        let rendered = field.display_value().with_unit(&parsed).to_string();
        let bounded: String = rendered.chars().take(MAX_METADATA_VALUE_CHARS).collect();
        fields.insert(tag, bounded);
    }
    fields
}
