//! DCT perceptual hash.
//!
//! Produces a fixed 64-bit fingerprint of an image's low-frequency luminance
//! structure. Lightly transformed copies (re-encoded, resized, mildly edited)
//! land within a small Hamming distance of the source; unrelated images are,
//! with high probability, far apart. Equality or small distance is
//! probabilistic evidence of "same picture" and must never stand in for
//! byte-level identity.
//!
//! Pipeline: grayscale → 32×32 downsample → 2D DCT-II → top-left 8×8
//! coefficient block → threshold each coefficient against the block median.

use std::f64::consts::PI;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use image::imageops::FilterType;
use image::DynamicImage;

/// Downsample grid fed to the DCT.
const SAMPLE_SIZE: usize = 32;
/// Low-frequency block kept from the DCT output; its square is the hash width.
const BLOCK_SIZE: usize = 8;

/// Hash width in bits.
pub const HASH_BITS: u32 = (BLOCK_SIZE * BLOCK_SIZE) as u32;

/// 64-bit perceptual fingerprint, comparable by Hamming distance.
///
/// Renders as (and parses from) a 16-digit lowercase hex string, which is
/// also its JSON representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    /// Number of differing bits between two fingerprints.
    pub fn distance(self, other: PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PerceptualHash {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(PerceptualHash)
    }
}

impl serde::Serialize for PerceptualHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for PerceptualHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compute the perceptual hash of a decoded image.
///
/// Deterministic: the same pixel data always yields the same hash, regardless
/// of the container it arrived in.
pub fn hash_image(img: &DynamicImage) -> PerceptualHash {
    let size = SAMPLE_SIZE as u32;
    let gray = image::imageops::resize(&img.to_luma8(), size, size, FilterType::Lanczos3);

    let mut pixels = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for (x, y, px) in gray.enumerate_pixels() {
        pixels[y as usize][x as usize] = px.0[0] as f64;
    }

    let freq = dct_2d(&pixels);

    // Low-frequency block, row-major. The median threshold makes the hash
    // invariant to overall brightness and contrast scaling.
    let mut block = [0f64; BLOCK_SIZE * BLOCK_SIZE];
    for u in 0..BLOCK_SIZE {
        for v in 0..BLOCK_SIZE {
            block[u * BLOCK_SIZE + v] = freq[u][v];
        }
    }
    let median = median_of(&block);

    let mut bits: u64 = 0;
    for (i, coeff) in block.iter().enumerate() {
        if *coeff > median {
            bits |= 1 << (HASH_BITS as usize - 1 - i);
        }
    }
    PerceptualHash(bits)
}

/// Separable 2D DCT-II over the downsampled grid. No normalization factor:
/// the median threshold is scale-invariant, so none is needed.
fn dct_2d(input: &[[f64; SAMPLE_SIZE]; SAMPLE_SIZE]) -> [[f64; SAMPLE_SIZE]; SAMPLE_SIZE] {
    let n = SAMPLE_SIZE;
    let mut cos_table = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for (k, row) in cos_table.iter_mut().enumerate() {
        for (i, cell) in row.iter_mut().enumerate() {
            *cell = (PI * (i as f64 + 0.5) * k as f64 / n as f64).cos();
        }
    }

    // Rows first, then columns.
    let mut rows = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for y in 0..n {
        for k in 0..n {
            let mut sum = 0f64;
            for x in 0..n {
                sum += input[y][x] * cos_table[k][x];
            }
            rows[y][k] = sum;
        }
    }

    let mut out = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for v in 0..n {
        for u in 0..n {
            let mut sum = 0f64;
            for y in 0..n {
                sum += rows[y][v] * cos_table[u][y];
            }
            out[u][v] = sum;
        }
    }
    out
}

fn median_of(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn rings(size: u32) -> DynamicImage {
        let half = size as f64 / 2.0;
        let img = ImageBuffer::from_fn(size, size, |x, y| {
            let dx = x as f64 - half;
            let dy = y as f64 - half;
            let r = (dx * dx + dy * dy).sqrt();
            Luma([((r / 24.0).sin() * 110.0 + 128.0) as u8])
        });
        DynamicImage::ImageLuma8(img)
    }

    fn corner_disk(size: u32) -> DynamicImage {
        let img = ImageBuffer::from_fn(size, size, |x, y| {
            let dx = x as f64 - size as f64 / 4.0;
            let dy = y as f64 - size as f64 / 4.0;
            if (dx * dx + dy * dy).sqrt() < size as f64 / 5.0 {
                Luma([235u8])
            } else {
                Luma([25u8])
            }
        });
        DynamicImage::ImageLuma8(img)
    }

    fn bottom_band(size: u32) -> DynamicImage {
        let img = ImageBuffer::from_fn(size, size, |_x, y| {
            if y > size * 3 / 4 {
                Luma([235u8])
            } else {
                Luma([25u8])
            }
        });
        DynamicImage::ImageLuma8(img)
    }

    #[test]
    fn test_deterministic() {
        let img = rings(256);
        assert_eq!(hash_image(&img), hash_image(&img));
    }

    #[test]
    fn test_distance_zero_for_self() {
        let h = hash_image(&rings(256));
        assert_eq!(h.distance(h), 0);
    }

    #[test]
    fn test_distance_symmetric() {
        let a = hash_image(&rings(256));
        let b = hash_image(&corner_disk(256));
        assert_eq!(a.distance(b), b.distance(a));
    }

    #[test]
    fn test_resize_is_near() {
        let base = rings(256);
        let smaller = base.resize_exact(96, 96, FilterType::Lanczos3);
        let dist = hash_image(&base).distance(hash_image(&smaller));
        assert!(dist <= 10, "resized copy drifted too far: {}", dist);
    }

    #[test]
    fn test_unrelated_images_are_far() {
        let a = hash_image(&corner_disk(256));
        let b = hash_image(&bottom_band(256));
        assert!(
            a.distance(b) > 10,
            "structurally different images too close: {}",
            a.distance(b)
        );
    }

    #[test]
    fn test_inverted_image_is_far() {
        let base = rings(256);
        let mut inverted = base.clone();
        inverted.invert();
        let dist = hash_image(&base).distance(hash_image(&inverted));
        assert!(dist > 40, "inversion should flip most bits, got {}", dist);
    }

    #[test]
    fn test_hex_round_trip() {
        let h = PerceptualHash(0x0f1e_2d3c_4b5a_6978);
        let parsed: PerceptualHash = h.to_string().parse().unwrap();
        assert_eq!(h, parsed);
        assert_eq!(h.to_string(), "0f1e2d3c4b5a6978");
    }

    #[test]
    fn test_hex_width_is_stable() {
        assert_eq!(PerceptualHash(1).to_string().len(), 16);
        assert_eq!(PerceptualHash(u64::MAX).to_string().len(), 16);
    }
}
