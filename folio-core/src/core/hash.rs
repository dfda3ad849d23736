use crate::core::raster::{self, RasterError};
use image::imageops::{self, FilterType};
use image::DynamicImage;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Bound applied before digesting so identity follows rendered pixels rather
/// than the file encoding.
pub const CONTENT_HASH_CANVAS: u32 = 1024;

const DHASH_WIDTH: u32 = 9;
const DHASH_HEIGHT: u32 = 8;
const AHASH_SIZE: u32 = 32;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Undecodable image: {0}")]
    Undecodable(#[from] RasterError),

    #[error("Hash computation failed: {message}")]
    ComputationFailed { message: String },
}

/// Service for computing identity and similarity hashes for images
#[derive(Debug, Clone)]
pub struct HashService {
    canvas_dimension: u32,
}

impl HashService {
    pub fn new() -> Self {
        Self {
            canvas_dimension: CONTENT_HASH_CANVAS,
        }
    }

    pub fn with_canvas_dimension(canvas_dimension: u32) -> Self {
        Self {
            canvas_dimension: canvas_dimension.max(1),
        }
    }

    /// Compute SHA-256 content hash over the normalized pixel buffer
    /// This is the image's identity, stable across re-encodes of the same pixels
    pub fn compute_content_hash(&self, bytes: &[u8]) -> Result<String, HashError> {
        let img = raster::decode(bytes)?;
        Ok(self.content_hash_of(&img))
    }

    pub fn content_hash_of(&self, img: &DynamicImage) -> String {
        let flat = raster::flatten_on_white(img);
        let bounded = raster::fit_within(&flat, self.canvas_dimension);

        let mut hasher = Sha256::new();
        hasher.update(bounded.as_raw());
        format!("{:x}", hasher.finalize())
    }

    /// 64-bit difference hash as 16 hex characters
    pub fn compute_difference_hash(&self, bytes: &[u8]) -> Result<String, HashError> {
        let img = raster::decode(bytes)?;
        Ok(Self::difference_hash(&img))
    }

    /// Downscale to 9×8 luminance and emit one bit per pixel, set when a pixel
    /// is brighter than its right-hand neighbour.
    pub fn difference_hash(img: &DynamicImage) -> String {
        let luma = raster::to_luma(&raster::flatten_on_white(img));
        let small = imageops::resize(&luma, DHASH_WIDTH, DHASH_HEIGHT, FilterType::Triangle);

        let mut bits: u64 = 0;
        for y in 0..DHASH_HEIGHT {
            for x in 0..DHASH_WIDTH - 1 {
                let left = small.get_pixel(x, y).0[0];
                let right = small.get_pixel(x + 1, y).0[0];
                bits = (bits << 1) | u64::from(left > right);
            }
        }

        format!("{:016x}", bits)
    }

    /// Average hash over a 32×32 downsample, 256 hex characters
    pub fn compute_average_hash(&self, bytes: &[u8]) -> Result<String, HashError> {
        let img = raster::decode(bytes)?;
        Self::average_hash(&img)
    }

    pub fn average_hash(img: &DynamicImage) -> Result<String, HashError> {
        let luma = raster::to_luma(&raster::flatten_on_white(img));
        let small = imageops::resize(&luma, AHASH_SIZE, AHASH_SIZE, FilterType::Triangle);

        let values: Vec<u8> = small.pixels().map(|p| p.0[0]).collect();
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64;

        let mut hex = String::with_capacity(values.len() / 4);
        for nibble in values.chunks(4) {
            let value = nibble
                .iter()
                .fold(0u32, |acc, &v| (acc << 1) | u32::from(v as f64 > mean));
            let digit = char::from_digit(value, 16).ok_or_else(|| HashError::ComputationFailed {
                message: format!("nibble out of range: {}", value),
            })?;
            hex.push(digit);
        }

        Ok(hex)
    }

    /// Verify if two encoded images render to the same content
    pub fn verify_identical_content(&self, first: &[u8], second: &[u8]) -> Result<bool, HashError> {
        let hash1 = self.compute_content_hash(first)?;
        let hash2 = self.compute_content_hash(second)?;
        Ok(hash1 == hash2)
    }
}

impl Default for HashService {
    fn default() -> Self {
        Self::new()
    }
}

/// Fraction of agreeing bits between two equal-length hex hashes, in [0, 1].
///
/// Each hex character contributes four bits. A non-hex character only agrees
/// with an identical character, and then counts as four agreeing bits. Hashes
/// of different length (or empty ones) score 0.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let agreeing: u32 = a
        .bytes()
        .zip(b.bytes())
        .map(|(x, y)| {
            match ((x as char).to_digit(16), (y as char).to_digit(16)) {
                (Some(dx), Some(dy)) => 4 - (dx ^ dy).count_ones(),
                _ if x == y => 4,
                _ => 0,
            }
        })
        .sum();

    agreeing as f64 / (a.len() * 4) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage};

    fn create_test_image(width: u32, height: u32) -> RgbImage {
        ImageBuffer::from_fn(width, height, |x, y| {
            let intensity = ((x * 3 + y) % 256) as u8;
            Rgb([intensity, intensity, intensity])
        })
    }

    fn encode_png(img: &RgbImage) -> Vec<u8> {
        let mut buffer = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buffer, image::ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_compute_content_hash() {
        let bytes = encode_png(&create_test_image(64, 32));
        let hash_service = HashService::new();
        let hash = hash_service.compute_content_hash(&bytes).unwrap();

        // Verify hash is consistent
        let hash2 = hash_service.compute_content_hash(&bytes).unwrap();
        assert_eq!(hash, hash2);

        // Verify hash format (64 lowercase hex characters for SHA-256)
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_content_hash_ignores_encoding() {
        let img = create_test_image(40, 40);
        let png = encode_png(&img);
        let mut bmp = std::io::Cursor::new(Vec::new());
        img.write_to(&mut bmp, image::ImageFormat::Bmp).unwrap();

        let hash_service = HashService::new();
        assert!(hash_service
            .verify_identical_content(&png, &bmp.into_inner())
            .unwrap());
    }

    #[test]
    fn test_different_pixels_different_hash() {
        let hash_service = HashService::new();
        let a = encode_png(&create_test_image(32, 32));
        let b = encode_png(&RgbImage::from_pixel(32, 32, Rgb([10, 20, 30])));
        assert!(!hash_service.verify_identical_content(&a, &b).unwrap());
    }

    #[test]
    fn test_undecodable_input_is_error() {
        let hash_service = HashService::new();
        assert!(matches!(
            hash_service.compute_content_hash(b"not an image"),
            Err(HashError::Undecodable(_))
        ));
    }

    #[test]
    fn test_difference_hash_format() {
        let img = DynamicImage::ImageRgb8(create_test_image(90, 80));
        let hash = HashService::difference_hash(&img);
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_difference_hash_of_gradient() {
        // Brightness falls left to right, so every comparison sets its bit.
        let img = ImageBuffer::from_fn(90, 80, |x, _| {
            let v = 255 - (x * 255 / 89) as u8;
            Rgb([v, v, v])
        });
        let hash = HashService::difference_hash(&DynamicImage::ImageRgb8(img));
        assert_eq!(hash, "ffffffffffffffff");
    }

    #[test]
    fn test_average_hash_format() {
        let img = DynamicImage::ImageRgb8(create_test_image(512, 512));
        let hash = HashService::average_hash(&img).unwrap();
        assert_eq!(hash.len(), 256);

        // A flat image never exceeds its own mean.
        let flat = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([200, 200, 200])));
        assert_eq!(HashService::average_hash(&flat).unwrap(), "0".repeat(256));
    }

    #[test]
    fn test_similarity_identity_and_length_mismatch() {
        let h = "a1b2c3d4e5f60718";
        assert_eq!(similarity(h, h), 1.0);
        assert_eq!(similarity(h, "a1b2"), 0.0);
        assert_eq!(similarity("", ""), 0.0);
    }

    #[test]
    fn test_similarity_is_bit_level() {
        // 4 differing bits out of 64.
        assert_eq!(similarity("0000000000000000", "000000000000000f"), 60.0 / 64.0);
        // 24 differing bits out of 64.
        assert_eq!(similarity("0000000000000000", "0000000000ffffff"), 40.0 / 64.0);
    }
}
