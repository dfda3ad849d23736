//! Deterministic artefact builders.
//!
//! ```text
//! original ──► working ──► prepared ──► normalized
//!                 │
//!                 └──────► thumbnail
//! ```
//!
//! Working is the only tier ever built from original bytes. Each builder is a
//! pure function of its input blob, the preparation (prepared tier only) and
//! the policy, so every tier can be regenerated at any time.

use crate::core::raster::{self, RasterError};
use crate::models::ImagePreparation;
use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

pub const WORKING_VERSION: &str = "v1_2048";
pub const PREPARED_VERSION: &str = "v1_2048";
pub const NORMALIZED_VERSION: &str = "v3_from_working";
pub const THUMBNAIL_VERSION: &str = "v2_from_working";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivationPolicy {
    pub max_working_dimension: u32,
    pub working_quality: u8,
    pub canonical_size: u32,
    pub thumbnail_size: u32,
    pub thumbnail_quality: u8,
}

impl Default for DerivationPolicy {
    fn default() -> Self {
        Self {
            max_working_dimension: 2048,
            working_quality: 90,
            canonical_size: 512,
            thumbnail_size: 256,
            thumbnail_quality: 80,
        }
    }
}

/// Version string per tier. A non-default policy appends its parameters so
/// bytes built under different settings never share a cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierVersions {
    pub working: String,
    pub prepared: String,
    pub normalized: String,
    pub thumbnail: String,
}

impl TierVersions {
    pub fn for_policy(policy: &DerivationPolicy) -> Self {
        let defaults = DerivationPolicy::default();

        let working = if policy.max_working_dimension == defaults.max_working_dimension
            && policy.working_quality == defaults.working_quality
        {
            WORKING_VERSION.to_string()
        } else {
            format!(
                "{}+d{}q{}",
                WORKING_VERSION, policy.max_working_dimension, policy.working_quality
            )
        };

        // Prepared and normalized bytes inherit whatever the working tier was built with.
        let suffix = working.strip_prefix(WORKING_VERSION).unwrap_or_default().to_string();

        let normalized = if policy.canonical_size == defaults.canonical_size {
            format!("{}{}", NORMALIZED_VERSION, suffix)
        } else {
            format!("{}{}+s{}", NORMALIZED_VERSION, suffix, policy.canonical_size)
        };

        let thumbnail = if policy.thumbnail_size == defaults.thumbnail_size
            && policy.thumbnail_quality == defaults.thumbnail_quality
        {
            format!("{}{}", THUMBNAIL_VERSION, suffix)
        } else {
            format!(
                "{}{}+s{}q{}",
                THUMBNAIL_VERSION, suffix, policy.thumbnail_size, policy.thumbnail_quality
            )
        };

        Self {
            working,
            prepared: format!("{}{}", PREPARED_VERSION, suffix),
            normalized,
            thumbnail,
        }
    }
}

impl Default for TierVersions {
    fn default() -> Self {
        Self::for_policy(&DerivationPolicy::default())
    }
}

/// Downscale (never upscale) so the larger side fits the working bound, then
/// encode lossy.
pub fn build_working(original: &[u8], policy: &DerivationPolicy) -> Result<Vec<u8>, RasterError> {
    let img = raster::decode(original)?;
    let flat = raster::flatten_on_white(&img);
    let bounded = raster::fit_within(&flat, policy.max_working_dimension);
    raster::encode_jpeg(&bounded, policy.working_quality)
}

/// Rotate the whole working image about its centre, then crop with fractions
/// of the rotated canvas.
pub fn build_prepared(
    working: &[u8],
    preparation: &ImagePreparation,
    policy: &DerivationPolicy,
) -> Result<Vec<u8>, RasterError> {
    raster::validate_preparation(preparation)?;

    let img = raster::decode(working)?;
    let flat = raster::flatten_on_white(&img);
    let rotated = raster::rotate_expand(&flat, preparation.rotation)?;
    let cropped = raster::crop_fraction(&rotated, &preparation.rect)?;
    raster::encode_jpeg(&cropped, policy.working_quality)
}

/// Fixed-size grayscale square: white background, image scaled so its larger
/// side fills the square, centred, occupied region converted to luminance.
pub fn build_canonical(prepared: &[u8], policy: &DerivationPolicy) -> Result<Vec<u8>, RasterError> {
    let size = policy.canonical_size;
    let img = raster::decode(prepared)?;
    let flat = raster::flatten_on_white(&img);
    let (canvas, placement) = raster::place_centered(&flat, size);

    let mut gray = GrayImage::from_pixel(size, size, Luma([255]));
    for y in placement.y..placement.y + placement.height {
        for x in placement.x..placement.x + placement.width {
            gray.put_pixel(x, y, Luma([raster::luminance(canvas.get_pixel(x, y))]));
        }
    }

    raster::encode_png(&gray)
}

/// Preview built from the working tier only, so it exists before any
/// geometry is confirmed.
pub fn build_thumbnail(working: &[u8], policy: &DerivationPolicy) -> Result<Vec<u8>, RasterError> {
    let img = raster::decode(working)?;
    let flat = raster::flatten_on_white(&img);
    let (canvas, _) = raster::place_centered(&flat, policy.thumbnail_size);
    raster::encode_jpeg(&canvas, policy.thumbnail_quality)
}
