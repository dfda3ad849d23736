//! HSV colour histograms used by the visual-profile grouping strategy.

use image::{imageops, GenericImageView, RgbImage};

pub const DEFAULT_PROFILE_BINS: usize = 16;

/// Concatenated H, S and V histograms, L1-normalised to sum to 1.
pub type VisualProfile = Vec<f64>;

/// Histograms the centred square of the image (side = shorter dimension).
pub fn extract_visual_profile(img: &RgbImage, bins: usize) -> VisualProfile {
    let bins = bins.max(1);
    let (width, height) = img.dimensions();
    let side = width.min(height);
    let square = imageops::crop_imm(img, (width - side) / 2, (height - side) / 2, side, side);

    let mut hist = vec![0.0f64; bins * 3];
    let bin_of = |fraction: f64| ((fraction * bins as f64).floor() as usize).min(bins - 1);

    for (_, _, pixel) in square.pixels() {
        let [r, g, b] = pixel.0;
        let (h, s, v) = rgb_to_hsv(r, g, b);

        hist[bin_of(h / 360.0)] += 1.0;
        hist[bins + bin_of(s)] += 1.0;
        hist[2 * bins + bin_of(v)] += 1.0;
    }

    let sum: f64 = hist.iter().sum();
    if sum > 0.0 {
        hist.iter_mut().for_each(|value| *value /= sum);
    }
    hist
}

/// Hue in degrees [0, 360), saturation and value in [0, 1].
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f64, f64, f64) {
    let (r, g, b) = (r as f64 / 255.0, g as f64 / 255.0, b as f64 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let s = if max == 0.0 { 0.0 } else { delta / max };

    let h = if delta == 0.0 {
        0.0
    } else {
        let sector = if max == r {
            (g - b) / delta
        } else if max == g {
            2.0 + (b - r) / delta
        } else {
            4.0 + (r - g) / delta
        };
        (sector * 60.0 + 360.0) % 360.0
    };

    (h, s, max)
}

/// Cosine similarity; 0 when lengths differ or either vector has no magnitude.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
