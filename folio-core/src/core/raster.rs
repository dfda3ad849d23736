use crate::models::{ImagePreparation, NormalizedRect};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayImage, ImageBuffer, Rgb, RgbImage, Rgba};
use thiserror::Error;

pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Image has no pixels")]
    Empty,

    #[error("Invalid preparation: {message}")]
    InvalidPreparation { message: String },

    #[error("Crop collapsed to an empty region ({width}x{height})")]
    EmptyCrop { width: u32, height: u32 },
}

/// Region of a square canvas covered by a centred image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, RasterError> {
    let img = image::load_from_memory(bytes)?;
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(RasterError::Empty);
    }
    Ok(img)
}

/// Composites any alpha channel over white so transparent regions hash and
/// encode the same way a white page would.
pub fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }

    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    ImageBuffer::from_fn(width, height, |x, y| {
        let Rgba([r, g, b, a]) = *rgba.get_pixel(x, y);
        let a = a as u32;
        let blend = |c: u8| ((c as u32 * a + 255 * (255 - a) + 127) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

/// Dimensions after scaling so the larger side equals `size`.
pub fn fit_exact(width: u32, height: u32, size: u32) -> (u32, u32) {
    let scale = size as f64 / width.max(height) as f64;
    let w = ((width as f64 * scale).round() as u32).clamp(1, size);
    let h = ((height as f64 * scale).round() as u32).clamp(1, size);
    (w, h)
}

/// Downscales so the larger side is at most `max_dimension`. Never upscales.
pub fn fit_within(img: &RgbImage, max_dimension: u32) -> RgbImage {
    let (width, height) = img.dimensions();
    if width.max(height) <= max_dimension {
        return img.clone();
    }

    let (w, h) = fit_exact(width, height, max_dimension);
    imageops::resize(img, w, h, FilterType::Lanczos3)
}

/// Scales the image so its larger side equals `size` and centres it on a
/// white `size`×`size` square.
pub fn place_centered(img: &RgbImage, size: u32) -> (RgbImage, Placement) {
    let (width, height) = img.dimensions();
    let (w, h) = fit_exact(width, height, size);
    let resized = if (w, h) == (width, height) {
        img.clone()
    } else {
        imageops::resize(img, w, h, FilterType::Lanczos3)
    };

    let x = ((size - w) as f64 / 2.0).round() as u32;
    let y = ((size - h) as f64 / 2.0).round() as u32;

    let mut canvas = RgbImage::from_pixel(size, size, WHITE);
    imageops::overlay(&mut canvas, &resized, x as i64, y as i64);

    (
        canvas,
        Placement {
            x,
            y,
            width: w,
            height: h,
        },
    )
}

pub fn luminance(pixel: &Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64)
        .round()
        .clamp(0.0, 255.0) as u8
}

pub fn to_luma(img: &RgbImage) -> GrayImage {
    let (width, height) = img.dimensions();
    ImageBuffer::from_fn(width, height, |x, y| image::Luma([luminance(img.get_pixel(x, y))]))
}

pub fn validate_preparation(preparation: &ImagePreparation) -> Result<(), RasterError> {
    if !preparation.rotation.is_finite() {
        return Err(RasterError::InvalidPreparation {
            message: format!("rotation must be finite, got {}", preparation.rotation),
        });
    }

    let NormalizedRect {
        x,
        y,
        width,
        height,
    } = preparation.rect;
    let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
    if !(in_unit(x) && in_unit(y) && in_unit(width) && in_unit(height)) {
        return Err(RasterError::InvalidPreparation {
            message: format!(
                "rect must lie within 0..1, got x={} y={} width={} height={}",
                x, y, width, height
            ),
        });
    }

    if width <= 0.0 || height <= 0.0 {
        return Err(RasterError::InvalidPreparation {
            message: "rect must have a positive width and height".to_string(),
        });
    }

    Ok(())
}

/// Rotates about the centre onto a canvas sized to the rotated bounds
/// (`w·|cos θ| + h·|sin θ|` by `w·|sin θ| + h·|cos θ|`). Quarter turns are exact;
/// other angles are resampled bilinearly with uncovered corners left white.
pub fn rotate_expand(img: &RgbImage, degrees: f64) -> Result<RgbImage, RasterError> {
    if !degrees.is_finite() {
        return Err(RasterError::InvalidPreparation {
            message: format!("rotation must be finite, got {}", degrees),
        });
    }

    let normalized = degrees.rem_euclid(360.0);
    let near = |target: f64| (normalized - target).abs() < 1e-9;
    if near(0.0) || near(360.0) {
        return Ok(img.clone());
    }
    if near(90.0) {
        return Ok(imageops::rotate90(img));
    }
    if near(180.0) {
        return Ok(imageops::rotate180(img));
    }
    if near(270.0) {
        return Ok(imageops::rotate270(img));
    }

    let radians = normalized.to_radians();
    let (sin, cos) = radians.sin_cos();
    let (width, height) = img.dimensions();
    let (w, h) = (width as f64, height as f64);

    let out_w = ((w * cos.abs() + h * sin.abs()) as u32).max(1);
    let out_h = ((w * sin.abs() + h * cos.abs()) as u32).max(1);
    let (half_out_w, half_out_h) = (out_w as f64 / 2.0, out_h as f64 / 2.0);

    Ok(ImageBuffer::from_fn(out_w, out_h, |x, y| {
        let dx = x as f64 + 0.5 - half_out_w;
        let dy = y as f64 + 0.5 - half_out_h;
        // Inverse of the forward rotation, back into source pixel space.
        let sx = dx * cos + dy * sin + w / 2.0 - 0.5;
        let sy = -dx * sin + dy * cos + h / 2.0 - 0.5;
        sample_bilinear(img, sx, sy)
    }))
}

fn sample_bilinear(img: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    if x <= -1.0 || y <= -1.0 || x >= width as f64 || y >= height as f64 {
        return WHITE;
    }

    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let fetch = |px: f64, py: f64| -> [f64; 3] {
        if px < 0.0 || py < 0.0 || px >= width as f64 || py >= height as f64 {
            return [255.0; 3];
        }
        let p = img.get_pixel(px as u32, py as u32).0;
        [p[0] as f64, p[1] as f64, p[2] as f64]
    };

    let tl = fetch(x0, y0);
    let tr = fetch(x0 + 1.0, y0);
    let bl = fetch(x0, y0 + 1.0);
    let br = fetch(x0 + 1.0, y0 + 1.0);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = tl[c] + (tr[c] - tl[c]) * fx;
        let bottom = bl[c] + (br[c] - bl[c]) * fx;
        out[c] = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Crops using fractions of the image's own dimensions. The region is clamped
/// to the canvas; a region that rounds to nothing is an error.
pub fn crop_fraction(img: &RgbImage, rect: &NormalizedRect) -> Result<RgbImage, RasterError> {
    let (width, height) = img.dimensions();
    let (w, h) = (width as f64, height as f64);

    let x0 = ((rect.x * w).round() as u32).min(width);
    let y0 = ((rect.y * h).round() as u32).min(height);
    let crop_w = ((rect.width * w) as u32).min(width - x0);
    let crop_h = ((rect.height * h) as u32).min(height - y0);

    if crop_w == 0 || crop_h == 0 {
        return Err(RasterError::EmptyCrop {
            width: crop_w,
            height: crop_h,
        });
    }

    Ok(imageops::crop_imm(img, x0, y0, crop_w, crop_h).to_image())
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, RasterError> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    img.write_with_encoder(encoder)?;
    Ok(buffer)
}

pub fn encode_png(img: &GrayImage) -> Result<Vec<u8>, RasterError> {
    let mut buffer = Vec::new();
    let encoder = PngEncoder::new(&mut buffer);
    img.write_with_encoder(encoder)?;
    Ok(buffer)
}
