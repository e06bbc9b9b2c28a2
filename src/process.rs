//! Shared numeric post-processing pipeline for image planes.
//!
//! Every routine here is a pure function of (plane, options) so it is safe
//! to invoke in parallel across a batch.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{DynamicImage, GrayImage, ImageOutputFormat};
use ndarray::Array2;

use crate::dataset::Payload;
use crate::errors::Error;

/// Thumbnail bound (square), aspect ratio preserved.
pub const THUMBNAIL_SIZE: u32 = 200;

/// Default percentile window applied after a log transform.
const LOG_LOW_PERC: f32 = 0.01;
const LOG_HIGH_PERC: f32 = 99.0;

const LOG_EPS: f32 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Export {
    /// Decoded in-memory image.
    Image,
    /// Self-describing base64 data URI.
    Base64,
    /// Untouched numeric block, no image conversion. Used by the
    /// materialization path so no precision is lost before the disk write.
    Raw,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessOptions {
    pub log: bool,
    pub resize: bool,
    pub export: Export,
    /// (low, high) percentile window; (0, 100) means plain min-max.
    pub percentiles: (f32, f32),
}

impl Default for ProcessOptions {
    fn default() -> Self {
        ProcessOptions {
            log: false,
            resize: true,
            export: Export::Base64,
            percentiles: (0.0, 100.0),
        }
    }
}

/// A single 2-D image plane. Integer planes wider than 8 bits and float
/// planes are carried as f32.
#[derive(Debug, Clone)]
pub enum Plane {
    U8(Array2<u8>),
    F32(Array2<f32>),
}

impl Plane {
    pub fn dim(&self) -> (usize, usize) {
        match self {
            Plane::U8(a) => a.dim(),
            Plane::F32(a) => a.dim(),
        }
    }

    pub fn to_f32(&self) -> Array2<f32> {
        match self {
            Plane::U8(a) => a.mapv(|v| v as f32),
            Plane::F32(a) => a.clone(),
        }
    }
}

/// Run one plane through normalization, thumbnailing and export.
pub fn process_plane(plane: &Plane, opts: &ProcessOptions) -> Result<Payload, Error> {
    let gray = if opts.log {
        log_plane(&plane.to_f32())
    } else if opts.percentiles != (0.0, 100.0) {
        normalize_percentiles(&plane.to_f32(), opts.percentiles)
    } else {
        match plane {
            Plane::U8(a) => a.clone(),
            Plane::F32(a) => rescale_minmax(a),
        }
    };

    let mut image = DynamicImage::ImageLuma8(gray_to_image(gray)?);

    if opts.resize {
        image = image.resize(
            THUMBNAIL_SIZE,
            THUMBNAIL_SIZE,
            image::imageops::FilterType::Lanczos3,
        );
    }

    match opts.export {
        Export::Image => Ok(Payload::Image(image)),
        Export::Base64 => Ok(Payload::Encoded(encode_data_uri(
            &image,
            ImageOutputFormat::Png,
            "image/png",
        )?)),
        Export::Raw => Err(Error::Unsupported(
            "raw export does not pass through the image pipeline".into(),
        )),
    }
}

/// Log transform: non-finite and negative values are masked before the
/// logarithm is taken so NaNs never propagate into the normalization.
fn log_plane(x: &Array2<f32>) -> Array2<u8> {
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for &v in x.iter() {
        if v.is_finite() && v >= 0.0 {
            lo = lo.min(v);
            hi = hi.max(v);
        }
    }

    if !lo.is_finite() || hi <= lo {
        return Array2::zeros(x.dim());
    }

    // Masked values are carried as NaN and fall out of the percentile
    // normalization below.
    let logged = x.mapv(|v| {
        if v.is_finite() && v >= 0.0 {
            ((v - lo) / (hi - lo) + LOG_EPS).ln()
        } else {
            f32::NAN
        }
    });

    normalize_percentiles(&logged, (LOG_LOW_PERC, LOG_HIGH_PERC))
}

/// Clip to a percentile window over the flattened plane, then rescale to
/// 8-bit. A degenerate window yields an all-zero plane instead of dividing
/// by zero. Non-finite inputs map to zero.
pub fn normalize_percentiles(x: &Array2<f32>, percentiles: (f32, f32)) -> Array2<u8> {
    let mut values: Vec<f32> = x.iter().cloned().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return Array2::zeros(x.dim());
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let low = percentile(&values, percentiles.0);
    let high = percentile(&values, percentiles.1);
    if high <= low {
        return Array2::zeros(x.dim());
    }

    x.mapv(|v| {
        if v.is_finite() {
            (((v - low) / (high - low)).clamp(0.0, 1.0) * 255.0) as u8
        } else {
            0
        }
    })
}

/// Plain global min-max rescale to 8-bit.
fn rescale_minmax(x: &Array2<f32>) -> Array2<u8> {
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for &v in x.iter() {
        if v.is_finite() {
            lo = lo.min(v);
            hi = hi.max(v);
        }
    }

    if !lo.is_finite() || hi <= lo {
        return Array2::zeros(x.dim());
    }

    x.mapv(|v| {
        if v.is_finite() {
            ((v - lo) / (hi - lo) * 255.0) as u8
        } else {
            0
        }
    })
}

/// Percentile with linear interpolation between closest ranks. `values`
/// must be sorted.
fn percentile(values: &[f32], p: f32) -> f32 {
    let rank = (p / 100.0).clamp(0.0, 1.0) * (values.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let w = rank - lo as f32;
    values[lo] * (1.0 - w) + values[hi] * w
}

fn gray_to_image(a: Array2<u8>) -> Result<GrayImage, Error> {
    let (h, w) = a.dim();
    GrayImage::from_raw(w as u32, h as u32, a.iter().cloned().collect())
        .ok_or_else(|| Error::Unsupported("plane does not fit an image buffer".into()))
}

/// Encode as a self-describing data URI.
pub fn encode_data_uri(
    image: &DynamicImage,
    format: ImageOutputFormat,
    mime: &str,
) -> Result<String, Error> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), format)?;
    Ok(format!("data:{};base64,{}", mime, STANDARD.encode(&buf)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn constant_plane_is_all_zero() {
        let x = Array2::from_elem((4, 4), 7.0f32);
        let out = normalize_percentiles(&x, (1.0, 99.0));
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn degenerate_window_is_all_zero() {
        let x = arr2(&[[0.0f32, 1.0], [2.0, 3.0]]);
        let out = normalize_percentiles(&x, (50.0, 50.0));
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn percentile_window_clips_outliers() {
        let mut v = vec![0.0f32; 99];
        v.push(1e9);
        let x = Array2::from_shape_vec((10, 10), v).unwrap();
        let out = normalize_percentiles(&x, (0.0, 99.0));
        // The outlier saturates instead of flattening everything else.
        assert_eq!(out[(9, 9)], 255);
    }

    #[test]
    fn log_masks_nan_and_negative() {
        let x = arr2(&[
            [f32::NAN, -5.0, 1.0],
            [10.0, 100.0, 1000.0],
            [2.0, 3.0, 4.0],
        ]);
        let out = log_plane(&x);
        // Masked positions map to zero, the rest spans the 8-bit range.
        assert_eq!(out[(0, 0)], 0);
        assert_eq!(out[(0, 1)], 0);
        assert!(out.iter().any(|&v| v > 0));
    }

    #[test]
    fn u8_plane_passes_through_unscaled() {
        let a = arr2(&[[0u8, 10], [20, 30]]);
        let opts = ProcessOptions {
            resize: false,
            export: Export::Image,
            ..Default::default()
        };
        match process_plane(&Plane::U8(a), &opts).unwrap() {
            Payload::Image(img) => {
                let gray = img.to_luma8();
                assert_eq!(gray.get_pixel(1, 1).0[0], 30);
            }
            _ => panic!("expected image payload"),
        }
    }

    #[test]
    fn base64_export_is_a_png_data_uri() {
        let a = Array2::from_shape_fn((8, 8), |(i, j)| (i * 8 + j) as f32);
        let out = process_plane(&Plane::F32(a), &ProcessOptions::default()).unwrap();
        match out {
            Payload::Encoded(uri) => assert!(uri.starts_with("data:image/png;base64,")),
            _ => panic!("expected encoded payload"),
        }
    }

    #[test]
    fn identical_input_yields_identical_payload() {
        let a = Array2::from_shape_fn((16, 16), |(i, j)| ((i * j) % 13) as f32);
        let opts = ProcessOptions::default();
        let one = process_plane(&Plane::F32(a.clone()), &opts).unwrap();
        let two = process_plane(&Plane::F32(a), &opts).unwrap();
        match (one, two) {
            (Payload::Encoded(u1), Payload::Encoded(u2)) => assert_eq!(u1, u2),
            _ => panic!("expected encoded payloads"),
        }
    }
}
