//! Pixel-level signature similarity.
//!
//! The score is the mean absolute pixel difference over the 8-bit range,
//! inverted so 1.0 means identical rasters. It is sensitive to translation,
//! rotation and scale; no structural matching is attempted.

use std::fmt;

use crate::error::{VisionError, VisionResult};
use crate::normalize::CanonicalSignature;

const MAX_PIXEL_VALUE: f64 = u8::MAX as f64;

/// Similarity in `[0, 1]`. Displays with four decimals.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct SignatureSimilarity(pub f64);

impl SignatureSimilarity {
    pub fn value(self) -> f64 {
        self.0
    }

    pub fn rounded(self) -> f64 {
        (self.0 * 10_000.0).round() / 10_000.0
    }
}

impl fmt::Display for SignatureSimilarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

pub fn compare_signatures(
    a: &CanonicalSignature,
    b: &CanonicalSignature,
) -> VisionResult<SignatureSimilarity> {
    if a.width() != b.width() || a.height() != b.height() {
        return Err(VisionError::DimensionMismatch {
            left_width: a.width(),
            left_height: a.height(),
            right_width: b.width(),
            right_height: b.height(),
        });
    }

    let left = a.as_gray().as_raw();
    let right = b.as_gray().as_raw();
    if left.is_empty() {
        // Two empty rasters carry no difference.
        return Ok(SignatureSimilarity(1.0));
    }

    let total_diff: u64 = left
        .iter()
        .zip(right.iter())
        .map(|(&p, &q)| p.abs_diff(q) as u64)
        .sum();

    let similarity = 1.0 - total_diff as f64 / (left.len() as f64 * MAX_PIXEL_VALUE);
    Ok(SignatureSimilarity(similarity))
}
