//! Turning files on disk into uploads for the CLI.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use idmatch_vision::normalize::accepted_format;
use idmatch_vision::{Normalizer, UploadedImage, VisionError};

use crate::error::VerifyError;

/// MIME type declared for a file, derived from its extension.
pub fn mime_for_path(path: &Path) -> &'static str {
    image::ImageFormat::from_path(path)
        .map(|f| f.to_mime_type())
        .unwrap_or("application/octet-stream")
}

/// Read an image file as an upload. Format and size are checked from the
/// extension and file metadata before any bytes are read.
pub fn read_upload(path: &Path, normalizer: &Normalizer) -> Result<UploadedImage> {
    let mime = mime_for_path(path);
    if accepted_format(mime).is_none() {
        return Err(VerifyError::from(VisionError::UnsupportedFormat { mime: mime.into() }).into());
    }

    let limit = normalizer.config().max_input_bytes;
    let len = fs::metadata(path)
        .with_context(|| format!("reading {}", path.display()))?
        .len();
    if len > limit as u64 {
        return Err(VerifyError::from(VisionError::OversizeInput {
            len: usize::try_from(len).unwrap_or(usize::MAX),
            limit,
        })
        .into());
    }

    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(UploadedImage::new(bytes, mime))
}
