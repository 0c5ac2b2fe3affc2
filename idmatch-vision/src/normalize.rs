//! Decoding and canonicalization of uploaded images.
//!
//! Every image entering the matching pipeline passes through [`Normalizer`] once:
//! signatures become a fixed-size grayscale raster, faces an RGB raster fitted
//! inside a square box with its contrast stretched to the full 8-bit range.

use image::{imageops::FilterType, DynamicImage, GenericImageView, GrayImage, ImageFormat, RgbImage};

use crate::error::{VisionError, VisionResult};

/// Compressed image bytes as uploaded, with the MIME type the caller declared.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl UploadedImage {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            bytes,
            mime: mime.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    pub signature_width: u32,
    pub signature_height: u32,
    pub face_box: u32,
    pub max_input_bytes: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            signature_width: 300,
            signature_height: 150,
            face_box: 800,
            max_input_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Single-channel signature raster ready for pixel comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalSignature {
    pixels: GrayImage,
}

impl CanonicalSignature {
    pub fn from_gray(pixels: GrayImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn as_gray(&self) -> &GrayImage {
        &self.pixels
    }
}

/// RGB face raster handed to the embedding provider.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalFace {
    pixels: RgbImage,
}

impl CanonicalFace {
    pub fn from_rgb(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.pixels
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizeConfig,
}

impl Normalizer {
    pub fn new(config: NormalizeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizeConfig {
        &self.config
    }

    /// Decode and resample to the fixed signature raster in grayscale.
    pub fn signature(&self, upload: &UploadedImage) -> VisionResult<CanonicalSignature> {
        let img = self.decode(upload)?;
        let (width, height) = (self.config.signature_width, self.config.signature_height);
        let img = if img.dimensions() == (width, height) {
            img
        } else {
            img.resize_exact(width, height, FilterType::Triangle)
        };
        Ok(CanonicalSignature::from_gray(img.to_luma8()))
    }

    /// Decode, fit inside the face box without upscaling, then stretch contrast.
    pub fn face(&self, upload: &UploadedImage) -> VisionResult<CanonicalFace> {
        let img = self.decode(upload)?;
        let side = self.config.face_box;
        let (width, height) = img.dimensions();
        let img = if width > side || height > side {
            img.resize(side, side, FilterType::Triangle)
        } else {
            img
        };
        let mut rgb = img.to_rgb8();
        stretch_contrast(&mut rgb);
        Ok(CanonicalFace::from_rgb(rgb))
    }

    fn decode(&self, upload: &UploadedImage) -> VisionResult<DynamicImage> {
        let format = accepted_format(&upload.mime).ok_or_else(|| VisionError::UnsupportedFormat {
            mime: upload.mime.clone(),
        })?;

        // Size gate comes before any decoder allocation.
        if upload.bytes.len() > self.config.max_input_bytes {
            return Err(VisionError::OversizeInput {
                len: upload.bytes.len(),
                limit: self.config.max_input_bytes,
            });
        }

        let img = image::load_from_memory_with_format(&upload.bytes, format).map_err(|source| {
            VisionError::Decode {
                mime: upload.mime.clone(),
                source,
            }
        })?;
        log::debug!(
            "decoded {} upload: {}x{} from {} bytes",
            upload.mime,
            img.width(),
            img.height(),
            upload.bytes.len()
        );
        Ok(img)
    }
}

/// Map a declared MIME type onto the decoder for it, if it is on the allow-list.
pub fn accepted_format(mime: &str) -> Option<ImageFormat> {
    let essence = mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(ImageFormat::Jpeg),
        "image/png" => Some(ImageFormat::Png),
        _ => None,
    }
}

/// Linear stretch of the occupied value range onto 0..=255. Flat images are left as is.
fn stretch_contrast(img: &mut RgbImage) {
    let raw = img.as_raw();
    let (lo, hi) = raw
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if hi <= lo || (lo == 0 && hi == u8::MAX) {
        return;
    }

    let span = (hi - lo) as u32;
    for v in img.iter_mut() {
        *v = (((*v - lo) as u32 * 255 + span / 2) / span) as u8;
    }
}
