use image::ImageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("unsupported image format '{mime}' (accepted: image/jpeg, image/png)")]
    UnsupportedFormat { mime: String },

    #[error("failed to decode {mime} image: {source}")]
    Decode {
        mime: String,
        #[source]
        source: ImageError,
    },

    #[error("image payload of {len} bytes exceeds the {limit} byte limit")]
    OversizeInput { len: usize, limit: usize },

    #[error("canonical images differ in size: {left_width}x{left_height} vs {right_width}x{right_height}")]
    DimensionMismatch {
        left_width: u32,
        left_height: u32,
        right_width: u32,
        right_height: u32,
    },

    #[error("descriptors are not comparable: {left} ({left_dim} values) vs {right} ({right_dim} values)")]
    IncompatibleDescriptors {
        left: &'static str,
        left_dim: usize,
        right: &'static str,
        right_dim: usize,
    },
}

impl VisionError {
    /// Taxonomy name reported to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            VisionError::UnsupportedFormat { .. } => "UnsupportedFormat",
            VisionError::Decode { .. } => "DecodeError",
            VisionError::OversizeInput { .. } => "OversizeInput",
            VisionError::DimensionMismatch { .. } => "DimensionMismatch",
            VisionError::IncompatibleDescriptors { .. } => "IncompatibleDescriptors",
        }
    }
}

pub type VisionResult<T> = Result<T, VisionError>;
