pub mod error;
pub mod face;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod provider;
pub mod signature;
pub mod yunet;

// Re-export commonly used types
pub use error::{VisionError, VisionResult};
pub use face::{Descriptor, Detection};
pub use normalize::{CanonicalFace, CanonicalSignature, NormalizeConfig, Normalizer, UploadedImage};
pub use pipeline::Pipeline;
pub use provider::{DetectConfig, FaceEmbedder};
pub use signature::{compare_signatures, SignatureSimilarity};
