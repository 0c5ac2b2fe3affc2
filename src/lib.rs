pub mod config;
pub mod enroll;
pub mod error;
pub mod matcher;
pub mod storage;
pub mod upload;
pub mod verify;

// Re-export vision types for convenience
pub use idmatch_vision::{
    CanonicalFace, CanonicalSignature, DetectConfig, Descriptor, FaceEmbedder, Normalizer, Pipeline,
    SignatureSimilarity, UploadedImage,
};

pub use error::{ErrorReport, VerifyError, VerifyResult};
pub use matcher::{Candidate, CandidateFailure, MatchResult, VerificationOutcome};
pub use verify::{FaceVerifier, SignatureOutcome, SignatureVerifier};
