//! Contract for the face detection + embedding capability.

use anyhow::Result;

use crate::face::Descriptor;
use crate::normalize::CanonicalFace;

/// Detection parameters passed on every call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectConfig {
    pub input_size: u32,
    pub score_threshold: f32,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            score_threshold: 0.5,
        }
    }
}

/// A loaded detector/embedder shared read-only by all requests.
///
/// `Ok(None)` means no face cleared `score_threshold`; that is an ordinary
/// outcome. `Err` is reserved for the provider itself failing.
pub trait FaceEmbedder: Send + Sync {
    /// Identifies the model family and version; stamped on every descriptor.
    fn provider_tag(&self) -> &'static str;

    /// How many `detect` calls the provider actually runs at once. Callers
    /// queue beyond this instead of charging lock waits to a call's timeout.
    fn max_concurrent_calls(&self) -> usize {
        usize::MAX
    }

    /// Descriptor of the single most confident face, if any.
    fn detect(&self, image: &CanonicalFace, config: &DetectConfig) -> Result<Option<Descriptor>>;
}
