use std::path::Path;

use anyhow::{Context, Result};
use image::RgbImage;
use ort::session::Session;
use parking_lot::Mutex;

use crate::face::{self, Descriptor, Detection};
use crate::normalize::CanonicalFace;
use crate::provider::{DetectConfig, FaceEmbedder};

pub const YUNET_SFACE: &str = "yunet-2023mar/sface-2021dec";

struct Sessions {
    detector: Session,
    encoder: Session,
}

/// Full pipeline: detect faces → align → encode
///
/// ONNX Runtime needs exclusive access for each run, so both sessions sit
/// behind one mutex and the pipeline can be shared across threads.
pub struct Pipeline {
    sessions: Mutex<Sessions>,
    nms_threshold: f32,
}

impl Pipeline {
    pub fn new(detector: &Path, recognizer: &Path) -> Result<Self> {
        let sessions = Sessions {
            detector: crate::model::detector_session(detector)?,
            encoder: crate::model::recog_session(recognizer)?,
        };
        log::info!(
            "face pipeline ready: detector={} recognizer={}",
            detector.display(),
            recognizer.display()
        );
        Ok(Self {
            sessions: Mutex::new(sessions),
            nms_threshold: 0.3,
        })
    }

    pub fn with_nms_threshold(mut self, nms_threshold: f32) -> Self {
        self.nms_threshold = nms_threshold;
        self
    }

    /// Detect the best face and return it with its descriptor.
    pub fn process_image(
        &self,
        img: &RgbImage,
        config: &DetectConfig,
    ) -> Result<Option<(Detection, Descriptor)>> {
        let mut sessions = self.sessions.lock();

        let detections = face::detect_faces(
            &mut sessions.detector,
            img,
            config.input_size,
            config.score_threshold,
            self.nms_threshold,
        )
        .context("detecting faces")?;

        let Some(best) = detections
            .into_iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
        else {
            return Ok(None);
        };

        let aligned = face::align_face(img, &best, face::ALIGNED_SIZE);
        let values = face::encode_face(&mut sessions.encoder, &aligned).context("encoding face")?;

        Ok(Some((best, Descriptor::new(YUNET_SFACE, values))))
    }
}

impl FaceEmbedder for Pipeline {
    fn provider_tag(&self) -> &'static str {
        YUNET_SFACE
    }

    fn max_concurrent_calls(&self) -> usize {
        1
    }

    fn detect(&self, image: &CanonicalFace, config: &DetectConfig) -> Result<Option<Descriptor>> {
        Ok(self
            .process_image(image.as_rgb(), config)?
            .map(|(detection, descriptor)| {
                log::debug!(
                    "face at ({:.0}, {:.0}) score {:.3}",
                    detection.bbox[0],
                    detection.bbox[1],
                    detection.score
                );
                descriptor
            }))
    }
}
