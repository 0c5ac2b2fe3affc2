//! Face match aggregation: one live descriptor against an account's candidates.

use std::fmt;

use idmatch_vision::{Descriptor, VisionError};
use serde::Serialize;

use crate::error::{VerifyError, VerifyResult};

/// Why a candidate could not be compared. Never fatal to the request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(into = "String")]
pub enum CandidateFailure {
    NoFaceDetected,
    Image { kind: &'static str, message: String },
    Provider(String),
    TimedOut,
}

impl From<&VisionError> for CandidateFailure {
    fn from(err: &VisionError) -> Self {
        CandidateFailure::Image {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateFailure::NoFaceDetected => write!(f, "NoFaceDetected: no face found in reference image"),
            CandidateFailure::Image { kind, message } => write!(f, "{kind}: {message}"),
            CandidateFailure::Provider(message) => write!(f, "ExternalCollaboratorUnavailable: {message}"),
            CandidateFailure::TimedOut => write!(f, "ExternalCollaboratorUnavailable: timed out"),
        }
    }
}

impl From<CandidateFailure> for String {
    fn from(failure: CandidateFailure) -> Self {
        failure.to_string()
    }
}

/// A reference entry after extraction: a descriptor or the reason there is none.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub source_id: String,
    pub descriptor: Result<Descriptor, CandidateFailure>,
}

impl Candidate {
    pub fn found(source_id: impl Into<String>, descriptor: Descriptor) -> Self {
        Self {
            source_id: source_id.into(),
            descriptor: Ok(descriptor),
        }
    }

    pub fn failed(source_id: impl Into<String>, failure: CandidateFailure) -> Self {
        Self {
            source_id: source_id.into(),
            descriptor: Err(failure),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub source_id: String,
    pub is_match: bool,
    pub similarity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<CandidateFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub is_match: bool,
    pub best_similarity: f32,
    pub faces: Vec<MatchResult>,
}

impl VerificationOutcome {
    /// Candidates that were actually compared (as opposed to failed).
    pub fn compared(&self) -> usize {
        self.faces.iter().filter(|f| f.failure_reason.is_none()).count()
    }
}

/// Compare one candidate against the live descriptor.
pub fn evaluate(live: &Descriptor, candidate: Candidate, threshold: f32) -> VerifyResult<MatchResult> {
    match candidate.descriptor {
        Ok(descriptor) => {
            let distance = live.distance(&descriptor)?;
            Ok(MatchResult {
                source_id: candidate.source_id,
                is_match: distance < threshold,
                similarity: 1.0 - distance,
                distance: Some(distance),
                failure_reason: None,
            })
        }
        Err(failure) => Ok(MatchResult {
            source_id: candidate.source_id,
            is_match: false,
            similarity: 0.0,
            distance: None,
            failure_reason: Some(failure),
        }),
    }
}

/// Fold every candidate into a [`VerificationOutcome`].
///
/// Any single match accepts. `best_similarity` is the plain maximum over all
/// results, failed candidates counting as 0; it is not required to come from a
/// matching candidate.
pub fn aggregate(
    account: &str,
    live: Option<&Descriptor>,
    candidates: Vec<Candidate>,
    threshold: f32,
) -> VerifyResult<VerificationOutcome> {
    let live = live.ok_or(VerifyError::NoLiveFace)?;
    if candidates.is_empty() {
        return Err(VerifyError::EmptyCandidateSet {
            account: account.to_string(),
        });
    }

    let faces = candidates
        .into_iter()
        .map(|c| evaluate(live, c, threshold))
        .collect::<VerifyResult<Vec<_>>>()?;

    let best_similarity = faces
        .iter()
        .map(|f| f.similarity)
        .fold(f32::NEG_INFINITY, f32::max);
    let is_match = faces.iter().any(|f| f.is_match);

    Ok(VerificationOutcome {
        is_match,
        best_similarity,
        faces,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(values: &[f32]) -> Descriptor {
        Descriptor::new("test", values.to_vec())
    }

    #[test]
    fn descriptor_matches_itself() {
        let live = desc(&[0.6, 0.8]);
        let result = evaluate(&live, Candidate::found("a", live.clone()), 0.01).unwrap();
        assert_eq!(result.distance, Some(0.0));
        assert_eq!(result.similarity, 1.0);
        assert!(result.is_match);
    }

    #[test]
    fn similarity_is_not_clamped() {
        let live = desc(&[1.0, 0.0]);
        let result = evaluate(&live, Candidate::found("far", desc(&[-1.0, 0.0])), 0.5).unwrap();
        assert!((result.similarity + 1.0).abs() < 1e-6);
        assert!(!result.is_match);
    }

    #[test]
    fn threshold_is_strict() {
        let live = desc(&[0.0, 0.0]);
        let result = evaluate(&live, Candidate::found("edge", desc(&[0.5, 0.0])), 0.5).unwrap();
        assert!(!result.is_match);
    }

    #[test]
    fn one_match_among_many_accepts() {
        let live = desc(&[1.0, 0.0]);
        let outcome = aggregate(
            "acc",
            Some(&live),
            vec![
                Candidate::found("far", desc(&[0.0, 1.0])),
                Candidate::failed("blurry", CandidateFailure::NoFaceDetected),
                Candidate::found("near", desc(&[0.9, 0.1])),
            ],
            0.5,
        )
        .unwrap();

        assert!(outcome.is_match);
        assert_eq!(outcome.faces.len(), 3);
        assert_eq!(outcome.compared(), 2);
        let ids: Vec<_> = outcome.faces.iter().map(|f| f.source_id.as_str()).collect();
        assert_eq!(ids, ["far", "blurry", "near"]);
        assert_eq!(outcome.faces[1].similarity, 0.0);
        assert!(!outcome.faces[1].is_match);
        assert_eq!(outcome.faces[1].failure_reason, Some(CandidateFailure::NoFaceDetected));
        assert_eq!(outcome.best_similarity, outcome.faces[2].similarity);
    }

    #[test]
    fn all_failed_yields_zero_best() {
        let live = desc(&[1.0, 0.0]);
        let outcome = aggregate(
            "acc",
            Some(&live),
            vec![
                Candidate::failed("a", CandidateFailure::NoFaceDetected),
                Candidate::failed("b", CandidateFailure::TimedOut),
            ],
            0.5,
        )
        .unwrap();
        assert!(!outcome.is_match);
        assert_eq!(outcome.best_similarity, 0.0);
        assert_eq!(outcome.compared(), 0);
    }

    #[test]
    fn failed_candidate_outranks_negative_similarity() {
        let live = desc(&[1.0, 0.0]);
        let outcome = aggregate(
            "acc",
            Some(&live),
            vec![
                Candidate::found("opposite", desc(&[-1.0, 0.0])),
                Candidate::failed("broken", CandidateFailure::TimedOut),
            ],
            0.5,
        )
        .unwrap();
        assert_eq!(outcome.best_similarity, 0.0);
    }

    #[test]
    fn missing_live_face_is_fatal_before_anything_else() {
        let err = aggregate("acc", None, vec![], 0.5).unwrap_err();
        assert_eq!(err.kind(), "NoLiveFace");
    }

    #[test]
    fn empty_candidate_set_is_fatal() {
        let live = desc(&[1.0]);
        let err = aggregate("acc-9", Some(&live), vec![], 0.5).unwrap_err();
        assert!(matches!(err, VerifyError::EmptyCandidateSet { ref account } if account == "acc-9"));
    }

    #[test]
    fn mixed_providers_are_rejected() {
        let live = desc(&[1.0, 0.0]);
        let other = Descriptor::new("other-model", vec![1.0, 0.0]);
        let err = aggregate("acc", Some(&live), vec![Candidate::found("x", other)], 0.5).unwrap_err();
        assert_eq!(err.kind(), "IncompatibleDescriptors");
    }

    #[test]
    fn outcome_serializes_caller_contract() {
        let live = desc(&[1.0, 0.0]);
        let outcome = aggregate(
            "acc",
            Some(&live),
            vec![
                Candidate::found("ref-1", live.clone()),
                Candidate::failed("ref-2", CandidateFailure::NoFaceDetected),
            ],
            0.5,
        )
        .unwrap();

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["isMatch"], true);
        assert_eq!(json["bestSimilarity"], 1.0);
        assert_eq!(json["faces"][0]["sourceId"], "ref-1");
        assert_eq!(json["faces"][0]["isMatch"], true);
        assert!(json["faces"][0].get("failureReason").is_none());
        assert_eq!(json["faces"][1]["similarity"], 0.0);
        assert!(json["faces"][1]["failureReason"]
            .as_str()
            .unwrap()
            .starts_with("NoFaceDetected"));
    }
}
