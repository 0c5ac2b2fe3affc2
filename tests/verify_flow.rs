use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use idmatch::config::Config;
use idmatch::storage::{AccountStore, ReferenceEntry, ReferenceKind, ReferenceSet, StoreError};
use idmatch::{
    CandidateFailure, CanonicalFace, DetectConfig, Descriptor, FaceEmbedder, FaceVerifier,
    UploadedImage, VerifyError,
};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};

const FAKE: &str = "fake-gray-mean";

/// Descriptor = mean gray level scaled to [0, 1]. Near-black images hold no face,
/// gray level 13 makes the provider fail and 77 makes it hang.
struct GrayMeanEmbedder;

impl FaceEmbedder for GrayMeanEmbedder {
    fn provider_tag(&self) -> &'static str {
        FAKE
    }

    fn detect(&self, image: &CanonicalFace, _config: &DetectConfig) -> Result<Option<Descriptor>> {
        let raw = image.as_rgb().as_raw();
        let mean = raw.iter().map(|&v| v as f32).sum::<f32>() / raw.len() as f32;
        match mean.round() as u32 {
            0..=9 => Ok(None),
            13 => anyhow::bail!("provider crashed"),
            77 => {
                std::thread::sleep(Duration::from_secs(3));
                Ok(None)
            }
            _ => Ok(Some(Descriptor::new(FAKE, vec![mean / 255.0, 0.0]))),
        }
    }
}

/// A healthy provider that, like the ONNX pipeline, runs one call at a time.
struct SerializedEmbedder {
    per_call: Duration,
    lock: Mutex<()>,
}

impl FaceEmbedder for SerializedEmbedder {
    fn provider_tag(&self) -> &'static str {
        FAKE
    }

    fn max_concurrent_calls(&self) -> usize {
        1
    }

    fn detect(&self, image: &CanonicalFace, _config: &DetectConfig) -> Result<Option<Descriptor>> {
        let _guard = self.lock.lock();
        std::thread::sleep(self.per_call);
        let mean = image.as_rgb().as_raw()[0] as f32;
        Ok(Some(Descriptor::new(FAKE, vec![mean / 255.0, 0.0])))
    }
}

/// Returns descriptors stamped with a different provider than it claims.
struct MislabelledEmbedder;

impl FaceEmbedder for MislabelledEmbedder {
    fn provider_tag(&self) -> &'static str {
        FAKE
    }

    fn detect(&self, _image: &CanonicalFace, _config: &DetectConfig) -> Result<Option<Descriptor>> {
        Ok(Some(Descriptor::new("other-model", vec![0.5, 0.0])))
    }
}

#[derive(Default)]
struct MemoryStore {
    accounts: HashMap<String, Vec<ReferenceEntry>>,
    lookups: AtomicUsize,
    delay: Option<Duration>,
    broken: bool,
}

impl MemoryStore {
    fn with_account(mut self, account: &str, entries: Vec<ReferenceEntry>) -> Self {
        self.accounts.insert(account.to_string(), entries);
        self
    }
}

impl AccountStore for MemoryStore {
    fn references(&self, account_id: &str, kind: ReferenceKind) -> Result<ReferenceSet, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.broken {
            return Err(StoreError::Unavailable(anyhow::anyhow!("connection refused")));
        }
        let entries = self
            .accounts
            .get(account_id)
            .ok_or_else(|| StoreError::UnknownAccount(account_id.to_string()))?;
        let entries: Vec<_> = entries.iter().filter(|e| e.kind == kind).cloned().collect();
        if entries.is_empty() {
            return Err(StoreError::NoApprovedEntries {
                account: account_id.to_string(),
                kind: kind.as_str(),
            });
        }
        Ok(ReferenceSet {
            required_signatures: 1,
            entries,
        })
    }
}

fn gray_png(width: u32, height: u32, value: u8) -> Vec<u8> {
    let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([value])));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn face_ref(id: &str, value: u8) -> ReferenceEntry {
    ReferenceEntry {
        source_id: id.to_string(),
        kind: ReferenceKind::Face,
        mime: "image/png".to_string(),
        approved: true,
        payload: gray_png(64, 64, value),
    }
}

fn live(value: u8) -> UploadedImage {
    UploadedImage::new(gray_png(64, 64, value), "image/png")
}

fn quick_config() -> Config {
    let mut cfg = Config::default();
    cfg.limits.collaborator_timeout_ms = 1_000;
    cfg
}

fn verifier(store: MemoryStore) -> (FaceVerifier, Arc<MemoryStore>) {
    let store = Arc::new(store);
    let verifier = FaceVerifier::new(store.clone(), Arc::new(GrayMeanEmbedder), &quick_config());
    (verifier, store)
}

#[tokio::test]
async fn undetectable_reference_does_not_block_a_match() {
    let (verifier, _) = verifier(
        MemoryStore::default().with_account("ACC-1", vec![face_ref("dark", 0), face_ref("same", 100)]),
    );
    let outcome = verifier.verify("ACC-1", &live(100)).await.unwrap();

    assert!(outcome.is_match);
    assert_eq!(outcome.faces.len(), 2);
    assert_eq!(outcome.faces[0].source_id, "dark");
    assert!(!outcome.faces[0].is_match);
    assert_eq!(outcome.faces[0].similarity, 0.0);
    assert_eq!(outcome.faces[0].failure_reason, Some(CandidateFailure::NoFaceDetected));
    assert_eq!(outcome.faces[1].distance, Some(0.0));
    assert_eq!(outcome.best_similarity, 1.0);
}

#[tokio::test]
async fn distant_reference_is_compared_but_rejected() {
    let (verifier, _) =
        verifier(MemoryStore::default().with_account("ACC-1", vec![face_ref("other", 250)]));
    let outcome = verifier.verify("ACC-1", &live(100)).await.unwrap();

    assert!(!outcome.is_match);
    assert!(outcome.faces[0].failure_reason.is_none());
    let expected = 1.0 - 150.0 / 255.0;
    assert!((outcome.best_similarity - expected).abs() < 1e-4);
}

#[tokio::test]
async fn all_failed_references_give_zero_best_similarity() {
    let mut corrupt = face_ref("corrupt", 100);
    corrupt.payload = b"not an image".to_vec();
    let mut gif = face_ref("gif", 100);
    gif.mime = "image/gif".to_string();

    let (verifier, _) = verifier(
        MemoryStore::default().with_account("ACC-1", vec![face_ref("dark", 3), corrupt, gif]),
    );
    let outcome = verifier.verify("ACC-1", &live(100)).await.unwrap();

    assert!(!outcome.is_match);
    assert_eq!(outcome.best_similarity, 0.0);
    let reasons: Vec<String> = outcome
        .faces
        .iter()
        .map(|f| String::from(f.failure_reason.clone().unwrap()))
        .collect();
    assert!(reasons[0].starts_with("NoFaceDetected"));
    assert!(reasons[1].starts_with("DecodeError"));
    assert!(reasons[2].starts_with("UnsupportedFormat"));
}

#[tokio::test]
async fn provider_failure_on_one_reference_is_recorded() {
    let (verifier, _) = verifier(
        MemoryStore::default().with_account("ACC-1", vec![face_ref("crash", 13), face_ref("ok", 100)]),
    );
    let outcome = verifier.verify("ACC-1", &live(100)).await.unwrap();

    assert!(outcome.is_match);
    assert!(matches!(
        outcome.faces[0].failure_reason,
        Some(CandidateFailure::Provider(_))
    ));
}

#[tokio::test]
async fn slow_reference_times_out_without_dropping_others() {
    let (verifier, _) = verifier(
        MemoryStore::default().with_account("ACC-1", vec![face_ref("slow", 77), face_ref("ok", 100)]),
    );
    let outcome = verifier.verify("ACC-1", &live(100)).await.unwrap();

    assert_eq!(outcome.faces.len(), 2);
    assert_eq!(outcome.faces[0].failure_reason, Some(CandidateFailure::TimedOut));
    assert!(outcome.faces[1].is_match);
}

#[tokio::test]
async fn live_without_face_fails_before_store_lookup() {
    let (verifier, store) =
        verifier(MemoryStore::default().with_account("ACC-1", vec![face_ref("same", 100)]));
    let err = verifier.verify("ACC-1", &live(0)).await.unwrap_err();

    assert!(matches!(err, VerifyError::NoLiveFace));
    assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn undecodable_live_image_is_fatal() {
    let (verifier, _) =
        verifier(MemoryStore::default().with_account("ACC-1", vec![face_ref("same", 100)]));
    let err = verifier
        .verify("ACC-1", &UploadedImage::new(b"garbage".to_vec(), "image/jpeg"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "DecodeError");
}

#[tokio::test]
async fn oversize_live_image_is_fatal() {
    let store = Arc::new(MemoryStore::default().with_account("ACC-1", vec![face_ref("same", 100)]));
    let mut cfg = quick_config();
    cfg.normalize.max_input_bytes = 16;
    let verifier = FaceVerifier::new(store, Arc::new(GrayMeanEmbedder), &cfg);

    let err = verifier.verify("ACC-1", &live(100)).await.unwrap_err();
    assert_eq!(err.kind(), "OversizeInput");
}

#[tokio::test]
async fn provider_failure_on_live_image_is_fatal() {
    let (verifier, _) =
        verifier(MemoryStore::default().with_account("ACC-1", vec![face_ref("same", 100)]));
    let err = verifier.verify("ACC-1", &live(13)).await.unwrap_err();
    assert_eq!(err.kind(), "ExternalCollaboratorUnavailable");
}

#[tokio::test]
async fn account_without_face_references_is_an_empty_candidate_set() {
    let mut signature = face_ref("sig", 100);
    signature.kind = ReferenceKind::Signature;
    let (verifier, _) = verifier(MemoryStore::default().with_account("ACC-1", vec![signature]));

    let err = verifier.verify("ACC-1", &live(100)).await.unwrap_err();
    assert_eq!(err.kind(), "EmptyCandidateSet");
}

#[tokio::test]
async fn unknown_account_is_reported() {
    let (verifier, _) = verifier(MemoryStore::default());
    let err = verifier.verify("missing", &live(100)).await.unwrap_err();
    assert!(matches!(err, VerifyError::UnknownAccount { ref account } if account == "missing"));
}

#[tokio::test]
async fn unreachable_store_is_fatal() {
    let store = MemoryStore {
        broken: true,
        ..MemoryStore::default()
    };
    let (verifier, _) = verifier(store);
    let err = verifier.verify("ACC-1", &live(100)).await.unwrap_err();
    assert_eq!(err.kind(), "ExternalCollaboratorUnavailable");
    assert!(err.to_string().contains("connection refused"));
}

#[tokio::test]
async fn slow_store_is_bounded_by_timeout() {
    let store = MemoryStore {
        delay: Some(Duration::from_secs(3)),
        ..MemoryStore::default()
    }
    .with_account("ACC-1", vec![face_ref("same", 100)]);
    let (verifier, _) = verifier(store);

    let err = verifier.verify("ACC-1", &live(100)).await.unwrap_err();
    assert_eq!(err.kind(), "ExternalCollaboratorUnavailable");
}

#[tokio::test]
async fn outcome_json_follows_caller_contract() {
    let (verifier, _) = verifier(
        MemoryStore::default().with_account("ACC-1", vec![face_ref("ref-1", 100), face_ref("ref-2", 0)]),
    );
    let outcome = verifier.verify("ACC-1", &live(100)).await.unwrap();
    let json = serde_json::to_value(&outcome).unwrap();

    assert_eq!(json["isMatch"], true);
    assert_eq!(json["bestSimilarity"], 1.0);
    assert_eq!(json["faces"][0]["sourceId"], "ref-1");
    assert_eq!(json["faces"][1]["isMatch"], false);
    assert_eq!(json["faces"][1]["similarity"], 0.0);
    assert!(json["faces"][1]["failureReason"].is_string());
}

#[tokio::test]
async fn serialized_provider_does_not_time_out_queued_references() {
    let references = (0..6).map(|i| face_ref(&format!("r{i}"), 100)).collect();
    let store = Arc::new(MemoryStore::default().with_account("ACC-1", references));
    let embedder = Arc::new(SerializedEmbedder {
        per_call: Duration::from_millis(300),
        lock: Mutex::new(()),
    });
    let verifier = FaceVerifier::new(store, embedder, &quick_config());

    let outcome = verifier.verify("ACC-1", &live(100)).await.unwrap();
    assert_eq!(outcome.faces.len(), 6);
    for face in &outcome.faces {
        assert!(face.failure_reason.is_none(), "{}: {:?}", face.source_id, face.failure_reason);
        assert!(face.is_match);
    }
}

#[tokio::test]
async fn live_descriptor_from_another_provider_is_refused() {
    let store = Arc::new(MemoryStore::default().with_account("ACC-1", vec![face_ref("same", 100)]));
    let verifier = FaceVerifier::new(store.clone(), Arc::new(MislabelledEmbedder), &quick_config());

    let err = verifier.verify("ACC-1", &live(100)).await.unwrap_err();
    assert_eq!(err.kind(), "ExternalCollaboratorUnavailable");
    assert!(err.to_string().contains("other-model"));
    assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
}
