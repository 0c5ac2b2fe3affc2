//! Verification entry points: face against an account, signature against a
//! signature, signature against an account.
//!
//! Live-side work is fail-fast. Reference-side work is spawned as one task per
//! reference and joined into a vector indexed by reference position; a task that
//! fails, panics or misses its deadline leaves a recorded failure in its slot.
//! Every blocking collaborator call runs on the blocking pool under its own
//! timeout, which starts once the call may actually reach the collaborator.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use idmatch_vision::{
    compare_signatures, CanonicalSignature, DetectConfig, Descriptor, FaceEmbedder, Normalizer,
    SignatureSimilarity, UploadedImage,
};
use log::{debug, info, warn};
use serde::{Serialize, Serializer};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio::time;

use crate::config::Config;
use crate::error::{VerifyError, VerifyResult};
use crate::matcher::{self, Candidate, CandidateFailure, VerificationOutcome};
use crate::storage::{AccountStore, ReferenceEntry, ReferenceKind, ReferenceSet, StoreError};

/// Why a blocking call produced no value.
#[derive(Debug, Clone, PartialEq)]
enum Interrupted {
    TimedOut,
    Aborted(String),
}

impl From<Interrupted> for CandidateFailure {
    fn from(interrupted: Interrupted) -> Self {
        match interrupted {
            Interrupted::TimedOut => CandidateFailure::TimedOut,
            Interrupted::Aborted(reason) => CandidateFailure::Provider(format!("worker aborted: {reason}")),
        }
    }
}

/// Run `job` on the blocking pool and wait at most `limit` for it. A job that
/// misses the deadline keeps running detached; its result is discarded.
async fn bounded<T, F>(limit: Duration, job: F) -> Result<T, Interrupted>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match time::timeout(limit, task::spawn_blocking(job)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join)) => Err(Interrupted::Aborted(join.to_string())),
        Err(_) => Err(Interrupted::TimedOut),
    }
}

/// Spawn one task per item and join them. The result has one slot per item, in
/// item order; nothing is dropped and no failure cancels the others.
async fn scatter<I, T, F, Fut>(items: Vec<I>, job: F) -> Vec<Result<T, CandidateFailure>>
where
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, CandidateFailure>> + Send + 'static,
{
    let mut slots: Vec<Option<Result<T, CandidateFailure>>> = items.iter().map(|_| None).collect();
    let mut tasks = JoinSet::new();
    for (index, item) in items.into_iter().enumerate() {
        let work = job(item);
        tasks.spawn(async move { (index, work.await) });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => slots[index] = Some(result),
            Err(e) => warn!("reference task ended without a result: {}", e),
        }
    }

    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| Err(CandidateFailure::Provider("worker exited without a result".into())))
        })
        .collect()
}

fn unavailable_after(collaborator: &'static str, interrupted: Interrupted, limit: Duration) -> VerifyError {
    match interrupted {
        Interrupted::TimedOut => {
            VerifyError::unavailable(collaborator, format!("no answer within {} ms", limit.as_millis()))
        }
        Interrupted::Aborted(reason) => {
            VerifyError::unavailable(collaborator, format!("worker aborted: {reason}"))
        }
    }
}

async fn fetch_references(
    store: &Arc<dyn AccountStore>,
    account: &str,
    kind: ReferenceKind,
    limit: Duration,
) -> VerifyResult<ReferenceSet> {
    let store = Arc::clone(store);
    let account_owned = account.to_string();
    let fetched = bounded(limit, move || store.references(&account_owned, kind))
        .await
        .map_err(|interrupted| unavailable_after("account store", interrupted, limit))?;

    match fetched {
        Ok(set) => {
            debug!("account {}: {} {} reference(s)", account, set.entries.len(), kind.as_str());
            Ok(set)
        }
        Err(StoreError::UnknownAccount(account)) => Err(VerifyError::UnknownAccount { account }),
        Err(StoreError::NoApprovedEntries { account, .. }) => Err(VerifyError::EmptyCandidateSet { account }),
        Err(StoreError::Unavailable(e)) => Err(VerifyError::unavailable("account store", format!("{e:#}"))),
    }
}

/// Face verification against the references enrolled for an account.
pub struct FaceVerifier {
    store: Arc<dyn AccountStore>,
    embedder: Arc<dyn FaceEmbedder>,
    provider_slots: Arc<Semaphore>,
    normalizer: Normalizer,
    detect: DetectConfig,
    threshold: f32,
    timeout: Duration,
}

impl FaceVerifier {
    pub fn new(store: Arc<dyn AccountStore>, embedder: Arc<dyn FaceEmbedder>, cfg: &Config) -> Self {
        let slots = embedder.max_concurrent_calls().clamp(1, Semaphore::MAX_PERMITS);
        Self {
            store,
            embedder,
            provider_slots: Arc::new(Semaphore::new(slots)),
            normalizer: Normalizer::new(cfg.normalize_config()),
            detect: cfg.detect_config(),
            threshold: cfg.threshold,
            timeout: cfg.collaborator_timeout(),
        }
    }

    pub async fn verify(&self, account: &str, live: &UploadedImage) -> VerifyResult<VerificationOutcome> {
        let started = Instant::now();
        let live = self.live_descriptor(live).await?;

        let references = fetch_references(&self.store, account, ReferenceKind::Face, self.timeout).await?;
        let candidates = self.extract_candidates(references.entries).await;
        let outcome = matcher::aggregate(account, Some(&live), candidates, self.threshold)?;

        info!(
            "account {}: match={} best={:.4} compared {}/{} in {} ms",
            account,
            outcome.is_match,
            outcome.best_similarity,
            outcome.compared(),
            outcome.faces.len(),
            started.elapsed().as_millis()
        );
        Ok(outcome)
    }

    async fn live_descriptor(&self, live: &UploadedImage) -> VerifyResult<Descriptor> {
        let normalizer = self.normalizer.clone();
        let upload = live.clone();
        let canonical = task::spawn_blocking(move || normalizer.face(&upload))
            .await
            .map_err(|e| VerifyError::unavailable("image normalizer", e.to_string()))??;

        let _slot = self
            .provider_slots
            .acquire()
            .await
            .map_err(|_| VerifyError::unavailable("embedding provider", "provider queue closed"))?;
        let embedder = Arc::clone(&self.embedder);
        let detect = self.detect;
        let detected = bounded(self.timeout, move || embedder.detect(&canonical, &detect))
            .await
            .map_err(|interrupted| unavailable_after("embedding provider", interrupted, self.timeout))?;

        let expected = self.embedder.provider_tag();
        match detected {
            Ok(Some(descriptor)) if descriptor.provider() != expected => Err(VerifyError::unavailable(
                "embedding provider",
                format!("returned a {} descriptor, expected {}", descriptor.provider(), expected),
            )),
            Ok(Some(descriptor)) => Ok(descriptor),
            Ok(None) => Err(VerifyError::NoLiveFace),
            Err(e) => Err(VerifyError::unavailable("embedding provider", format!("{e:#}"))),
        }
    }

    async fn extract_candidates(&self, entries: Vec<ReferenceEntry>) -> Vec<Candidate> {
        let ids: Vec<String> = entries.iter().map(|e| e.source_id.clone()).collect();
        let limit = self.timeout;
        let detect = self.detect;

        let results = scatter(entries, |entry: ReferenceEntry| {
            let normalizer = self.normalizer.clone();
            let embedder = Arc::clone(&self.embedder);
            let slots = Arc::clone(&self.provider_slots);
            async move {
                let canonical = task::spawn_blocking(move || normalizer.face(&entry.into_upload()))
                    .await
                    .map_err(|e| CandidateFailure::Provider(format!("normalization aborted: {e}")))?
                    .map_err(|e| CandidateFailure::from(&e))?;

                // Queue for the provider before the clock starts.
                let _slot = slots
                    .acquire_owned()
                    .await
                    .map_err(|_| CandidateFailure::Provider("provider queue closed".into()))?;
                match bounded(limit, move || embedder.detect(&canonical, &detect)).await? {
                    Ok(Some(descriptor)) => Ok(descriptor),
                    Ok(None) => Err(CandidateFailure::NoFaceDetected),
                    Err(e) => Err(CandidateFailure::Provider(format!("{e:#}"))),
                }
            }
        })
        .await;

        ids.into_iter()
            .zip(results)
            .map(|(source_id, descriptor)| {
                if let Err(failure) = &descriptor {
                    warn!("reference {} not comparable: {}", source_id, failure);
                }
                Candidate {
                    source_id,
                    descriptor,
                }
            })
            .collect()
    }
}

fn four_decimals<S: Serializer>(value: &SignatureSimilarity, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Caller-facing body of a direct signature comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignatureComparison {
    #[serde(serialize_with = "four_decimals")]
    pub similarity: SignatureSimilarity,
}

/// Compare two directly uploaded signatures.
pub fn compare_uploaded_signatures(
    normalizer: &Normalizer,
    first: &UploadedImage,
    second: &UploadedImage,
) -> VerifyResult<SignatureComparison> {
    let a = normalizer.signature(first)?;
    let b = normalizer.signature(second)?;
    let similarity = compare_signatures(&a, &b)?;
    debug!("signature similarity {}", similarity);
    Ok(SignatureComparison { similarity })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureMatch {
    pub source_id: String,
    pub is_match: bool,
    #[serde(serialize_with = "four_decimals")]
    pub similarity: SignatureSimilarity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<CandidateFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureOutcome {
    pub is_match: bool,
    pub required_signatures: u32,
    pub accepted: usize,
    #[serde(serialize_with = "four_decimals")]
    pub best_similarity: SignatureSimilarity,
    pub signatures: Vec<SignatureMatch>,
}

/// Signature verification against the signatures enrolled for an account.
pub struct SignatureVerifier {
    store: Arc<dyn AccountStore>,
    normalizer: Normalizer,
    threshold: f64,
    timeout: Duration,
}

impl SignatureVerifier {
    pub fn new(store: Arc<dyn AccountStore>, cfg: &Config) -> Self {
        Self {
            store,
            normalizer: Normalizer::new(cfg.normalize_config()),
            threshold: cfg.signature_threshold,
            timeout: cfg.collaborator_timeout(),
        }
    }

    pub async fn verify(&self, account: &str, upload: &UploadedImage) -> VerifyResult<SignatureOutcome> {
        let normalizer = self.normalizer.clone();
        let live_upload = upload.clone();
        let live = task::spawn_blocking(move || normalizer.signature(&live_upload))
            .await
            .map_err(|e| VerifyError::unavailable("image normalizer", e.to_string()))??;
        let live = Arc::new(live);

        let references =
            fetch_references(&self.store, account, ReferenceKind::Signature, self.timeout).await?;
        if references.entries.is_empty() {
            return Err(VerifyError::EmptyCandidateSet {
                account: account.to_string(),
            });
        }

        let ids: Vec<String> = references.entries.iter().map(|e| e.source_id.clone()).collect();
        let limit = self.timeout;
        let results = scatter(references.entries, |entry: ReferenceEntry| {
            let normalizer = self.normalizer.clone();
            let live = Arc::clone(&live);
            async move {
                bounded(limit, move || -> Result<SignatureSimilarity, CandidateFailure> {
                    let reference: CanonicalSignature = normalizer
                        .signature(&entry.into_upload())
                        .map_err(|e| CandidateFailure::from(&e))?;
                    compare_signatures(&live, &reference).map_err(|e| CandidateFailure::from(&e))
                })
                .await?
            }
        })
        .await;

        let signatures: Vec<SignatureMatch> = ids
            .into_iter()
            .zip(results)
            .map(|(source_id, result)| match result {
                Ok(similarity) => SignatureMatch {
                    source_id,
                    is_match: similarity.value() >= self.threshold,
                    similarity,
                    failure_reason: None,
                },
                Err(failure) => {
                    warn!("signature reference {} not comparable: {}", source_id, failure);
                    SignatureMatch {
                        source_id,
                        is_match: false,
                        similarity: SignatureSimilarity(0.0),
                        failure_reason: Some(failure),
                    }
                }
            })
            .collect();

        let accepted = signatures.iter().filter(|s| s.is_match).count();
        let required = references.required_signatures.max(1);
        let best_similarity = signatures
            .iter()
            .map(|s| s.similarity)
            .fold(SignatureSimilarity(0.0), |best, s| if s > best { s } else { best });

        info!(
            "account {}: {} of {} signature reference(s) accepted, {} required",
            account,
            accepted,
            signatures.len(),
            required
        );

        Ok(SignatureOutcome {
            is_match: accepted >= required as usize,
            required_signatures: required,
            accepted,
            best_similarity,
            signatures,
        })
    }
}
