use std::sync::Arc;

use anyhow::{Context, Result};
use idmatch_vision::{DetectConfig, FaceEmbedder, Normalizer, UploadedImage};
use log::info;
use serde::Serialize;

use crate::config::Config;
use crate::error::VerifyError;
use crate::storage::{FileAccountStore, ReferenceEntry, ReferenceKind};

/// Stored reference without its payload, for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceSummary {
    pub source_id: String,
    pub kind: &'static str,
    pub mime: String,
    pub approved: bool,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub account: String,
    pub required_signatures: u32,
    pub references: Vec<ReferenceSummary>,
}

/// Writes reference images into the file-backed account store after checking
/// they would be usable for verification.
pub struct Enroller {
    store: FileAccountStore,
    normalizer: Normalizer,
    embedder: Option<Arc<dyn FaceEmbedder>>,
    detect: DetectConfig,
}

impl Enroller {
    pub fn new(store: FileAccountStore, cfg: &Config) -> Self {
        Self {
            store,
            normalizer: Normalizer::new(cfg.normalize_config()),
            embedder: None,
            detect: cfg.detect_config(),
        }
    }

    /// Face enrollment needs a provider to confirm a face is detectable.
    pub fn with_embedder(mut self, embedder: Arc<dyn FaceEmbedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn enroll(
        &self,
        account: &str,
        kind: ReferenceKind,
        upload: UploadedImage,
        source_id: Option<String>,
    ) -> Result<String> {
        match kind {
            ReferenceKind::Face => {
                let embedder = self
                    .embedder
                    .as_ref()
                    .context("face enrollment requires a loaded embedding provider")?;
                let canonical = self.normalizer.face(&upload).map_err(VerifyError::from)?;
                if embedder.detect(&canonical, &self.detect)?.is_none() {
                    anyhow::bail!("no face detected in the enrollment image");
                }
            }
            ReferenceKind::Signature => {
                self.normalizer.signature(&upload).map_err(VerifyError::from)?;
            }
        }

        let source_id = source_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.store.add_reference(
            account,
            ReferenceEntry {
                source_id: source_id.clone(),
                kind,
                mime: upload.mime,
                approved: true,
                payload: upload.bytes,
            },
        )?;

        info!("enrolled {} reference {} for account {}", kind.as_str(), source_id, account);
        Ok(source_id)
    }

    pub fn set_required_signatures(&self, account: &str, required: u32) -> Result<()> {
        self.store.set_required_signatures(account, required)?;
        info!("account {} now requires {} signature(s)", account, required);
        Ok(())
    }

    pub fn purge(&self, account: &str) -> Result<()> {
        self.store.purge(account)?;
        info!("purged all references for account {}", account);
        Ok(())
    }

    pub fn summary(&self, account: &str) -> Result<AccountSummary> {
        let record = self
            .store
            .load_record(account)?
            .ok_or_else(|| VerifyError::UnknownAccount {
                account: account.to_string(),
            })?;

        Ok(AccountSummary {
            account: account.to_string(),
            required_signatures: record.required_signatures,
            references: record
                .references
                .iter()
                .map(|r| ReferenceSummary {
                    source_id: r.source_id.clone(),
                    kind: r.kind.as_str(),
                    mime: r.mime.clone(),
                    approved: r.approved,
                    bytes: r.payload.len(),
                })
                .collect(),
        })
    }
}
