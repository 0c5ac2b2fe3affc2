use std::path::PathBuf;

use anyhow::{Context, Result};
use idmatch_vision::UploadedImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const RECORD_FILE: &str = "account.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceKind {
    Face,
    Signature,
}

impl ReferenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceKind::Face => "face",
            ReferenceKind::Signature => "signature",
        }
    }
}

/// One enrolled reference image, payload stored inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub source_id: String,
    pub kind: ReferenceKind,
    pub mime: String,
    pub approved: bool,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ReferenceEntry {
    pub fn into_upload(self) -> UploadedImage {
        UploadedImage::new(self.payload, self.mime)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub required_signatures: u32,
    pub references: Vec<ReferenceEntry>,
}

/// Approved references of one kind, in enrollment order.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    pub required_signatures: u32,
    pub entries: Vec<ReferenceEntry>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account {0} is not known")]
    UnknownAccount(String),

    #[error("account {account} has no approved {kind} references")]
    NoApprovedEntries { account: String, kind: &'static str },

    #[error("account store unavailable: {0:#}")]
    Unavailable(#[from] anyhow::Error),
}

/// Account-record lookup consumed by the verifier.
pub trait AccountStore: Send + Sync {
    fn references(&self, account_id: &str, kind: ReferenceKind) -> Result<ReferenceSet, StoreError>;
}

/// Directory-per-account store with a postcard-encoded record in each.
#[derive(Debug, Clone)]
pub struct FileAccountStore {
    prefix: PathBuf,
}

impl FileAccountStore {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn account_dir(&self, account_id: &str) -> Result<PathBuf> {
        validate_account_id(account_id)?;
        Ok(self.prefix.join(account_id))
    }

    pub fn load_record(&self, account_id: &str) -> Result<Option<AccountRecord>> {
        let file = self.account_dir(account_id)?.join(RECORD_FILE);
        if !file.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
        let record = postcard::from_bytes(&data)
            .with_context(|| format!("decoding account record {}", file.display()))?;
        Ok(Some(record))
    }

    fn save_record(&self, account_id: &str, record: &AccountRecord) -> Result<()> {
        let dir = self.account_dir(account_id)?;
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let file = dir.join(RECORD_FILE);
        let data = postcard::to_allocvec(record)?;
        std::fs::write(&file, data).with_context(|| format!("writing {}", file.display()))?;
        Ok(())
    }

    pub fn add_reference(&self, account_id: &str, entry: ReferenceEntry) -> Result<()> {
        let mut record = self.load_record(account_id)?.unwrap_or_default();
        if record.references.iter().any(|r| r.source_id == entry.source_id) {
            anyhow::bail!(
                "account {} already has a reference with id {}",
                account_id,
                entry.source_id
            );
        }
        record.references.push(entry);
        self.save_record(account_id, &record)
    }

    pub fn set_required_signatures(&self, account_id: &str, required: u32) -> Result<()> {
        let mut record = self.load_record(account_id)?.unwrap_or_default();
        record.required_signatures = required;
        self.save_record(account_id, &record)
    }

    pub fn purge(&self, account_id: &str) -> Result<()> {
        let path = self.account_dir(account_id)?;
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(())
    }
}

impl AccountStore for FileAccountStore {
    fn references(&self, account_id: &str, kind: ReferenceKind) -> Result<ReferenceSet, StoreError> {
        if validate_account_id(account_id).is_err() {
            return Err(StoreError::UnknownAccount(account_id.to_string()));
        }
        let record = self
            .load_record(account_id)?
            .ok_or_else(|| StoreError::UnknownAccount(account_id.to_string()))?;

        let entries: Vec<ReferenceEntry> = record
            .references
            .into_iter()
            .filter(|r| r.approved && r.kind == kind)
            .collect();
        if entries.is_empty() {
            return Err(StoreError::NoApprovedEntries {
                account: account_id.to_string(),
                kind: kind.as_str(),
            });
        }

        Ok(ReferenceSet {
            required_signatures: record.required_signatures,
            entries,
        })
    }
}

fn validate_account_id(account_id: &str) -> Result<()> {
    if account_id.is_empty()
        || account_id.starts_with('.')
        || account_id.contains(['/', '\\', '\0'])
    {
        anyhow::bail!("invalid account id '{}'", account_id);
    }
    Ok(())
}
