use std::process::ExitCode;

use idmatch_vision::VisionError;
use serde::Serialize;
use thiserror::Error;

/// Request-level failures. Anything returned as `Err` aborted the whole request.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Image(#[from] VisionError),

    #[error("no face detected in the live image")]
    NoLiveFace,

    #[error("account {account} has no reference images available")]
    EmptyCandidateSet { account: String },

    #[error("account {account} is not known")]
    UnknownAccount { account: String },

    #[error("{collaborator} unavailable: {message}")]
    ExternalCollaboratorUnavailable {
        collaborator: &'static str,
        message: String,
    },
}

impl VerifyError {
    pub(crate) fn unavailable(collaborator: &'static str, message: impl Into<String>) -> Self {
        VerifyError::ExternalCollaboratorUnavailable {
            collaborator,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            VerifyError::Image(inner) => inner.kind(),
            VerifyError::NoLiveFace => "NoLiveFace",
            VerifyError::EmptyCandidateSet { .. } => "EmptyCandidateSet",
            VerifyError::UnknownAccount { .. } => "UnknownAccount",
            VerifyError::ExternalCollaboratorUnavailable { .. } => "ExternalCollaboratorUnavailable",
        }
    }

    /// Process exit status for the CLI; 1 is left to unclassified failures.
    pub fn exit_status(&self) -> u8 {
        match self {
            VerifyError::Image(_) => 2,
            VerifyError::NoLiveFace => 3,
            VerifyError::EmptyCandidateSet { .. } | VerifyError::UnknownAccount { .. } => 4,
            VerifyError::ExternalCollaboratorUnavailable { .. } => 5,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Structured error body handed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
}

pub type VerifyResult<T> = Result<T, VerifyError>;
