//! Error types for the import pipeline and query engine
//!
//! Errors are classified by who has to act on them:
//! - RequiresUserAction: no usable SQLCipher backend, or the key is wrong
//! - NonRetryable: missing/short input files, malformed source rows, unknown accounts

use std::path::PathBuf;

use thiserror::Error;

use crate::db::DbError;

/// Operator-facing remediation attached to every `DecryptionUnavailable`.
pub const DECRYPT_REMEDIATION: &str = "Unable to decrypt the database. Build with the bundled \
SQLCipher engine or install an `sqlcipher` shell (sqlcipher, sqlcipher-x64 or sqlcipher-x86) \
on PATH. Alternatively decrypt group_info.db by hand and import the resulting \
group_info.decrypted.db with the `decrypted` stage.";

/// One backend's reason for failing a decrypt attempt.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BackendFailure {
    pub backend: String,
    pub reason: String,
}

impl std::fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.backend, self.reason)
    }
}

/// Error types for the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Source file {path} unusable: {reason}")]
    SourceFile {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("{remediation} (attempts: {})", format_attempts(.attempts))]
    DecryptionUnavailable {
        attempts: Vec<BackendFailure>,
        remediation: String,
    },

    #[error("Transform failed: {context}")]
    Transform {
        context: String,
        #[source]
        source: DbError,
    },

    #[error("No analysis database for account {0}")]
    AccountNotFound(String),

    #[error("Storage for account {account_id} is busy: {reason}")]
    StorageBusy { account_id: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

fn format_attempts(attempts: &[BackendFailure]) -> String {
    if attempts.is_empty() {
        return "none".to_string();
    }
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl PipelineError {
    pub(crate) fn source_file(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::SourceFile {
            path: path.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn source_io(
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
        err: std::io::Error,
    ) -> Self {
        PipelineError::SourceFile {
            path: path.into(),
            reason: reason.into(),
            source: Some(err),
        }
    }

    pub(crate) fn transform(context: impl Into<String>, source: impl Into<DbError>) -> Self {
        PipelineError::Transform {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Returns true if an operator has to install something or supply a
    /// different file before the call can succeed.
    pub fn requires_user_action(&self) -> bool {
        matches!(self, PipelineError::DecryptionUnavailable { .. })
    }

    /// Short machine-readable kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SourceFile { .. } => "source_file",
            PipelineError::DecryptionUnavailable { .. } => "decryption_unavailable",
            PipelineError::Transform { .. } => "transform",
            PipelineError::AccountNotFound(_) => "account_not_found",
            PipelineError::StorageBusy { .. } => "storage_busy",
            PipelineError::InvalidInput(_) => "invalid_input",
        }
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> String {
        match self {
            PipelineError::SourceFile { .. } => {
                "Check that the file exists, is readable and was copied completely.".to_string()
            }
            PipelineError::DecryptionUnavailable { remediation, .. } => remediation.clone(),
            PipelineError::Transform { .. } => {
                "Check that the decrypted file is a group_info database; previous data was kept."
                    .to_string()
            }
            PipelineError::AccountNotFound(_) => "Import data for this account first.".to_string(),
            PipelineError::StorageBusy { .. } => {
                "Close other users of this account's database and try again.".to_string()
            }
            PipelineError::InvalidInput(_) => "Check the request parameters.".to_string(),
        }
    }
}

/// Serializable error representation for JSON callers
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub message: String,
    pub kind: &'static str,
    pub requires_user_action: bool,
    pub recovery_suggestion: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<BackendFailure>,
}

impl From<&PipelineError> for ErrorReport {
    fn from(err: &PipelineError) -> Self {
        let attempts = match err {
            PipelineError::DecryptionUnavailable { attempts, .. } => attempts.clone(),
            _ => Vec::new(),
        };
        ErrorReport {
            message: err.to_string(),
            kind: err.kind(),
            requires_user_action: err.requires_user_action(),
            recovery_suggestion: err.recovery_suggestion(),
            attempts,
        }
    }
}
