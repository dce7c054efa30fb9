//! SQLCipher decryption of the header-stripped database.
//!
//! Decryption opens the encrypted file with the client's fixed cipher
//! parameters, attaches an empty plaintext database and runs
//! `sqlcipher_export`. Several backends can do that; `Decryptor` tries them
//! in order and the first success wins. Failures are collected and only
//! reported when every backend has failed.
//!
//! Each attempt exports into `<output>.partial`, checks the result opens as a
//! plaintext database and only then renames it over `output`, so a failed
//! attempt never leaves anything that looks like a finished export.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

use crate::config::Config;
use crate::error::{BackendFailure, PipelineError, DECRYPT_REMEDIATION};

pub mod in_process;
pub mod shell;

pub use in_process::InProcessBackend;
pub use shell::ShellBackend;

/// The cipher settings the client encrypts `group_info.db` with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherParams {
    pub page_size: u32,
    pub kdf_iter: u32,
    pub hmac_algorithm: &'static str,
    pub kdf_algorithm: &'static str,
    pub cipher: &'static str,
}

impl CipherParams {
    pub const GROUP_INFO: CipherParams = CipherParams {
        page_size: 4096,
        kdf_iter: 4000,
        hmac_algorithm: "HMAC_SHA1",
        kdf_algorithm: "PBKDF2_HMAC_SHA512",
        cipher: "aes-256-cbc",
    };

    /// `PRAGMA key` followed by the parameter pragmas, in the order SQLCipher
    /// needs them: before the first page is read.
    pub fn key_pragmas(&self, key: &str) -> String {
        format!(
            "PRAGMA key = {};\n\
             PRAGMA cipher_page_size = {};\n\
             PRAGMA kdf_iter = {};\n\
             PRAGMA cipher_hmac_algorithm = {};\n\
             PRAGMA cipher_default_kdf_algorithm = {};\n\
             PRAGMA cipher = {};\n",
            sql_literal(key),
            self.page_size,
            self.kdf_iter,
            self.hmac_algorithm,
            self.kdf_algorithm,
            sql_literal(self.cipher),
        )
    }

    /// Complete attach/export/detach script for a shell backend.
    pub fn export_script(&self, key: &str, plaintext: &Path) -> String {
        let plaintext = plaintext.to_string_lossy().replace('\\', "/");
        format!(
            "{}ATTACH DATABASE {} AS plaintext KEY '';\n\
             SELECT sqlcipher_export('plaintext');\n\
             DETACH DATABASE plaintext;\n",
            self.key_pragmas(key),
            sql_literal(&plaintext),
        )
    }
}

impl Default for CipherParams {
    fn default() -> Self {
        Self::GROUP_INFO
    }
}

/// Quote a string as an SQL literal.
pub(crate) fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Why one backend could not produce a plaintext export.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0}")]
    NotInstalled(String),

    #[error("SQLCipher error: {0}")]
    Engine(#[from] rusqlite::Error),

    #[error("exited with status {}: {stderr}", exit_label(.code))]
    Exit { code: Option<i32>, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("export is not a readable database: {0}")]
    Verify(String),
}

fn exit_label(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

/// One way of running the SQLCipher export.
pub trait DecryptBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decrypt `input` into a new plaintext database at `plaintext`.
    fn export(
        &self,
        input: &Path,
        plaintext: &Path,
        key: &str,
        params: &CipherParams,
    ) -> Result<(), BackendError>;
}

/// Ordered list of backends sharing one parameter set.
pub struct Decryptor {
    backends: Vec<Box<dyn DecryptBackend>>,
    params: CipherParams,
}

impl Decryptor {
    pub fn new(backends: Vec<Box<dyn DecryptBackend>>) -> Self {
        Self {
            backends,
            params: CipherParams::GROUP_INFO,
        }
    }

    /// In-process SQLCipher first, then the configured shell candidates.
    pub fn from_config(config: &Config) -> Self {
        Self::new(vec![
            Box::new(InProcessBackend),
            Box::new(ShellBackend::new(config.sqlcipher_candidates.clone())),
        ])
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Decrypt `input` into `output`. Returns the name of the backend that
    /// succeeded.
    pub fn decrypt(&self, input: &Path, output: &Path, key: &str) -> Result<&'static str, PipelineError> {
        if key.is_empty() {
            return Err(PipelineError::InvalidInput(
                "decryption key must not be empty".to_string(),
            ));
        }
        if !input.is_file() {
            return Err(PipelineError::source_file(input, "encrypted file not found"));
        }

        let staging = staging_path(output);
        let mut attempts = Vec::new();

        for backend in &self.backends {
            log::info!("Decrypting {} with {} backend", input.display(), backend.name());
            match self.attempt(backend.as_ref(), input, output, &staging, key) {
                Ok(tables) => {
                    log::info!(
                        "Decrypted {} -> {} ({} schema objects) via {}",
                        input.display(),
                        output.display(),
                        tables,
                        backend.name()
                    );
                    return Ok(backend.name());
                }
                Err(e) => {
                    log::warn!("{} backend failed, trying next: {}", backend.name(), e);
                    let _ = remove_if_exists(&staging);
                    attempts.push(BackendFailure {
                        backend: backend.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(PipelineError::DecryptionUnavailable {
            attempts,
            remediation: DECRYPT_REMEDIATION.to_string(),
        })
    }

    fn attempt(
        &self,
        backend: &dyn DecryptBackend,
        input: &Path,
        output: &Path,
        staging: &Path,
        key: &str,
    ) -> Result<usize, BackendError> {
        remove_if_exists(output)?;
        remove_if_exists(staging)?;
        backend.export(input, staging, key, &self.params)?;
        let tables = verify_plaintext(staging)?;
        std::fs::rename(staging, output)?;
        Ok(tables)
    }
}

fn staging_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Open an export without a key and count its schema objects.
fn verify_plaintext(path: &Path) -> Result<usize, BackendError> {
    if !path.is_file() {
        return Err(BackendError::Verify(format!("{} was not created", path.display())));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| BackendError::Verify(e.to_string()))?;
    let n: i64 = conn
        .query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0))
        .map_err(|e| BackendError::Verify(e.to_string()))?;
    Ok(n as usize)
}
