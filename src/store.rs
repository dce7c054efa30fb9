//! Per-account storage and the registry of open analysis connections.
//!
//! Layout under the data directory:
//!
//! ```text
//! <data_dir>/<account_id>/group_info.db            raw copy from the device
//!                        /group_info.cleaned.db    container header removed
//!                        /group_info.decrypted.db  plaintext export
//!                        /group_data.db            analysis schema
//! ```
//!
//! Connections are opened lazily and cached per account. A cached handle must
//! be closed before the account's directory can be removed; open files block
//! deletion on some platforms.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::Config;
use crate::db::{AnalysisDb, DbImportRun};
use crate::error::PipelineError;
use crate::queries::QueryEngine;

pub const RAW_FILE: &str = "group_info.db";
pub const CLEANED_FILE: &str = "group_info.cleaned.db";
pub const DECRYPTED_FILE: &str = "group_info.decrypted.db";
pub const ANALYSIS_FILE: &str = "group_data.db";

/// Shared, mutex-guarded analysis connection for one account.
pub type DbHandle = Arc<Mutex<AnalysisDb>>;

/// Files belonging to one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPaths {
    pub dir: PathBuf,
    pub raw: PathBuf,
    pub cleaned: PathBuf,
    pub decrypted: PathBuf,
    pub analysis: PathBuf,
}

impl AccountPaths {
    fn new(dir: PathBuf) -> Self {
        Self {
            raw: dir.join(RAW_FILE),
            cleaned: dir.join(CLEANED_FILE),
            decrypted: dir.join(DECRYPTED_FILE),
            analysis: dir.join(ANALYSIS_FILE),
            dir,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub account_id: String,
    pub groups: usize,
    pub members: usize,
    pub last_import: Option<DbImportRun>,
}

pub struct AccountStore {
    data_dir: PathBuf,
    batch_size: usize,
    connections: Mutex<HashMap<String, DbHandle>>,
    /// Every handle ever opened per account, including ones evicted by
    /// `close_connection` that callers may still hold.
    opened: Mutex<HashMap<String, Vec<Weak<Mutex<AnalysisDb>>>>>,
}

impl AccountStore {
    pub fn new(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            batch_size: config.batch_size,
            connections: Mutex::new(HashMap::new()),
            opened: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Resolve an account's file layout without touching the disk.
    pub fn paths(&self, account_id: &str) -> Result<AccountPaths, PipelineError> {
        validate_account_id(account_id)?;
        Ok(AccountPaths::new(self.data_dir.join(account_id)))
    }

    /// Create the account directory if needed.
    pub fn create_account_dir(&self, account_id: &str) -> Result<AccountPaths, PipelineError> {
        let paths = self.paths(account_id)?;
        std::fs::create_dir_all(&paths.dir).map_err(|e| PipelineError::StorageBusy {
            account_id: account_id.to_string(),
            reason: format!("cannot create {}: {}", paths.dir.display(), e),
        })?;
        Ok(paths)
    }

    /// Cached connection to an existing analysis schema.
    pub fn get_connection(&self, account_id: &str) -> Result<DbHandle, PipelineError> {
        let paths = self.paths(account_id)?;
        let mut connections = self.connections.lock();
        if let Some(handle) = connections.get(account_id) {
            return Ok(handle.clone());
        }
        if !paths.analysis.is_file() {
            return Err(PipelineError::AccountNotFound(account_id.to_string()));
        }
        let handle = self.open_tracked(account_id, paths.analysis)?;
        connections.insert(account_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Cached connection, creating the directory and schema when absent.
    pub fn open_or_create(&self, account_id: &str) -> Result<DbHandle, PipelineError> {
        let paths = self.paths(account_id)?;
        let mut connections = self.connections.lock();
        if let Some(handle) = connections.get(account_id) {
            return Ok(handle.clone());
        }
        let handle = self.open_tracked(account_id, paths.analysis)?;
        connections.insert(account_id.to_string(), handle.clone());
        log::debug!("Opened analysis database for {}", account_id);
        Ok(handle)
    }

    /// Release the cached connection. No-op when none is cached.
    pub fn close_connection(&self, account_id: &str) {
        if self.connections.lock().remove(account_id).is_some() {
            log::debug!("Closed analysis database for {}", account_id);
        }
    }

    pub fn is_cached(&self, account_id: &str) -> bool {
        self.connections.lock().contains_key(account_id)
    }

    /// Read-only query engine over an existing account.
    pub fn query(&self, account_id: &str) -> Result<QueryEngine, PipelineError> {
        Ok(QueryEngine::new(account_id, self.get_connection(account_id)?))
    }

    /// Accounts that have an analysis schema, sorted.
    pub fn list_accounts(&self) -> Result<Vec<String>, PipelineError> {
        if !self.data_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.data_dir).map_err(|e| {
            PipelineError::source_io(&self.data_dir, "cannot list data directory", e)
        })?;

        let mut accounts = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.join(ANALYSIS_FILE).is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                accounts.push(name.to_string());
            }
        }
        accounts.sort();
        Ok(accounts)
    }

    pub fn account_summary(&self, account_id: &str) -> Result<AccountSummary, PipelineError> {
        let handle = self.get_connection(account_id)?;
        let db = handle.lock();
        let read = |e: crate::db::DbError| PipelineError::transform("cannot read analysis database", e);
        Ok(AccountSummary {
            account_id: account_id.to_string(),
            groups: db.group_count().map_err(read)?,
            members: db.member_count().map_err(read)?,
            last_import: db.last_import().map_err(read)?,
        })
    }

    /// Remove intermediate pipeline files. The decrypted copy is kept unless
    /// `include_decrypted` is set.
    pub fn cleanup_intermediates(
        &self,
        account_id: &str,
        include_decrypted: bool,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        let paths = self.paths(account_id)?;
        let mut targets = vec![paths.raw, paths.cleaned];
        if include_decrypted {
            targets.push(paths.decrypted);
        }

        let mut removed = Vec::new();
        for path in targets {
            if !path.exists() {
                continue;
            }
            std::fs::remove_file(&path).map_err(|e| PipelineError::StorageBusy {
                account_id: account_id.to_string(),
                reason: format!("cannot remove {}: {}", path.display(), e),
            })?;
            removed.push(path);
        }
        Ok(removed)
    }

    /// Close the account's connection and delete its directory.
    pub fn delete_account(&self, account_id: &str) -> Result<(), PipelineError> {
        let paths = self.paths(account_id)?;

        {
            let mut connections = self.connections.lock();
            let cached = usize::from(connections.contains_key(account_id));
            // Someone besides the cache still holds a connection (query or
            // import in flight, or a handle kept past close_connection)
            if self.live_handles(account_id) > cached {
                return Err(PipelineError::StorageBusy {
                    account_id: account_id.to_string(),
                    reason: "analysis database is still in use".to_string(),
                });
            }
            connections.remove(account_id);
            self.opened.lock().remove(account_id);
        }

        if !paths.dir.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(&paths.dir).map_err(|e| PipelineError::StorageBusy {
            account_id: account_id.to_string(),
            reason: format!("cannot remove {}: {}", paths.dir.display(), e),
        })?;
        log::info!("Deleted account {}", account_id);
        Ok(())
    }
}

impl AccountStore {
    fn open_tracked(&self, account_id: &str, path: PathBuf) -> Result<DbHandle, PipelineError> {
        let db = AnalysisDb::open_at(path).map_err(|e| {
            PipelineError::transform(format!("cannot open analysis database for {}", account_id), e)
        })?;
        let handle = Arc::new(Mutex::new(db));

        let mut opened = self.opened.lock();
        let weaks = opened.entry(account_id.to_string()).or_default();
        weaks.retain(|w| w.strong_count() > 0);
        weaks.push(Arc::downgrade(&handle));
        Ok(handle)
    }

    /// Strong references to any of the account's connections, cache included.
    fn live_handles(&self, account_id: &str) -> usize {
        self.opened
            .lock()
            .get(account_id)
            .map(|weaks| weaks.iter().map(Weak::strong_count).sum())
            .unwrap_or(0)
    }
}

/// Account ids name directories, so they must be a single path component.
fn validate_account_id(account_id: &str) -> Result<(), PipelineError> {
    let trimmed = account_id.trim();
    if trimmed.is_empty()
        || trimmed != account_id
        || account_id == "."
        || account_id == ".."
        || account_id.contains(['/', '\\', '\0'])
    {
        return Err(PipelineError::InvalidInput(format!(
            "invalid account id {:?}",
            account_id
        )));
    }
    Ok(())
}
