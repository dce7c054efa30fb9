//! Rebuild an account's analysis schema from a decrypted `group_info.db` or
//! from a structured JSON upload.
//!
//! Every import replaces the account's groups and members wholesale inside a
//! single write transaction: clear, repopulate, record the run. If anything
//! fails the transaction rolls back and the previous data stays queryable.
//! The account's own id is never written as a member.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};

use crate::db::{AnalysisDb, DbError, DbGroup, DbMember, ImportSource};
use crate::error::PipelineError;
use crate::store::AccountStore;

pub mod raw;

/// Group name used when a structured upload omits one.
pub const UNKNOWN_GROUP_NAME: &str = "Unknown";

/// Structured upload: `group_id -> group`.
pub type ImportPayload = BTreeMap<String, StructuredGroup>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredGroup {
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub members: BTreeMap<String, StructuredMember>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredMember {
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub user_group_name: Option<String>,
}

/// What an import wrote.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub account_id: String,
    pub source: ImportSource,
    pub groups: usize,
    pub members: usize,
    /// Source rows dropped for missing columns or ids.
    pub skipped_rows: usize,
    /// Rows dropped because they described the account itself.
    pub self_rows: usize,
}

/// Buffers members and writes them in fixed-size batches, dropping the
/// account's own rows on the way in.
struct MemberWriter<'a> {
    db: &'a AnalysisDb,
    account_id: &'a str,
    batch_size: usize,
    batch: Vec<DbMember>,
    self_rows: usize,
}

impl<'a> MemberWriter<'a> {
    fn new(db: &'a AnalysisDb, account_id: &'a str, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            db,
            account_id,
            batch_size,
            batch: Vec::with_capacity(batch_size),
            self_rows: 0,
        }
    }

    fn push(&mut self, member: DbMember) -> Result<(), DbError> {
        if member.user_id == self.account_id {
            self.self_rows += 1;
            return Ok(());
        }
        self.batch.push(member);
        if self.batch.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DbError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.db.upsert_members(&self.batch)?;
        log::debug!("Wrote batch of {} members", self.batch.len());
        self.batch.clear();
        Ok(())
    }
}

/// Run `fill` against a cleared schema inside one transaction and record the
/// import. `fill` returns how many source rows it skipped.
fn replace_all<F>(
    store: &AccountStore,
    account_id: &str,
    source: ImportSource,
    fill: F,
) -> Result<LoadReport, PipelineError>
where
    F: FnOnce(&AnalysisDb, &mut MemberWriter<'_>) -> Result<usize, DbError>,
{
    let handle = store.open_or_create(account_id)?;
    // Held for the whole import: one import per account at a time, and
    // queries never observe the cleared state.
    let db = handle.lock();
    log::debug!("Rebuilding {} from {}", db.path().display(), source.as_str());

    db.with_transaction(|tx| -> Result<LoadReport, DbError> {
        tx.clear_all()?;
        let mut writer = MemberWriter::new(tx, account_id, store.batch_size());
        let skipped_rows = fill(tx, &mut writer)?;
        writer.flush()?;
        let self_rows = writer.self_rows;
        let run = tx.record_import(source)?;
        Ok(LoadReport {
            account_id: account_id.to_string(),
            source,
            groups: run.group_count,
            members: run.member_count,
            skipped_rows,
            self_rows,
        })
    })
    .map_err(|e| PipelineError::transform(format!("import for account {} rolled back", account_id), e))
    .inspect(|report| {
        log::info!(
            "Imported {} groups / {} members for {} ({} rows skipped, {} self rows dropped)",
            report.groups,
            report.members,
            account_id,
            report.skipped_rows,
            report.self_rows
        )
    })
}

/// Load a decrypted `group_info.db` into the account's analysis schema.
pub fn load(
    store: &AccountStore,
    decrypted_path: &Path,
    account_id: &str,
) -> Result<LoadReport, PipelineError> {
    if !decrypted_path.is_file() {
        return Err(PipelineError::source_file(
            decrypted_path,
            "decrypted database not found",
        ));
    }
    let src = Connection::open_with_flags(
        decrypted_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| PipelineError::transform("cannot open decrypted database", e))?;

    replace_all(store, account_id, ImportSource::RawTable, |db, writer| {
        let mut skipped = raw::read_groups(&src, |group| db.upsert_group(&group.into()))?;
        skipped += raw::read_members(&src, |member| writer.push(member.into()))?;
        Ok(skipped)
    })
}

/// Load an already-parsed structured upload into the account's schema.
pub fn load_from_structured(
    store: &AccountStore,
    payload: &ImportPayload,
    account_id: &str,
) -> Result<LoadReport, PipelineError> {
    replace_all(store, account_id, ImportSource::Structured, |db, writer| {
        for (group_id, group) in payload {
            db.upsert_group(&DbGroup {
                group_id: group_id.clone(),
                group_name: Some(
                    group
                        .group_name
                        .clone()
                        .unwrap_or_else(|| UNKNOWN_GROUP_NAME.to_string()),
                ),
            })?;

            for (user_id, member) in &group.members {
                let user_name = member.user_name.clone().unwrap_or_default();
                let nickname = member
                    .user_group_name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| user_name.clone());
                writer.push(DbMember {
                    group_id: group_id.clone(),
                    user_id: user_id.clone(),
                    user_name: Some(user_name),
                    user_group_name: Some(nickname),
                })?;
            }
        }
        Ok(0)
    })
}

/// Parse an uploaded JSON document into an import payload.
pub fn parse_payload(bytes: &[u8]) -> Result<ImportPayload, PipelineError> {
    serde_json::from_slice(bytes)
        .map_err(|e| PipelineError::transform("malformed structured import", e))
}

/// Read, parse and load a JSON upload from disk.
pub fn load_from_json_file(
    store: &AccountStore,
    path: &Path,
    account_id: &str,
) -> Result<LoadReport, PipelineError> {
    let bytes = std::fs::read(path)
        .map_err(|e| PipelineError::source_io(path, "cannot read JSON upload", e))?;
    let payload = parse_payload(&bytes)?;
    load_from_structured(store, &payload, account_id)
}
