//! Shared type definitions for the database layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

/// A row from the `groups` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbGroup {
    pub group_id: String,
    pub group_name: Option<String>,
}

/// A row from the `members` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbMember {
    pub group_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    /// Nickname inside the group; already resolved to `user_name` when the
    /// source had none.
    pub user_group_name: Option<String>,
}

/// Where an import's rows came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportSource {
    RawTable,
    Structured,
}

impl ImportSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportSource::RawTable => "raw_table",
            ImportSource::Structured => "structured",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "raw_table" => Some(ImportSource::RawTable),
            "structured" => Some(ImportSource::Structured),
            _ => None,
        }
    }
}

/// A row from the `import_runs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbImportRun {
    pub source: ImportSource,
    pub group_count: usize,
    pub member_count: usize,
    pub imported_at: String,
}
