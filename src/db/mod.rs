//! SQLite storage for one account's analysis schema.
//!
//! Each account owns a `group_data.db` holding the normalized `groups` and
//! `members` tables produced by the ETL. The file is rebuilt wholesale on
//! every import; queries only ever read it.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

pub mod types;
pub use types::*;

pub struct AnalysisDb {
    conn: Connection,
    path: PathBuf,
}

impl AnalysisDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| E::from(DbError::Sqlite(e)))?;
        match f(self) {
            Ok(val) => {
                if let Err(e) = self.conn.execute_batch("COMMIT") {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(E::from(DbError::Sqlite(e)));
                }
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the analysis database at `path` and apply the schema.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL keeps readers unblocked while an import transaction is open
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn)?;

        Ok(Self { conn, path })
    }

    // =========================================================================
    // Writes (only called from inside an import transaction)
    // =========================================================================

    /// Remove every member, group and import record. Members go first so the
    /// schema never holds members of a deleted group mid-statement.
    pub fn clear_all(&self) -> Result<(), DbError> {
        self.conn.execute("DELETE FROM members", [])?;
        self.conn.execute("DELETE FROM groups", [])?;
        self.conn.execute("DELETE FROM import_runs", [])?;
        Ok(())
    }

    /// Insert or overwrite a group by id.
    pub fn upsert_group(&self, group: &DbGroup) -> Result<(), DbError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO groups (group_id, group_name) VALUES (?1, ?2)
             ON CONFLICT(group_id) DO UPDATE SET group_name = excluded.group_name",
        )?;
        stmt.execute(params![group.group_id, group.group_name])?;
        Ok(())
    }

    /// Write a batch of members; an existing `(group_id, user_id)` pair is
    /// overwritten, never duplicated.
    pub fn upsert_members(&self, members: &[DbMember]) -> Result<(), DbError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO members (group_id, user_id, user_name, user_group_name)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(group_id, user_id) DO UPDATE SET
                user_name = excluded.user_name,
                user_group_name = excluded.user_group_name",
        )?;
        for m in members {
            stmt.execute(params![m.group_id, m.user_id, m.user_name, m.user_group_name])?;
        }
        Ok(())
    }

    /// Record a finished import using the row counts now in the schema.
    pub fn record_import(&self, source: ImportSource) -> Result<DbImportRun, DbError> {
        let run = DbImportRun {
            source,
            group_count: self.group_count()?,
            member_count: self.member_count()?,
            imported_at: Utc::now().to_rfc3339(),
        };
        self.conn.execute(
            "INSERT INTO import_runs (source, group_count, member_count, imported_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                run.source.as_str(),
                run.group_count as i64,
                run.member_count as i64,
                run.imported_at
            ],
        )?;
        Ok(run)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn group_count(&self) -> Result<usize, DbError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM groups", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn member_count(&self) -> Result<usize, DbError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM members", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// The most recent import, if any.
    pub fn last_import(&self) -> Result<Option<DbImportRun>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT source, group_count, member_count, imported_at
                 FROM import_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.and_then(|(source, groups, members, imported_at)| {
            ImportSource::parse(&source).map(|source| DbImportRun {
                source,
                group_count: groups as usize,
                member_count: members as usize,
                imported_at,
            })
        }))
    }

    /// All members, ordered by group then user. Used by tests and exports.
    pub fn all_members(&self) -> Result<Vec<DbMember>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT group_id, user_id, user_name, user_group_name
             FROM members ORDER BY group_id, user_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DbMember {
                group_id: row.get(0)?,
                user_id: row.get(1)?,
                user_name: row.get(2)?,
                user_group_name: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// All groups, ordered by id.
    pub fn all_groups(&self) -> Result<Vec<DbGroup>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT group_id, group_name FROM groups ORDER BY group_id")?;
        let rows = stmt.query_map([], |row| {
            Ok(DbGroup {
                group_id: row.get(0)?,
                group_name: row.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

// =============================================================================
// Test utilities
// =============================================================================


// =============================================================================
// Tests
// =============================================================================
