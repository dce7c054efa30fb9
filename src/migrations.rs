//! Versioned schema for `group_data.db`.
//!
//! Schema steps live in `migrations/NNN_*.sql` and are compiled in. The
//! highest applied step is kept in `schema_version`; each step runs in its
//! own transaction together with its version row.
//!
//! Files created before versioning have `groups`/`members` and no version
//! table. Those are adopted at v1 so only the later steps run on them.

use rusqlite::{Connection, OptionalExtension};

use crate::db::DbError;

/// Ordered `(version, sql)` schema steps.
const STEPS: &[(u32, &str)] = &[
    (1, include_str!("migrations/001_baseline.sql")),
    (2, include_str!("migrations/002_import_runs.sql")),
];

fn latest_known() -> u32 {
    STEPS.last().map(|(v, _)| *v).unwrap_or(0)
}

fn applied_version(conn: &Connection) -> Result<u32, DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    let version: Option<u32> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

/// Mark an unversioned file that already has the baseline tables as v1.
fn adopt_legacy_file(conn: &Connection) -> Result<u32, DbError> {
    let has_groups = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'groups'",
            [],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !has_groups {
        return Ok(0);
    }
    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (1)", [])?;
    log::info!("Adopted unversioned analysis database at schema v1");
    Ok(1)
}

/// Copy the live database to `<path>.pre-migration.bak` with the online
/// backup API. In-memory databases are skipped.
fn snapshot(conn: &Connection) -> Result<(), DbError> {
    let Some(path) = conn.path().filter(|p| !p.is_empty()) else {
        return Ok(());
    };
    let target = format!("{}.pre-migration.bak", path);
    let mut dest = Connection::open(&target)?;
    rusqlite::backup::Backup::new(conn, &mut dest)?.step(-1)?;
    log::info!("Snapshot before schema upgrade written to {}", target);
    Ok(())
}

/// Bring the schema up to the latest version. Returns how many steps ran.
///
/// A file stamped with a version newer than this build knows is refused.
pub fn run_migrations(conn: &Connection) -> Result<usize, DbError> {
    let mut current = applied_version(conn)?;
    if current == 0 {
        current = adopt_legacy_file(conn)?;
    }

    if current > latest_known() {
        return Err(DbError::Migration(format!(
            "analysis database is at schema v{} but this build only knows v{}; upgrade groupscope",
            current,
            latest_known()
        )));
    }

    let pending: Vec<_> = STEPS.iter().filter(|(v, _)| *v > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }
    if current > 0 {
        snapshot(conn)?;
    }

    for (version, sql) in &pending {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)
            .map_err(|e| DbError::Migration(format!("step v{} failed: {}", version, e)))?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
        tx.commit()?;
        log::debug!("Applied schema v{}", version);
    }
    Ok(pending.len())
}
