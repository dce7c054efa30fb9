//! Positional adapter over the client's raw tables.
//!
//! `group_list` and `group_member3` have no stable column names across client
//! versions, only stable positions. This module is the only place that knows
//! those positions; everything downstream works with named records.
//!
//! | table | col | meaning |
//! |---|---|---|
//! | group_list | 0 | group id |
//! | group_list | 5 | group name |
//! | group_member3 | 0 | nickname in group |
//! | group_member3 | 1 | user display name |
//! | group_member3 | 2 | group id |
//! | group_member3 | 5 | user id |

use rusqlite::types::ValueRef;
use rusqlite::{Connection, Row};

use crate::db::{DbError, DbGroup, DbMember};

pub const GROUP_LIST_TABLE: &str = "group_list";
pub const GROUP_MEMBER_TABLE: &str = "group_member3";

/// Columns a row needs before its positions mean anything.
const MIN_COLUMNS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawGroupRow {
    pub group_id: String,
    pub group_name: Option<String>,
}

impl RawGroupRow {
    fn from_row(row: &Row<'_>, columns: usize) -> Result<Option<Self>, DbError> {
        if columns < MIN_COLUMNS {
            return Ok(None);
        }
        let Some(group_id) = value_text(row.get_ref(0)?) else {
            return Ok(None);
        };
        Ok(Some(Self {
            group_id,
            group_name: value_text(row.get_ref(5)?),
        }))
    }
}

impl From<RawGroupRow> for DbGroup {
    fn from(raw: RawGroupRow) -> Self {
        DbGroup {
            group_id: raw.group_id,
            group_name: raw.group_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMemberRow {
    pub nickname: Option<String>,
    pub user_name: Option<String>,
    pub group_id: String,
    pub user_id: String,
}

impl RawMemberRow {
    fn from_row(row: &Row<'_>, columns: usize) -> Result<Option<Self>, DbError> {
        if columns < MIN_COLUMNS {
            return Ok(None);
        }
        let (Some(group_id), Some(user_id)) =
            (value_text(row.get_ref(2)?), value_text(row.get_ref(5)?))
        else {
            return Ok(None);
        };
        Ok(Some(Self {
            nickname: value_text(row.get_ref(0)?),
            user_name: value_text(row.get_ref(1)?),
            group_id,
            user_id,
        }))
    }
}

impl From<RawMemberRow> for DbMember {
    fn from(raw: RawMemberRow) -> Self {
        let nickname = raw
            .nickname
            .filter(|n| !n.is_empty())
            .or_else(|| raw.user_name.clone());
        DbMember {
            group_id: raw.group_id,
            user_id: raw.user_id,
            user_name: raw.user_name,
            user_group_name: nickname,
        }
    }
}

/// Render a column value as text. NULL stays absent.
fn value_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(real_text(f)),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    }
}

/// Text form of a REAL column: shortest round-trip digits, a trailing `.0`
/// on integral values, and `e+XX`/`e-XX` exponents outside `1e-4..1e16`.
fn real_text(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let magnitude = f.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let sci = format!("{:e}", f);
        let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
        let (sign, digits) = match exponent.strip_prefix('-') {
            Some(d) => ('-', d),
            None => ('+', exponent),
        };
        return format!("{}e{}{:0>2}", mantissa, sign, digits);
    }
    if f.fract() == 0.0 {
        format!("{:.1}", f)
    } else {
        f.to_string()
    }
}

/// Stream every usable `group_list` row into `f`. Returns the number of rows
/// skipped as unusable.
pub fn read_groups<F>(conn: &Connection, mut f: F) -> Result<usize, DbError>
where
    F: FnMut(RawGroupRow) -> Result<(), DbError>,
{
    read_table(conn, GROUP_LIST_TABLE, |row, columns| {
        match RawGroupRow::from_row(row, columns)? {
            Some(group) => f(group).map(|_| true),
            None => Ok(false),
        }
    })
}

/// Stream every usable `group_member3` row into `f`. Returns the number of
/// rows skipped as unusable.
pub fn read_members<F>(conn: &Connection, mut f: F) -> Result<usize, DbError>
where
    F: FnMut(RawMemberRow) -> Result<(), DbError>,
{
    read_table(conn, GROUP_MEMBER_TABLE, |row, columns| {
        match RawMemberRow::from_row(row, columns)? {
            Some(member) => f(member).map(|_| true),
            None => Ok(false),
        }
    })
}

fn read_table<F>(conn: &Connection, table: &str, mut f: F) -> Result<usize, DbError>
where
    F: FnMut(&Row<'_>, usize) -> Result<bool, DbError>,
{
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", table))?;
    let columns = stmt.column_count();
    if columns < MIN_COLUMNS {
        log::warn!(
            "{} has {} columns, expected at least {}; every row will be skipped",
            table,
            columns,
            MIN_COLUMNS
        );
    }

    let mut skipped = 0;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        if !f(row, columns)? {
            skipped += 1;
        }
    }
    Ok(skipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE group_list (c0, c1, c2, c3, c4, c5, c6);
             INSERT INTO group_list VALUES (100, 'x', 0, 0, 0, 'Alpha', 'tail');
             INSERT INTO group_list VALUES (NULL, 'x', 0, 0, 0, 'Nameless', NULL);
             INSERT INTO group_list VALUES ('200', 'x', 0, 0, 0, NULL, NULL);
             CREATE TABLE group_member3 (c0, c1, c2, c3, c4, c5);
             INSERT INTO group_member3 VALUES ('Annie', 'Ann', 100, 0, 0, 11);
             INSERT INTO group_member3 VALUES ('', 'Bo', 100, 0, 0, 12);
             INSERT INTO group_member3 VALUES (NULL, 'Cy', 100, 0, 0, 13);
             INSERT INTO group_member3 VALUES ('ghost', 'Dee', NULL, 0, 0, 14);
             INSERT INTO group_member3 VALUES ('ghost', 'Eve', 100, 0, 0, NULL);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_group_rows_by_position() {
        let conn = source();
        let mut groups = Vec::new();
        let skipped = read_groups(&conn, |g| {
            groups.push(g);
            Ok(())
        })
        .unwrap();

        assert_eq!(skipped, 1, "row with NULL id is skipped");
        assert_eq!(
            groups,
            vec![
                RawGroupRow { group_id: "100".into(), group_name: Some("Alpha".into()) },
                RawGroupRow { group_id: "200".into(), group_name: None },
            ]
        );
    }

    #[test]
    fn test_member_rows_require_group_and_user() {
        let conn = source();
        let mut members: Vec<DbMember> = Vec::new();
        let skipped = read_members(&conn, |m| {
            members.push(m.into());
            Ok(())
        })
        .unwrap();

        assert_eq!(skipped, 2);
        let nicks: Vec<_> = members
            .iter()
            .map(|m| (m.user_id.as_str(), m.user_group_name.as_deref()))
            .collect();
        assert_eq!(
            nicks,
            vec![("11", Some("Annie")), ("12", Some("Bo")), ("13", Some("Cy"))]
        );
        assert!(members.iter().all(|m| m.group_id == "100"));
    }

    #[test]
    fn test_narrow_table_skips_everything() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE group_member3 (c0, c1, c2, c3, c4);
             INSERT INTO group_member3 VALUES ('n', 'u', 1, 0, 0);",
        )
        .unwrap();
        let skipped = read_members(&conn, |_| panic!("no row should be usable")).unwrap();
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_real_ids_keep_float_text() {
        assert_eq!(real_text(1.0), "1.0");
        assert_eq!(real_text(-0.0), "-0.0");
        assert_eq!(real_text(12345.5), "12345.5");
        assert_eq!(real_text(0.1), "0.1");
        assert_eq!(real_text(1e16), "1e+16");
        assert_eq!(real_text(1.5e-5), "1.5e-05");
        assert_eq!(real_text(123456789012.0), "123456789012.0");

        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE group_list (c0 REAL, c1, c2, c3, c4, c5);
             INSERT INTO group_list VALUES (1.0, '', 0, 0, 0, 'Alpha');",
        )
        .unwrap();
        let mut ids = Vec::new();
        read_groups(&conn, |g| {
            ids.push(g.group_id);
            Ok(())
        })
        .unwrap();
        assert_eq!(ids, vec!["1.0"]);
    }

    #[test]
    fn test_missing_table_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(read_groups(&conn, |_| Ok(())).is_err());
    }
}
