//! Social-graph queries over one account's `groups` / `members` tables.

use rusqlite::{params, params_from_iter};
use serde::Serialize;

use crate::db::{AnalysisDb, DbError};

/// Maximum rows returned by a group search.
pub const SEARCH_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupHit {
    pub group_id: String,
    pub group_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGroupCount {
    pub user_id: String,
    pub user_name: Option<String>,
    pub group_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub user_id: String,
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGroup {
    pub group_id: String,
    pub group_name: Option<String>,
    pub nickname: Option<String>,
}

/// Escape `%`, `_` and the escape character for a `LIKE ... ESCAPE '\'`.
fn like_pattern(q: &str) -> String {
    let mut out = String::with_capacity(q.len() + 2);
    out.push('%');
    for c in q.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// Groups whose name contains `q` (ASCII case-insensitive). Empty `q`
/// matches every group.
pub fn search_groups(db: &AnalysisDb, q: &str) -> Result<Vec<GroupHit>, DbError> {
    let mut stmt = db.conn_ref().prepare(
        "SELECT group_id, group_name FROM groups
         WHERE ?1 = '' OR group_name LIKE ?2 ESCAPE '\\'
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![q, like_pattern(q), SEARCH_LIMIT as i64], |row| {
        Ok(GroupHit {
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

fn map_count(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserGroupCount> {
    Ok(UserGroupCount {
        user_id: row.get(0)?,
        user_name: row.get(1)?,
        group_count: row.get::<_, i64>(2)? as usize,
    })
}

/// Users in at least `min_groups` distinct groups, most groups first.
pub fn frequent_users(db: &AnalysisDb, min_groups: usize) -> Result<Vec<UserGroupCount>, DbError> {
    let mut stmt = db.conn_ref().prepare(
        "SELECT user_id, MAX(user_name), COUNT(DISTINCT group_id) AS group_count
         FROM members
         GROUP BY user_id
         HAVING group_count >= ?1
         ORDER BY group_count DESC, user_id ASC",
    )?;
    let rows = stmt.query_map(params![min_groups as i64], map_count)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Members of `group_id` who are also in some other group, with their total
/// group count.
pub fn group_overlap(db: &AnalysisDb, group_id: &str) -> Result<Vec<UserGroupCount>, DbError> {
    let mut stmt = db.conn_ref().prepare(
        "SELECT m.user_id, MAX(m.user_name), COUNT(DISTINCT m.group_id) AS group_count
         FROM members m
         WHERE m.user_id IN (SELECT user_id FROM members WHERE group_id = ?1)
         GROUP BY m.user_id
         HAVING group_count > 1
         ORDER BY group_count DESC, m.user_id ASC",
    )?;
    let rows = stmt.query_map(params![group_id], map_count)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Users who belong to every group in `group_ids`. No groups, no users.
pub fn intersection(db: &AnalysisDb, group_ids: &[String]) -> Result<Vec<UserRef>, DbError> {
    let mut wanted: Vec<&str> = group_ids.iter().map(String::as_str).collect();
    wanted.sort_unstable();
    wanted.dedup();
    if wanted.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; wanted.len()].join(", ");
    let sql = format!(
        "SELECT user_id, MAX(user_name)
         FROM members
         WHERE group_id IN ({})
         GROUP BY user_id
         HAVING COUNT(DISTINCT group_id) = {}
         ORDER BY user_id ASC",
        placeholders,
        wanted.len()
    );
    let mut stmt = db.conn_ref().prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(wanted.iter()), |row| {
        Ok(UserRef {
            user_id: row.get(0)?,
            user_name: row.get(1)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Every known group `user_id` is in, with the nickname used there. Member
/// rows whose group is missing from the group list are left out.
pub fn user_groups(db: &AnalysisDb, user_id: &str) -> Result<Vec<UserGroup>, DbError> {
    let mut stmt = db.conn_ref().prepare(
        "SELECT m.group_id, g.group_name, m.user_group_name
         FROM members m
         JOIN groups g ON g.group_id = m.group_id
         WHERE m.user_id = ?1
         ORDER BY m.group_id ASC",
    )?;
    let rows = stmt.query_map(params![user_id], |row| {
        Ok(UserGroup {
            group_id: row.get(0)?,
            group_name: row.get(1)?,
            nickname: row.get(2)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::{group, member, test_db};

    /// G1 = {A, B, C} "Alpha", G2 = {B, C, D} "Beta".
    fn scenario() -> AnalysisDb {
        let db = test_db();
        db.upsert_group(&group("G1", "Alpha")).unwrap();
        db.upsert_group(&group("G2", "Beta")).unwrap();
        db.upsert_members(&[
            member("G1", "A", "Ann", "Ann"),
            member("G1", "B", "Bo", "Bo in Alpha"),
            member("G1", "C", "Cy", "Cy"),
            member("G2", "B", "Bo", "Bo in Beta"),
            member("G2", "C", "Cy", "Cy"),
            member("G2", "D", "Dee", "Dee"),
        ])
        .unwrap();
        db
    }

    fn ids_of_counts(rows: &[UserGroupCount]) -> Vec<(&str, usize)> {
        rows.iter().map(|r| (r.user_id.as_str(), r.group_count)).collect()
    }

    #[test]
    fn test_frequent_users() {
        let db = scenario();
        assert_eq!(ids_of_counts(&frequent_users(&db, 2).unwrap()), vec![("B", 2), ("C", 2)]);
        assert_eq!(frequent_users(&db, 1).unwrap().len(), 4);
        assert!(frequent_users(&db, 3).unwrap().is_empty());
    }

    #[test]
    fn test_frequent_users_sorted_by_count() {
        let db = scenario();
        db.upsert_group(&group("G3", "Gamma")).unwrap();
        db.upsert_members(&[member("G3", "C", "Cy", "Cy")]).unwrap();
        assert_eq!(
            ids_of_counts(&frequent_users(&db, 2).unwrap()),
            vec![("C", 3), ("B", 2)]
        );
    }

    #[test]
    fn test_group_overlap_excludes_single_group_members() {
        let db = scenario();
        let rows = group_overlap(&db, "G1").unwrap();
        assert_eq!(ids_of_counts(&rows), vec![("B", 2), ("C", 2)]);
        assert!(group_overlap(&db, "missing").unwrap().is_empty());
    }

    #[test]
    fn test_intersection() {
        let db = scenario();
        let both = intersection(&db, &["G1".to_string(), "G2".to_string()]).unwrap();
        let ids: Vec<_> = both.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["B", "C"]);

        assert!(intersection(&db, &[]).unwrap().is_empty());

        let single = intersection(&db, &["G1".to_string()]).unwrap();
        let ids: Vec<_> = single.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_intersection_ignores_duplicate_ids() {
        let db = scenario();
        let rows = intersection(&db, &["G2".to_string(), "G2".to_string()]).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_intersection_with_unknown_group_is_empty() {
        let db = scenario();
        let rows = intersection(&db, &["G1".to_string(), "nope".to_string()]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_user_groups() {
        let db = scenario();
        let rows = user_groups(&db, "B").unwrap();
        let pairs: Vec<_> = rows
            .iter()
            .map(|r| (r.group_name.as_deref(), r.nickname.as_deref()))
            .collect();
        assert_eq!(
            pairs,
            vec![(Some("Alpha"), Some("Bo in Alpha")), (Some("Beta"), Some("Bo in Beta"))]
        );
    }

    #[test]
    fn test_user_groups_skips_unknown_groups() {
        let db = scenario();
        db.upsert_members(&[member("G404", "A", "Ann", "Annie")]).unwrap();
        let rows = user_groups(&db, "A").unwrap();
        assert_eq!(
            rows,
            vec![UserGroup {
                group_id: "G1".into(),
                group_name: Some("Alpha".into()),
                nickname: Some("Ann".into()),
            }]
        );
    }

    #[test]
    fn test_search_groups() {
        let db = scenario();
        assert_eq!(search_groups(&db, "").unwrap().len(), 2);
        let hits = search_groups(&db, "alp").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].group_name.as_deref(), Some("Alpha"));
        assert!(search_groups(&db, "zzz").unwrap().is_empty());
    }

    #[test]
    fn test_search_groups_literal_wildcards_and_limit() {
        let db = test_db();
        for i in 0..30 {
            db.upsert_group(&group(&format!("g{}", i), &format!("club {}", i))).unwrap();
        }
        db.upsert_group(&group("pct", "100% fans")).unwrap();

        assert_eq!(search_groups(&db, "club").unwrap().len(), SEARCH_LIMIT);
        let hits = search_groups(&db, "%").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].group_id, "pct");
        assert!(search_groups(&db, "_").unwrap().is_empty());
    }
}
