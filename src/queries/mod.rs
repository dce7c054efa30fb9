//! Read-side analysis over one account's imported graph.
//!
//! `QueryEngine` owns a cached handle and takes the account lock per call, so
//! a query never observes an import half-way through.

pub mod graph;

pub use graph::{GroupHit, UserGroup, UserGroupCount, UserRef, SEARCH_LIMIT};

use crate::db::{AnalysisDb, DbError};
use crate::error::PipelineError;
use crate::store::DbHandle;

pub struct QueryEngine {
    account_id: String,
    handle: DbHandle,
}

impl QueryEngine {
    pub fn new(account_id: &str, handle: DbHandle) -> Self {
        Self {
            account_id: account_id.to_string(),
            handle,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    fn run<T>(
        &self,
        what: &str,
        f: impl FnOnce(&AnalysisDb) -> Result<T, DbError>,
    ) -> Result<T, PipelineError> {
        let db = self.handle.lock();
        f(&db).map_err(|e| {
            PipelineError::transform(format!("{} failed for account {}", what, self.account_id), e)
        })
    }

    pub fn search_groups(&self, q: &str) -> Result<Vec<GroupHit>, PipelineError> {
        self.run("group search", |db| graph::search_groups(db, q))
    }

    pub fn frequent_users(&self, min_groups: usize) -> Result<Vec<UserGroupCount>, PipelineError> {
        self.run("frequent users", |db| graph::frequent_users(db, min_groups))
    }

    pub fn group_overlap(&self, group_id: &str) -> Result<Vec<UserGroupCount>, PipelineError> {
        self.run("group overlap", |db| graph::group_overlap(db, group_id))
    }

    pub fn intersection(&self, group_ids: &[String]) -> Result<Vec<UserRef>, PipelineError> {
        self.run("intersection", |db| graph::intersection(db, group_ids))
    }

    pub fn user_groups(&self, user_id: &str) -> Result<Vec<UserGroup>, PipelineError> {
        self.run("user groups", |db| graph::user_groups(db, user_id))
    }
}
