pub mod backup;
pub mod ledger;
pub mod migrate;
pub mod path;
pub mod port;
pub mod schema;
mod sqlite;

use std::path::{Path, PathBuf};

use rusqlite::OpenFlags;

pub use migrate::Outcome;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::types::*;

/// Opens `path` with the pragmas every store connection runs with.
pub fn connect<P: AsRef<Path>>(path: P) -> Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

/// Opens `path` for inspection only. The journal mode and the file itself are
/// left exactly as found.
pub fn connect_read_only<P: AsRef<Path>>(path: P) -> Result<rusqlite::Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    Ok(rusqlite::Connection::open_with_flags(path, flags)?)
}

/// Store defines the database interface.
///
/// Upserts write the scalar attributes of a record and leave its relation
/// columns alone: a new row starts with every relation unfetched, and an
/// existing row keeps whatever was loaded.
pub trait Store: Send + Sync {
    /// Brings the store to the current schema; must run before anything else.
    fn initialize(&self) -> Result<()>;
    fn schema_version(&self) -> Result<u32>;

    // Repository operations
    fn upsert_repository(&self, repo: &Repository) -> Result<()>;
    fn get_repository(&self, id: &str) -> Result<Option<Repository>>;
    fn get_repository_by_name(
        &self,
        forge: &str,
        owner: &str,
        name: &str,
    ) -> Result<Option<Repository>>;
    fn list_repositories(&self, cursor: &str, limit: i32) -> Result<Vec<Repository>>;
    /// Removes the repository and, through cascading keys, everything under it.
    fn delete_repository(&self, id: &str) -> Result<bool>;

    // Issue operations
    fn upsert_issue(&self, issue: &Issue) -> Result<()>;
    fn get_issue(&self, id: &str) -> Result<Option<Issue>>;
    fn list_issues(&self, repository: &str) -> Result<Vec<Issue>>;
    fn delete_issue(&self, id: &str) -> Result<bool>;

    // Pull request operations
    fn upsert_pullreq(&self, pullreq: &PullReq) -> Result<()>;
    fn get_pullreq(&self, id: &str) -> Result<Option<PullReq>>;
    fn list_pullreqs(&self, repository: &str) -> Result<Vec<PullReq>>;

    // Issue post operations
    fn upsert_issue_post(&self, post: &IssuePost) -> Result<()>;
    fn list_issue_posts(&self, issue: &str) -> Result<Vec<IssuePost>>;

    // Label operations
    fn upsert_label(&self, label: &Label) -> Result<()>;
    /// Replaces the labels of an issue and records the relation as loaded.
    fn set_issue_labels(&self, issue: &str, label_ids: &[String]) -> Result<()>;
    fn list_issue_labels(&self, issue: &str) -> Result<Vec<Label>>;

    // Mark operations
    fn create_mark(&self, mark: &Mark) -> Result<()>;
    fn add_issue_mark(&self, issue: &str, mark: &str) -> Result<()>;

    // Milestone operations
    fn upsert_milestone(&self, milestone: &Milestone) -> Result<()>;
    fn get_milestone(&self, id: &str) -> Result<Option<Milestone>>;

    // Discussion operations
    fn upsert_discussion(&self, discussion: &Discussion) -> Result<()>;
    fn get_discussion(&self, id: &str) -> Result<Option<Discussion>>;
    fn upsert_discussion_post(&self, post: &DiscussionPost) -> Result<()>;
    fn upsert_discussion_reply(&self, reply: &DiscussionReply) -> Result<()>;

    // Notification operations
    fn upsert_notification(&self, notification: &Notification) -> Result<()>;
    fn list_notifications(&self, repository: &str) -> Result<Vec<Notification>>;

    /// Copies the store file next to the store, or into the configured backup
    /// directory, and returns the copy's path.
    fn backup(&self) -> Result<PathBuf>;

    fn close(&self) -> Result<()>;
}
