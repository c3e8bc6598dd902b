use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::ledger::Ledger;
use super::migrate::{self, Outcome};
use super::port::SchemaPort;
use super::{Store, backup, connect};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::types::*;

const ISSUE_CLASS: &str = "forge-issue";
const PULLREQ_CLASS: &str = "forge-pullreq";
const ISSUE_POST_CLASS: &str = "forge-issue-post";
const DISCUSSION_CLASS: &str = "forge-discussion";
const DISCUSSION_POST_CLASS: &str = "forge-discussion-post";
const DISCUSSION_REPLY_CLASS: &str = "forge-discussion-reply";
const NOTIFICATION_CLASS: &str = "forge-notification";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    backup_dir: PathBuf,
    // Set only once the startup check has passed.
    ready: AtomicBool,
}

impl SqliteStore {
    /// Opens the store file at `db_path`; backups go next to it.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = connect(&path)?;
        let backup_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            backup_dir,
            ready: AtomicBool::new(false),
        })
    }

    /// Opens the store described by `config`, creating its data directory.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self::new(config.db_path())?.with_backup_dir(config.backup_dir()))
    }

    #[must_use]
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs the startup check and reports what it did.
    ///
    /// Forge operations are refused with [`Error::NotInitialized`] until this
    /// has succeeded, and again after it fails.
    pub fn upgrade(&self) -> Result<Outcome> {
        let mut conn = self.conn();
        let outcome = migrate::ensure_current(&mut conn, &self.path, &self.backup_dir);
        self.ready.store(outcome.is_ok(), Ordering::Release);
        outcome
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ready_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(Error::NotInitialized);
        }
        Ok(self.conn())
    }

    /// Returns a guard to the underlying database connection.
    /// This allows consuming applications to execute custom SQL.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn()
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn format_optional(dt: Option<&DateTime<Utc>>) -> Option<String> {
    dt.map(format_datetime)
}

fn datetime_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(parse_datetime(&row.get::<_, String>(idx)?))
}

fn optional_datetime_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<String>>(idx)?.map(|s| parse_datetime(&s)))
}

// Flags written by older releases may be NULL.
fn flag_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<bool> {
    Ok(row.get::<_, Option<bool>>(idx)?.unwrap_or(false))
}

fn text_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
}

const REPOSITORY_COLUMNS: &str = "id, class, forge_id, forge, owner, name, apihost, githost, remote,
     condition, created, updated, description, default_branch, selective_p, worktree,
     issues_until, pullreqs_until, discussions_p, discussions_until,
     issues, pullreqs, labels, milestones, discussions";

fn row_to_repository(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        class: row.get(1)?,
        forge_id: row.get(2)?,
        forge: text_at(row, 3)?,
        owner: text_at(row, 4)?,
        name: text_at(row, 5)?,
        apihost: text_at(row, 6)?,
        githost: text_at(row, 7)?,
        remote: row.get(8)?,
        condition: row.get(9)?,
        created: optional_datetime_at(row, 10)?,
        updated: optional_datetime_at(row, 11)?,
        description: row.get(12)?,
        default_branch: row.get(13)?,
        selective_p: flag_at(row, 14)?,
        worktree: row.get(15)?,
        issues_until: optional_datetime_at(row, 16)?,
        pullreqs_until: optional_datetime_at(row, 17)?,
        discussions_p: flag_at(row, 18)?,
        discussions_until: optional_datetime_at(row, 19)?,
        issues: row.get(20)?,
        pullreqs: row.get(21)?,
        labels: row.get(22)?,
        milestones: row.get(23)?,
        discussions: row.get(24)?,
    })
}

const ISSUE_COLUMNS: &str = "id, repository, number, state, author, title, created, updated,
     closed, status, locked_p, saved_p, milestone, body, slug, labels, assignees, posts";

fn row_to_issue(row: &Row<'_>) -> rusqlite::Result<Issue> {
    Ok(Issue {
        id: row.get(0)?,
        repository: row.get(1)?,
        number: row.get(2)?,
        state: row.get(3)?,
        author: row.get(4)?,
        title: text_at(row, 5)?,
        created: datetime_at(row, 6)?,
        updated: datetime_at(row, 7)?,
        closed: optional_datetime_at(row, 8)?,
        status: row.get(9)?,
        locked_p: flag_at(row, 10)?,
        saved_p: flag_at(row, 11)?,
        milestone: row.get(12)?,
        body: row.get(13)?,
        slug: row.get(14)?,
        labels: row.get(15)?,
        assignees: row.get(16)?,
        posts: row.get(17)?,
    })
}

const PULLREQ_COLUMNS: &str = "id, repository, number, state, author, title, created, updated,
     closed, merged, status, locked_p, draft_p, saved_p, base_ref, head_ref, base_rev,
     head_rev, milestone, body, slug, labels, review_requests";

fn row_to_pullreq(row: &Row<'_>) -> rusqlite::Result<PullReq> {
    Ok(PullReq {
        id: row.get(0)?,
        repository: row.get(1)?,
        number: row.get(2)?,
        state: row.get(3)?,
        author: row.get(4)?,
        title: text_at(row, 5)?,
        created: datetime_at(row, 6)?,
        updated: datetime_at(row, 7)?,
        closed: optional_datetime_at(row, 8)?,
        merged: optional_datetime_at(row, 9)?,
        status: row.get(10)?,
        locked_p: flag_at(row, 11)?,
        draft_p: flag_at(row, 12)?,
        saved_p: flag_at(row, 13)?,
        base_ref: row.get(14)?,
        head_ref: row.get(15)?,
        base_rev: row.get(16)?,
        head_rev: row.get(17)?,
        milestone: row.get(18)?,
        body: row.get(19)?,
        slug: row.get(20)?,
        labels: row.get(21)?,
        review_requests: row.get(22)?,
    })
}

fn row_to_label(row: &Row<'_>) -> rusqlite::Result<Label> {
    Ok(Label {
        repository: row.get(0)?,
        id: row.get(1)?,
        name: text_at(row, 2)?,
        color: row.get(3)?,
        description: row.get(4)?,
    })
}

const DISCUSSION_COLUMNS: &str = "id, repository, number, state, author, title, created, updated,
     closed, status, locked_p, saved_p, category, answer, upvotes, body, slug,
     labels, posts, marks";

fn row_to_discussion(row: &Row<'_>) -> rusqlite::Result<Discussion> {
    Ok(Discussion {
        id: row.get(0)?,
        repository: row.get(1)?,
        number: row.get(2)?,
        state: row.get(3)?,
        author: row.get(4)?,
        title: text_at(row, 5)?,
        created: datetime_at(row, 6)?,
        updated: datetime_at(row, 7)?,
        closed: optional_datetime_at(row, 8)?,
        status: row.get(9)?,
        locked_p: flag_at(row, 10)?,
        saved_p: flag_at(row, 11)?,
        category: row.get(12)?,
        answer: row.get(13)?,
        upvotes: row.get::<_, Option<i64>>(14)?.unwrap_or(0),
        body: row.get(15)?,
        slug: row.get(16)?,
        labels: row.get(17)?,
        posts: row.get(18)?,
        marks: row.get(19)?,
    })
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        match self.upgrade()? {
            Outcome::Upgraded { from, to, backup } => tracing::info!(
                "Store upgraded from version {} to {}; previous state kept at {}",
                from,
                to,
                backup.display()
            ),
            Outcome::Created | Outcome::UpToDate => {}
        }
        Ok(())
    }

    fn schema_version(&self) -> Result<u32> {
        Ledger::new(&self.conn()).version()
    }

    // Repository operations

    fn upsert_repository(&self, repo: &Repository) -> Result<()> {
        self.ready_conn()?.execute(
            "INSERT INTO repository (class, id, forge_id, forge, owner, name, apihost, githost,
                 remote, condition, created, updated, description, default_branch, selective_p,
                 worktree, issues_until, pullreqs_until, discussions_p, discussions_until)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                 ?17, ?18, ?19, ?20)
             ON CONFLICT(id) DO UPDATE SET
                 class = excluded.class, forge_id = excluded.forge_id,
                 forge = excluded.forge, owner = excluded.owner, name = excluded.name,
                 apihost = excluded.apihost, githost = excluded.githost,
                 remote = excluded.remote, condition = excluded.condition,
                 created = excluded.created, updated = excluded.updated,
                 description = excluded.description,
                 default_branch = excluded.default_branch,
                 selective_p = excluded.selective_p, worktree = excluded.worktree,
                 issues_until = excluded.issues_until,
                 pullreqs_until = excluded.pullreqs_until,
                 discussions_p = excluded.discussions_p,
                 discussions_until = excluded.discussions_until",
            params![
                repo.class,
                repo.id,
                repo.forge_id,
                repo.forge,
                repo.owner,
                repo.name,
                repo.apihost,
                repo.githost,
                repo.remote,
                repo.condition,
                format_optional(repo.created.as_ref()),
                format_optional(repo.updated.as_ref()),
                repo.description,
                repo.default_branch,
                repo.selective_p,
                repo.worktree,
                format_optional(repo.issues_until.as_ref()),
                format_optional(repo.pullreqs_until.as_ref()),
                repo.discussions_p,
                format_optional(repo.discussions_until.as_ref()),
            ],
        )?;
        Ok(())
    }

    fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        let conn = self.ready_conn()?;
        conn.query_row(
            &format!("SELECT {REPOSITORY_COLUMNS} FROM repository WHERE id = ?1"),
            params![id],
            row_to_repository,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_repository_by_name(
        &self,
        forge: &str,
        owner: &str,
        name: &str,
    ) -> Result<Option<Repository>> {
        let conn = self.ready_conn()?;
        conn.query_row(
            &format!(
                "SELECT {REPOSITORY_COLUMNS} FROM repository
                 WHERE forge = ?1 AND owner = ?2 AND name = ?3"
            ),
            params![forge, owner, name],
            row_to_repository,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_repositories(&self, cursor: &str, limit: i32) -> Result<Vec<Repository>> {
        let conn = self.ready_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repository WHERE id > ?1 ORDER BY id LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![cursor, limit], row_to_repository)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_repository(&self, id: &str) -> Result<bool> {
        let rows = self
            .ready_conn()?
            .execute("DELETE FROM repository WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // Issue operations

    fn upsert_issue(&self, issue: &Issue) -> Result<()> {
        self.ready_conn()?.execute(
            "INSERT INTO issue (class, id, repository, number, state, author, title, created,
                 updated, closed, status, locked_p, saved_p, milestone, body, slug)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(id) DO UPDATE SET
                 repository = excluded.repository, number = excluded.number,
                 state = excluded.state, author = excluded.author, title = excluded.title,
                 created = excluded.created, updated = excluded.updated,
                 closed = excluded.closed, status = excluded.status,
                 locked_p = excluded.locked_p, saved_p = excluded.saved_p,
                 milestone = excluded.milestone, body = excluded.body, slug = excluded.slug",
            params![
                ISSUE_CLASS,
                issue.id,
                issue.repository,
                issue.number,
                issue.state,
                issue.author,
                issue.title,
                format_datetime(&issue.created),
                format_datetime(&issue.updated),
                format_optional(issue.closed.as_ref()),
                issue.status,
                issue.locked_p,
                issue.saved_p,
                issue.milestone,
                issue.body,
                issue.slug,
            ],
        )?;
        Ok(())
    }

    fn get_issue(&self, id: &str) -> Result<Option<Issue>> {
        let conn = self.ready_conn()?;
        conn.query_row(
            &format!("SELECT {ISSUE_COLUMNS} FROM issue WHERE id = ?1"),
            params![id],
            row_to_issue,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_issues(&self, repository: &str) -> Result<Vec<Issue>> {
        let conn = self.ready_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ISSUE_COLUMNS} FROM issue WHERE repository = ?1 ORDER BY number"
        ))?;

        let rows = stmt.query_map(params![repository], row_to_issue)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_issue(&self, id: &str) -> Result<bool> {
        let rows = self
            .ready_conn()?
            .execute("DELETE FROM issue WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // Pull request operations

    fn upsert_pullreq(&self, pullreq: &PullReq) -> Result<()> {
        self.ready_conn()?.execute(
            "INSERT INTO pullreq (class, id, repository, number, state, author, title, created,
                 updated, closed, merged, status, locked_p, draft_p, saved_p, base_ref, head_ref,
                 base_rev, head_rev, milestone, body, slug)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                 ?17, ?18, ?19, ?20, ?21, ?22)
             ON CONFLICT(id) DO UPDATE SET
                 repository = excluded.repository, number = excluded.number,
                 state = excluded.state, author = excluded.author, title = excluded.title,
                 created = excluded.created, updated = excluded.updated,
                 closed = excluded.closed, merged = excluded.merged,
                 status = excluded.status, locked_p = excluded.locked_p,
                 draft_p = excluded.draft_p, saved_p = excluded.saved_p,
                 base_ref = excluded.base_ref, head_ref = excluded.head_ref,
                 base_rev = excluded.base_rev, head_rev = excluded.head_rev,
                 milestone = excluded.milestone, body = excluded.body, slug = excluded.slug",
            params![
                PULLREQ_CLASS,
                pullreq.id,
                pullreq.repository,
                pullreq.number,
                pullreq.state,
                pullreq.author,
                pullreq.title,
                format_datetime(&pullreq.created),
                format_datetime(&pullreq.updated),
                format_optional(pullreq.closed.as_ref()),
                format_optional(pullreq.merged.as_ref()),
                pullreq.status,
                pullreq.locked_p,
                pullreq.draft_p,
                pullreq.saved_p,
                pullreq.base_ref,
                pullreq.head_ref,
                pullreq.base_rev,
                pullreq.head_rev,
                pullreq.milestone,
                pullreq.body,
                pullreq.slug,
            ],
        )?;
        Ok(())
    }

    fn get_pullreq(&self, id: &str) -> Result<Option<PullReq>> {
        let conn = self.ready_conn()?;
        conn.query_row(
            &format!("SELECT {PULLREQ_COLUMNS} FROM pullreq WHERE id = ?1"),
            params![id],
            row_to_pullreq,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_pullreqs(&self, repository: &str) -> Result<Vec<PullReq>> {
        let conn = self.ready_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PULLREQ_COLUMNS} FROM pullreq WHERE repository = ?1 ORDER BY number"
        ))?;

        let rows = stmt.query_map(params![repository], row_to_pullreq)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Issue post operations

    fn upsert_issue_post(&self, post: &IssuePost) -> Result<()> {
        self.ready_conn()?.execute(
            "INSERT INTO issue_post (class, id, issue, number, author, created, updated, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 issue = excluded.issue, number = excluded.number, author = excluded.author,
                 created = excluded.created, updated = excluded.updated, body = excluded.body",
            params![
                ISSUE_POST_CLASS,
                post.id,
                post.issue,
                post.number,
                post.author,
                format_datetime(&post.created),
                format_datetime(&post.updated),
                post.body,
            ],
        )?;
        Ok(())
    }

    fn list_issue_posts(&self, issue: &str) -> Result<Vec<IssuePost>> {
        let conn = self.ready_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, issue, number, author, created, updated, body
             FROM issue_post WHERE issue = ?1 ORDER BY number",
        )?;

        let rows = stmt.query_map(params![issue], |row| {
            Ok(IssuePost {
                id: row.get(0)?,
                issue: row.get(1)?,
                number: row.get(2)?,
                author: row.get(3)?,
                created: datetime_at(row, 4)?,
                updated: datetime_at(row, 5)?,
                body: row.get(6)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Label operations

    fn upsert_label(&self, label: &Label) -> Result<()> {
        self.ready_conn()?.execute(
            "INSERT INTO label (repository, id, name, color, description)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 repository = excluded.repository, name = excluded.name,
                 color = excluded.color, description = excluded.description",
            params![
                label.repository,
                label.id,
                label.name,
                label.color,
                label.description,
            ],
        )?;
        Ok(())
    }

    fn set_issue_labels(&self, issue: &str, label_ids: &[String]) -> Result<()> {
        let mut conn = self.ready_conn()?;
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "UPDATE issue SET labels = ?1 WHERE id = ?2",
            params![Relation::Loaded(label_ids.to_vec()), issue],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }

        tx.execute("DELETE FROM issue_label WHERE issue = ?1", params![issue])?;
        for label_id in label_ids {
            tx.execute(
                "INSERT INTO issue_label (issue, id) VALUES (?1, ?2)",
                params![issue, label_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn list_issue_labels(&self, issue: &str) -> Result<Vec<Label>> {
        let conn = self.ready_conn()?;
        let mut stmt = conn.prepare(
            "SELECT l.repository, l.id, l.name, l.color, l.description
             FROM label l
             INNER JOIN issue_label il ON il.id = l.id
             WHERE il.issue = ?1
             ORDER BY l.name",
        )?;

        let rows = stmt.query_map(params![issue], row_to_label)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Mark operations

    fn create_mark(&self, mark: &Mark) -> Result<()> {
        self.ready_conn()?.execute(
            "INSERT INTO mark (repository, id, name, face, description)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                mark.repository,
                mark.id,
                mark.name,
                mark.face,
                mark.description,
            ],
        )?;
        Ok(())
    }

    fn add_issue_mark(&self, issue: &str, mark: &str) -> Result<()> {
        // Join tables have no key to conflict on.
        self.ready_conn()?.execute(
            "INSERT INTO issue_mark (issue, id)
             SELECT ?1, ?2
             WHERE NOT EXISTS (SELECT 1 FROM issue_mark WHERE issue = ?1 AND id = ?2)",
            params![issue, mark],
        )?;
        Ok(())
    }

    // Milestone operations

    fn upsert_milestone(&self, milestone: &Milestone) -> Result<()> {
        self.ready_conn()?.execute(
            "INSERT INTO milestone (repository, id, number, title, created, updated, due,
                 closed, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 repository = excluded.repository, number = excluded.number,
                 title = excluded.title, created = excluded.created,
                 updated = excluded.updated, due = excluded.due, closed = excluded.closed,
                 description = excluded.description",
            params![
                milestone.repository,
                milestone.id,
                milestone.number,
                milestone.title,
                format_optional(milestone.created.as_ref()),
                format_optional(milestone.updated.as_ref()),
                format_optional(milestone.due.as_ref()),
                format_optional(milestone.closed.as_ref()),
                milestone.description,
            ],
        )?;
        Ok(())
    }

    fn get_milestone(&self, id: &str) -> Result<Option<Milestone>> {
        let conn = self.ready_conn()?;
        conn.query_row(
            "SELECT repository, id, number, title, created, updated, due, closed, description
             FROM milestone WHERE id = ?1",
            params![id],
            |row| {
                Ok(Milestone {
                    repository: row.get(0)?,
                    id: row.get(1)?,
                    number: row.get(2)?,
                    title: text_at(row, 3)?,
                    created: optional_datetime_at(row, 4)?,
                    updated: optional_datetime_at(row, 5)?,
                    due: optional_datetime_at(row, 6)?,
                    closed: optional_datetime_at(row, 7)?,
                    description: row.get(8)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    // Discussion operations

    fn upsert_discussion(&self, discussion: &Discussion) -> Result<()> {
        self.ready_conn()?.execute(
            "INSERT INTO discussion (class, id, repository, number, answer, state, author,
                 title, created, updated, closed, status, locked_p, category, body, upvotes,
                 saved_p, slug)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                 ?17, ?18)
             ON CONFLICT(id) DO UPDATE SET
                 repository = excluded.repository, number = excluded.number,
                 answer = excluded.answer, state = excluded.state, author = excluded.author,
                 title = excluded.title, created = excluded.created,
                 updated = excluded.updated, closed = excluded.closed,
                 status = excluded.status, locked_p = excluded.locked_p,
                 category = excluded.category, body = excluded.body,
                 upvotes = excluded.upvotes, saved_p = excluded.saved_p, slug = excluded.slug",
            params![
                DISCUSSION_CLASS,
                discussion.id,
                discussion.repository,
                discussion.number,
                discussion.answer,
                discussion.state,
                discussion.author,
                discussion.title,
                format_datetime(&discussion.created),
                format_datetime(&discussion.updated),
                format_optional(discussion.closed.as_ref()),
                discussion.status,
                discussion.locked_p,
                discussion.category,
                discussion.body,
                discussion.upvotes,
                discussion.saved_p,
                discussion.slug,
            ],
        )?;
        Ok(())
    }

    fn get_discussion(&self, id: &str) -> Result<Option<Discussion>> {
        let conn = self.ready_conn()?;
        conn.query_row(
            &format!("SELECT {DISCUSSION_COLUMNS} FROM discussion WHERE id = ?1"),
            params![id],
            row_to_discussion,
        )
        .optional()
        .map_err(Error::from)
    }

    fn upsert_discussion_post(&self, post: &DiscussionPost) -> Result<()> {
        self.ready_conn()?.execute(
            "INSERT INTO discussion_post (class, id, discussion, number, author, created,
                 updated, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 discussion = excluded.discussion, number = excluded.number,
                 author = excluded.author, created = excluded.created,
                 updated = excluded.updated, body = excluded.body",
            params![
                DISCUSSION_POST_CLASS,
                post.id,
                post.discussion,
                post.number,
                post.author,
                format_datetime(&post.created),
                format_datetime(&post.updated),
                post.body,
            ],
        )?;
        Ok(())
    }

    fn upsert_discussion_reply(&self, reply: &DiscussionReply) -> Result<()> {
        self.ready_conn()?.execute(
            "INSERT INTO discussion_reply (class, id, post, discussion, number, author,
                 created, updated, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 post = excluded.post, discussion = excluded.discussion,
                 number = excluded.number, author = excluded.author,
                 created = excluded.created, updated = excluded.updated, body = excluded.body",
            params![
                DISCUSSION_REPLY_CLASS,
                reply.id,
                reply.post,
                reply.discussion,
                reply.number,
                reply.author,
                format_datetime(&reply.created),
                format_datetime(&reply.updated),
                reply.body,
            ],
        )?;
        Ok(())
    }

    // Notification operations

    fn upsert_notification(&self, notification: &Notification) -> Result<()> {
        self.ready_conn()?.execute(
            "INSERT INTO notification (class, id, thread_id, repository, type, topic, url,
                 title, reason, last_read, updated, status, saved_p)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                 thread_id = excluded.thread_id, repository = excluded.repository,
                 type = excluded.type, topic = excluded.topic, url = excluded.url,
                 title = excluded.title, reason = excluded.reason,
                 last_read = excluded.last_read, updated = excluded.updated,
                 status = excluded.status, saved_p = excluded.saved_p",
            params![
                NOTIFICATION_CLASS,
                notification.id,
                notification.thread_id,
                notification.repository,
                notification.kind,
                notification.topic,
                notification.url,
                notification.title,
                notification.reason,
                format_optional(notification.last_read.as_ref()),
                format_datetime(&notification.updated),
                notification.status,
                notification.saved_p,
            ],
        )?;
        Ok(())
    }

    fn list_notifications(&self, repository: &str) -> Result<Vec<Notification>> {
        let conn = self.ready_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, repository, thread_id, type, topic, url, title, reason, last_read,
                 updated, status, saved_p
             FROM notification WHERE repository = ?1 ORDER BY updated DESC",
        )?;

        let rows = stmt.query_map(params![repository], |row| {
            Ok(Notification {
                id: row.get(0)?,
                repository: row.get(1)?,
                thread_id: row.get(2)?,
                kind: text_at(row, 3)?,
                topic: row.get(4)?,
                url: row.get(5)?,
                title: text_at(row, 6)?,
                reason: row.get(7)?,
                last_read: optional_datetime_at(row, 8)?,
                updated: datetime_at(row, 9)?,
                status: row.get(10)?,
                saved_p: flag_at(row, 11)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn backup(&self) -> Result<PathBuf> {
        let conn = self.conn();
        let version = Ledger::new(&conn).version()?;
        backup::create(&conn, &self.path, &self.backup_dir, version, Local::now())
    }

    fn close(&self) -> Result<()> {
        let checkpoint = self.conn().checkpoint()?;
        if !checkpoint.is_complete() {
            tracing::warn!(
                "Write-ahead log still in use on close ({} of {} frames checkpointed)",
                checkpoint.checkpointed,
                checkpoint.log_frames
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::migrate;
    use crate::store::schema::TARGET_VERSION;
    use tempfile::TempDir;

    fn open_store(temp: &TempDir) -> SqliteStore {
        let store = SqliteStore::new(temp.path().join("test.sqlite")).unwrap();
        store.initialize().unwrap();
        store
    }

    fn repository(id: &str) -> Repository {
        Repository {
            id: id.to_string(),
            class: RepositoryClass::Github,
            forge_id: Some("R_1".to_string()),
            forge: "github".to_string(),
            owner: "octo".to_string(),
            name: format!("project-{id}"),
            apihost: "api.github.com".to_string(),
            githost: "github.com".to_string(),
            remote: Some("origin".to_string()),
            condition: Condition::Tracked,
            created: Some(Utc::now()),
            updated: None,
            description: None,
            default_branch: Some("main".to_string()),
            selective_p: false,
            worktree: None,
            issues_until: None,
            pullreqs_until: None,
            discussions_p: false,
            discussions_until: None,
            issues: Relation::Unfetched,
            pullreqs: Relation::Unfetched,
            labels: Relation::Unfetched,
            milestones: Relation::Unfetched,
            discussions: Relation::Unfetched,
        }
    }

    fn issue(repository: &str, number: i64) -> Issue {
        Issue {
            id: derive_id(repository, number),
            repository: repository.to_string(),
            number,
            state: IssueState::Open,
            author: Some("octocat".to_string()),
            title: format!("Issue {number}"),
            created: Utc::now(),
            updated: Utc::now(),
            closed: None,
            status: Status::Unread,
            locked_p: false,
            saved_p: false,
            milestone: None,
            body: Some("body".to_string()),
            slug: Some(format!("#{number}")),
            labels: Relation::Unfetched,
            assignees: Relation::Unfetched,
            posts: Relation::Unfetched,
        }
    }

    fn label(repository: &str, name: &str) -> Label {
        Label {
            id: derive_id(repository, format!("label:{name}")),
            repository: repository.to_string(),
            name: name.to_string(),
            color: Some("#ff0000".to_string()),
            description: None,
        }
    }

    #[test]
    fn test_initialize_creates_current_schema() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        assert_eq!(store.schema_version().unwrap(), TARGET_VERSION);
        assert!(migrate::drift(&store.conn()).unwrap().is_empty());

        // A second start finds nothing to do.
        assert_eq!(store.upgrade().unwrap(), Outcome::UpToDate);
    }

    #[test]
    fn test_operations_wait_for_startup_check() {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.sqlite")).unwrap();

        assert!(matches!(
            store.upsert_repository(&repository("r1")),
            Err(Error::NotInitialized)
        ));
        assert!(matches!(store.get_issue("i"), Err(Error::NotInitialized)));

        store.initialize().unwrap();
        store.upsert_repository(&repository("r1")).unwrap();
    }

    #[test]
    fn test_refused_store_stays_unusable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test.sqlite");
        let store = SqliteStore::new(&path).unwrap();
        store.initialize().unwrap();
        store.upsert_repository(&repository("r1")).unwrap();
        store.conn().set_user_version(TARGET_VERSION + 1).unwrap();

        assert!(matches!(
            store.initialize(),
            Err(Error::VersionSkew { .. })
        ));
        assert!(matches!(
            store.delete_repository("r1"),
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            store.upsert_repository(&repository("r2")),
            Err(Error::NotInitialized)
        ));

        let rows: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM repository", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_repository_crud() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        store.upsert_repository(&repository("r1")).unwrap();
        store.upsert_repository(&repository("r2")).unwrap();

        let fetched = store.get_repository("r1").unwrap().unwrap();
        assert_eq!(fetched.class, RepositoryClass::Github);
        assert_eq!(fetched.condition, Condition::Tracked);
        assert_eq!(fetched.issues, Relation::Unfetched);

        let by_name = store
            .get_repository_by_name("github", "octo", "project-r2")
            .unwrap()
            .unwrap();
        assert_eq!(by_name.id, "r2");

        let mut changed = repository("r1");
        changed.description = Some("updated".to_string());
        store.upsert_repository(&changed).unwrap();
        assert_eq!(
            store.get_repository("r1").unwrap().unwrap().description.as_deref(),
            Some("updated")
        );

        let page = store.list_repositories("r1", 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "r2");

        assert!(store.delete_repository("r1").unwrap());
        assert!(!store.delete_repository("r1").unwrap());
        assert!(store.get_repository("r1").unwrap().is_none());
    }

    #[test]
    fn test_upsert_keeps_loaded_relations() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.upsert_repository(&repository("r1")).unwrap();

        let bug = label("r1", "bug");
        store.upsert_label(&bug).unwrap();

        let first = issue("r1", 1);
        store.upsert_issue(&first).unwrap();
        assert_eq!(
            store.get_issue(&first.id).unwrap().unwrap().labels,
            Relation::Unfetched
        );

        store
            .set_issue_labels(&first.id, &[bug.id.clone()])
            .unwrap();

        let mut retitled = issue("r1", 1);
        retitled.title = "Renamed".to_string();
        store.upsert_issue(&retitled).unwrap();

        let fetched = store.get_issue(&first.id).unwrap().unwrap();
        assert_eq!(fetched.title, "Renamed");
        assert_eq!(fetched.labels, Relation::Loaded(vec![bug.id.clone()]));
        assert_eq!(fetched.posts, Relation::Unfetched);

        let labels = store.list_issue_labels(&first.id).unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].name, "bug");

        store.set_issue_labels(&first.id, &[]).unwrap();
        let fetched = store.get_issue(&first.id).unwrap().unwrap();
        assert_eq!(fetched.labels, Relation::Loaded(vec![]));
        assert!(store.list_issue_labels(&first.id).unwrap().is_empty());
    }

    #[test]
    fn test_set_labels_of_unknown_issue() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        let err = store.set_issue_labels("missing", &[]).unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn test_delete_repository_cascades() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.upsert_repository(&repository("r1")).unwrap();

        let first = issue("r1", 1);
        store.upsert_issue(&first).unwrap();
        store
            .upsert_issue_post(&IssuePost {
                id: derive_id(&first.id, 1),
                issue: first.id.clone(),
                number: 1,
                author: None,
                created: Utc::now(),
                updated: Utc::now(),
                body: Some("first!".to_string()),
            })
            .unwrap();
        let bug = label("r1", "bug");
        store.upsert_label(&bug).unwrap();
        store.set_issue_labels(&first.id, &[bug.id]).unwrap();
        assert_eq!(store.list_issue_posts(&first.id).unwrap().len(), 1);

        assert!(store.delete_repository("r1").unwrap());

        assert!(store.get_issue(&first.id).unwrap().is_none());
        assert!(store.list_issue_posts(&first.id).unwrap().is_empty());
        let joins: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM issue_label", [], |row| row.get(0))
            .unwrap();
        assert_eq!(joins, 0);
    }

    #[test]
    fn test_add_issue_mark_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.upsert_repository(&repository("r1")).unwrap();
        let first = issue("r1", 1);
        store.upsert_issue(&first).unwrap();

        let mark = Mark {
            id: derive_id("r1", "mark:todo"),
            repository: "r1".to_string(),
            name: "todo".to_string(),
            face: None,
            description: None,
        };
        store.create_mark(&mark).unwrap();
        store.add_issue_mark(&first.id, &mark.id).unwrap();
        store.add_issue_mark(&first.id, &mark.id).unwrap();

        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM issue_mark", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        assert!(store.add_issue_mark(&first.id, "no-such-mark").is_err());
    }

    #[test]
    fn test_pullreq_and_milestone() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.upsert_repository(&repository("r1")).unwrap();

        let milestone = Milestone {
            id: derive_id("r1", "milestone:v1"),
            repository: "r1".to_string(),
            number: Some(1),
            title: "v1".to_string(),
            created: None,
            updated: None,
            due: Some(Utc::now()),
            closed: None,
            description: None,
        };
        store.upsert_milestone(&milestone).unwrap();

        let pullreq = PullReq {
            id: derive_id("r1", "pr:3"),
            repository: "r1".to_string(),
            number: 3,
            state: PullReqState::Merged,
            author: None,
            title: "Fix".to_string(),
            created: Utc::now(),
            updated: Utc::now(),
            closed: Some(Utc::now()),
            merged: Some(Utc::now()),
            status: Status::Done,
            locked_p: false,
            draft_p: true,
            saved_p: true,
            base_ref: Some("main".to_string()),
            head_ref: Some("fix".to_string()),
            base_rev: None,
            head_rev: None,
            milestone: Some(milestone.id.clone()),
            body: None,
            slug: Some("#3".to_string()),
            labels: Relation::Unfetched,
            review_requests: Relation::Unfetched,
        };
        store.upsert_pullreq(&pullreq).unwrap();

        let fetched = store.get_pullreq(&pullreq.id).unwrap().unwrap();
        assert_eq!(fetched.state, PullReqState::Merged);
        assert!(fetched.draft_p);
        assert!(fetched.saved_p);
        assert_eq!(fetched.review_requests, Relation::Unfetched);

        let linked = store
            .get_milestone(fetched.milestone.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(linked.title, "v1");
        assert_eq!(store.list_pullreqs("r1").unwrap().len(), 1);
    }

    #[test]
    fn test_discussion_threads_and_notifications() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.upsert_repository(&repository("r1")).unwrap();

        let discussion = Discussion {
            id: derive_id("r1", "discussion:5"),
            repository: "r1".to_string(),
            number: 5,
            state: DiscussionState::Open,
            author: None,
            title: "Ideas".to_string(),
            created: Utc::now(),
            updated: Utc::now(),
            closed: None,
            status: Status::Pending,
            locked_p: false,
            saved_p: false,
            category: None,
            answer: None,
            upvotes: 4,
            body: None,
            slug: Some("#5".to_string()),
            labels: Relation::Unfetched,
            posts: Relation::Unfetched,
            marks: Relation::Unfetched,
        };
        store.upsert_discussion(&discussion).unwrap();

        let post = DiscussionPost {
            id: derive_id(&discussion.id, 1),
            discussion: discussion.id.clone(),
            number: 1,
            author: None,
            created: Utc::now(),
            updated: Utc::now(),
            body: Some("post".to_string()),
            replies: Relation::Unfetched,
        };
        store.upsert_discussion_post(&post).unwrap();
        store
            .upsert_discussion_reply(&DiscussionReply {
                id: derive_id(&post.id, 1),
                post: post.id.clone(),
                discussion: discussion.id.clone(),
                number: 1,
                author: None,
                created: Utc::now(),
                updated: Utc::now(),
                body: Some("reply".to_string()),
            })
            .unwrap();

        let fetched = store.get_discussion(&discussion.id).unwrap().unwrap();
        assert_eq!(fetched.upvotes, 4);
        assert_eq!(fetched.marks, Relation::Unfetched);

        store
            .upsert_notification(&Notification {
                id: "n1".to_string(),
                repository: "r1".to_string(),
                thread_id: Some("t1".to_string()),
                kind: "discussion".to_string(),
                topic: Some(discussion.id.clone()),
                url: None,
                title: "Ideas".to_string(),
                reason: Some("subscribed".to_string()),
                last_read: None,
                updated: Utc::now(),
                status: Status::Unread,
                saved_p: false,
            })
            .unwrap();
        let notifications = store.list_notifications("r1").unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].status, Status::Unread);
        assert_eq!(notifications[0].kind, "discussion");
    }

    #[test]
    fn test_backup_uses_configured_directory() {
        let temp = TempDir::new().unwrap();
        let backups = temp.path().join("backups");
        fs::create_dir(&backups).unwrap();

        let store = SqliteStore::new(temp.path().join("forge.sqlite"))
            .unwrap()
            .with_backup_dir(&backups);
        store.initialize().unwrap();

        let path = store.backup().unwrap();
        assert_eq!(path.parent().unwrap(), backups);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("forge-v{TARGET_VERSION}-")));
        assert!(name.ends_with(".sqlite"));
    }
}
