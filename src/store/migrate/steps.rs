//! Bodies of the individual upgrade steps, one function per produced version.
//!
//! Every body is safe to run against a store where it already ran: tables and
//! columns are only created when absent, replaced columns are only converted
//! while the old column exists, and backfills only touch rows that are still
//! `NULL`.

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, ToSql, params};

use crate::error::{Error, Result};
use crate::store::port::SchemaPort;
use crate::store::schema::{
    self, TableSpec, cascade, col, entity, flag, key, owner, quote_ident, relation,
};
use crate::types::{
    Condition, IssueState, PullReqState, RepositoryClass, Status, TopicKind, derive_id,
};

/// `notification` as introduced by step 4; step 12 reworks its flag.
const NOTIFICATION_V4: TableSpec = entity(
    "notification",
    &[
        owner("class"),
        key(),
        col("thread_id"),
        owner("repository"),
        col("type"),
        col("topic"),
        col("url"),
        col("title"),
        col("reason"),
        col("last_read"),
        col("updated"),
        flag("unread_p"),
    ],
    &[cascade("repository", "repository")],
);

/// `discussion` as introduced by step 14; step 15 adds to it.
const DISCUSSION_V14: TableSpec = entity(
    "discussion",
    &[
        owner("class"),
        key(),
        owner("repository"),
        col("number"),
        col("answer"),
        col("state"),
        col("author"),
        col("title"),
        col("created"),
        col("updated"),
        col("closed"),
        col("status"),
        col("locked_p"),
        col("category"),
        col("body"),
        relation("edits"),
        relation("labels"),
        relation("posts"),
        relation("reactions"),
        relation("timeline"),
        flag("upvotes"),
    ],
    &[cascade("repository", "repository")],
);

const ISSUE_STATES: &[(&str, IssueState)] = &[
    ("open", IssueState::Open),
    ("closed", IssueState::Completed),
    ("completed", IssueState::Completed),
    ("unplanned", IssueState::Unplanned),
];

const PULLREQ_STATES: &[(&str, PullReqState)] = &[
    ("open", PullReqState::Open),
    ("closed", PullReqState::Rejected),
    ("merged", PullReqState::Merged),
    ("rejected", PullReqState::Rejected),
];

// Tables created straight from the registry have not changed since the step
// that introduces them. Give a table a frozen definition here before any
// later step alters it.
fn ensure_declared(conn: &Connection, table: &str) -> Result<bool> {
    conn.ensure_table(schema::declared_table(table)?)
}

fn add_declared(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    conn.add_column_if_absent(table, schema::declared_column(table, column)?)
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(n) => n.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => format!("'{s}'"),
        Value::Blob(b) => format!("<{} byte blob>", b.len()),
    }
}

fn rewrite<T: ToSql>(conn: &Connection, table: &str, column: &str, rows: &[(String, T)]) -> Result<()> {
    let mut update = conn.prepare(&format!(
        "UPDATE {} SET {} = ?1 WHERE id = ?2",
        quote_ident(table),
        quote_ident(column)
    ))?;
    for (id, value) in rows {
        update.execute(params![value, id])?;
    }
    Ok(())
}

pub(super) fn v03(conn: &Connection) -> Result<()> {
    ensure_declared(conn, "pullreq_review_request")?;
    Ok(())
}

pub(super) fn v04(conn: &Connection) -> Result<()> {
    // Notifications mirror the forge's inbox and are refetched; old rows are
    // not carried over.
    conn.drop_table_if_exists("notification")?;
    conn.create_table(&NOTIFICATION_V4)
}

pub(super) fn v05(conn: &Connection) -> Result<()> {
    add_declared(conn, "repository", "selective_p")?;
    Ok(())
}

pub(super) fn v06(conn: &Connection) -> Result<()> {
    add_declared(conn, "repository", "worktree")?;
    Ok(())
}

pub(super) fn v07(conn: &Connection) -> Result<()> {
    add_declared(conn, "repository", "issues_until")?;
    add_declared(conn, "repository", "pullreqs_until")?;
    let issues = backfill_until(conn, "issues_until", "issue")?;
    let pullreqs = backfill_until(conn, "pullreqs_until", "pullreq")?;
    tracing::debug!(
        "Backfilled update cursors for {} (issues) and {} (pull requests) repositories",
        issues,
        pullreqs
    );
    Ok(())
}

/// Sets `repository.<column>` to the newest `updated` among the repository's
/// rows in `child`, for repositories that have no cursor yet.
fn backfill_until(conn: &Connection, column: &str, child: &str) -> Result<usize> {
    let column = quote_ident(column);
    let rows: Vec<(String, Option<String>)> = conn
        .prepare(&format!(
            "SELECT r.id, (SELECT MAX(c.updated) FROM {} c WHERE c.repository = r.id)
             FROM repository r WHERE r.{column} IS NULL",
            quote_ident(child)
        ))?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<_, _>>()?;

    let mut update = conn.prepare(&format!(
        "UPDATE repository SET {column} = ?1 WHERE id = ?2 AND {column} IS NULL"
    ))?;
    let mut filled = 0;
    for (id, latest) in rows {
        if let Some(latest) = latest {
            filled += update.execute(params![latest, id])?;
        }
    }
    Ok(filled)
}

pub(super) fn v08(conn: &Connection) -> Result<()> {
    for table in ["mark", "issue_mark", "pullreq_mark"] {
        ensure_declared(conn, table)?;
    }
    Ok(())
}

pub(super) fn v09(conn: &Connection) -> Result<()> {
    ensure_declared(conn, "milestone")?;
    add_declared(conn, "repository", "milestones")?;
    Ok(())
}

pub(super) fn v10(conn: &Connection) -> Result<()> {
    for column in ["draft_p", "base_rev", "head_rev"] {
        add_declared(conn, "pullreq", column)?;
    }
    Ok(())
}

pub(super) fn v11(conn: &Connection) -> Result<()> {
    for table in ["issue", "pullreq"] {
        let moved = split_milestones(conn, table)?;
        tracing::debug!("Linked {} {} rows to milestone records", moved, table);
    }
    Ok(())
}

/// Replaces the inline milestone title on each row of `table` with the id of
/// a `milestone` row, creating that row when the repository has none with the
/// same title.
fn split_milestones(conn: &Connection, table: &str) -> Result<usize> {
    let rows: Vec<(String, String, Value)> = conn
        .prepare(&format!(
            "SELECT id, repository, milestone FROM {} WHERE milestone IS NOT NULL",
            quote_ident(table)
        ))?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<_, _>>()?;

    let mut linked = Vec::with_capacity(rows.len());
    for (id, repository, value) in rows {
        let title = match value {
            Value::Text(title) => title,
            other => return Err(Error::unmapped(table, "milestone", describe(&other))),
        };
        let milestone = if title.is_empty() {
            None
        } else {
            Some(milestone_for(conn, &repository, &title)?)
        };
        linked.push((id, milestone));
    }

    rewrite(conn, table, "milestone", &linked)?;
    Ok(linked.len())
}

fn milestone_for(conn: &Connection, repository: &str, title: &str) -> Result<String> {
    // Already an id: this row was linked by an earlier run.
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM milestone WHERE repository = ?1 AND id = ?2",
            params![repository, title],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let by_title: Option<String> = conn
        .query_row(
            "SELECT id FROM milestone WHERE repository = ?1 AND title = ?2
             ORDER BY number LIMIT 1",
            params![repository, title],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = by_title {
        return Ok(id);
    }

    let id = derive_id(repository, format!("milestone:{title}"));
    conn.execute(
        "INSERT INTO milestone (repository, id, title) VALUES (?1, ?2, ?3)",
        params![repository, id, title],
    )?;
    Ok(id)
}

pub(super) fn v12(conn: &Connection) -> Result<()> {
    for table in ["issue", "pullreq", "notification"] {
        unread_to_status(conn, table)?;
        add_declared(conn, table, "saved_p")?;
    }
    sparse_to_condition(conn)
}

fn unread_to_status(conn: &Connection, table: &str) -> Result<()> {
    if !conn.has_column(table, "unread_p")? {
        return Ok(());
    }

    let state = if conn.has_column(table, "state")? {
        "state"
    } else {
        "NULL"
    };
    let rows: Vec<(String, Value, Value)> = conn
        .prepare(&format!(
            "SELECT id, unread_p, {state} FROM {}",
            quote_ident(table)
        ))?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<_, _>>()?;

    let mut mapped = Vec::with_capacity(rows.len());
    for (id, unread, state) in rows {
        mapped.push((id, status_from_unread(table, &unread, &state)?));
    }

    // Added rather than renamed so it takes the declared default, not the
    // flag's.
    add_declared(conn, table, "status")?;
    rewrite(conn, table, "status", &mapped)?;
    conn.drop_column(table, "unread_p")
}

fn status_from_unread(table: &str, unread: &Value, state: &Value) -> Result<Status> {
    let finished = matches!(state, Value::Text(s) if s == "closed" || s == "merged");
    match unread {
        Value::Integer(1) => Ok(Status::Unread),
        Value::Integer(0) | Value::Null if finished => Ok(Status::Done),
        Value::Integer(0) | Value::Null => Ok(Status::Pending),
        other => Err(Error::unmapped(table, "unread_p", describe(other))),
    }
}

fn sparse_to_condition(conn: &Connection) -> Result<()> {
    if !conn.has_column("repository", "sparse_p")? {
        return Ok(());
    }

    let rows: Vec<(String, Value)> = conn
        .prepare("SELECT id, sparse_p FROM repository")?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<_, _>>()?;

    let mut mapped = Vec::with_capacity(rows.len());
    for (id, sparse) in rows {
        let condition = match sparse {
            Value::Integer(1) => Condition::Known,
            Value::Integer(0) | Value::Null => Condition::Tracked,
            other => return Err(Error::unmapped("repository", "sparse_p", describe(&other))),
        };
        mapped.push((id, condition));
    }

    add_declared(conn, "repository", "condition")?;
    rewrite(conn, "repository", "condition", &mapped)?;
    conn.drop_column("repository", "sparse_p")
}

pub(super) fn v13(conn: &Connection) -> Result<()> {
    reencode_states(conn, "issue", ISSUE_STATES)?;
    reencode_states(conn, "pullreq", PULLREQ_STATES)
}

/// Rewrites every `state` of `table` through `mapping`. Values already in the
/// new encoding map to themselves.
fn reencode_states<S: ToSql + Copy>(
    conn: &Connection,
    table: &str,
    mapping: &[(&str, S)],
) -> Result<()> {
    let rows: Vec<(String, Value)> = conn
        .prepare(&format!("SELECT id, state FROM {}", quote_ident(table)))?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<_, _>>()?;

    let mut mapped = Vec::with_capacity(rows.len());
    for (id, state) in rows {
        let new = match &state {
            Value::Text(old) => mapping
                .iter()
                .find(|(from, _)| *from == old.as_str())
                .map(|(_, to)| *to),
            _ => None,
        }
        .ok_or_else(|| Error::unmapped(table, "state", describe(&state)))?;
        mapped.push((id, new));
    }

    rewrite(conn, table, "state", &mapped)
}

pub(super) fn v14(conn: &Connection) -> Result<()> {
    ensure_declared(conn, "discussion_category")?;
    conn.ensure_table(&DISCUSSION_V14)?;
    for table in ["discussion_post", "discussion_reply", "discussion_label"] {
        ensure_declared(conn, table)?;
    }

    // Existing repositories have never had discussions fetched.
    for column in [
        "discussion_categories",
        "discussions",
        "discussions_p",
        "discussions_until",
    ] {
        add_declared(conn, "repository", column)?;
    }
    Ok(())
}

pub(super) fn v15(conn: &Connection) -> Result<()> {
    add_declared(conn, "issue", "slug")?;
    add_declared(conn, "pullreq", "slug")?;
    for column in ["saved_p", "marks", "slug"] {
        add_declared(conn, "discussion", column)?;
    }
    ensure_declared(conn, "discussion_mark")?;

    backfill_slugs(conn, "issue", TopicKind::Issue)?;
    backfill_slugs(conn, "pullreq", TopicKind::PullReq)?;
    backfill_slugs(conn, "discussion", TopicKind::Discussion)?;
    Ok(())
}

/// Fills `slug` from the topic number, in the notation of the owning
/// repository's forge.
fn backfill_slugs(conn: &Connection, table: &str, kind: TopicKind) -> Result<usize> {
    let rows: Vec<(String, Value, Value)> = conn
        .prepare(&format!(
            "SELECT t.id, t.number, r.class FROM {} t
             JOIN repository r ON r.id = t.repository
             WHERE t.slug IS NULL",
            quote_ident(table)
        ))?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<_, _>>()?;

    let mut slugs = Vec::with_capacity(rows.len());
    for (id, number, class) in rows {
        let class = match &class {
            Value::Text(name) => RepositoryClass::parse(name),
            _ => None,
        }
        .ok_or_else(|| Error::unmapped("repository", "class", describe(&class)))?;
        let number = match number {
            Value::Integer(number) => number,
            other => return Err(Error::unmapped(table, "number", describe(&other))),
        };
        slugs.push((id, class.slug(kind, number)));
    }

    rewrite(conn, table, "slug", &slugs)?;
    Ok(slugs.len())
}
