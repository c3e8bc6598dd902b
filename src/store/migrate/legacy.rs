//! The oldest layout the step chain can upgrade from.
//!
//! Kept so that upgrade paths can be seeded and exercised end to end; nothing
//! creates this layout during normal operation.

use rusqlite::Connection;

use crate::error::Result;
use crate::store::port::SchemaPort;
use crate::store::schema::{
    self, TableSpec, cascade, col, entity, flag, key, owner, relation,
};

pub const BASELINE_VERSION: u32 = 2;

const REPOSITORY_V2: TableSpec = entity(
    "repository",
    &[
        owner("class"),
        key(),
        col("forge_id"),
        col("forge"),
        col("owner"),
        col("name"),
        col("apihost"),
        col("githost"),
        col("remote"),
        col("sparse_p"),
        col("created"),
        col("updated"),
        col("pushed"),
        col("parent"),
        col("description"),
        col("homepage"),
        col("default_branch"),
        col("archived_p"),
        col("fork_p"),
        col("locked_p"),
        col("mirror_p"),
        col("private_p"),
        col("issues_p"),
        col("wiki_p"),
        col("stars"),
        col("watchers"),
        relation("assignees"),
        relation("forks"),
        relation("issues"),
        relation("labels"),
        relation("pullreqs"),
    ],
    &[],
);

const ISSUE_V2: TableSpec = entity(
    "issue",
    &[
        owner("class"),
        key(),
        owner("repository"),
        col("number"),
        col("state"),
        col("author"),
        col("title"),
        col("created"),
        col("updated"),
        col("closed"),
        flag("unread_p"),
        col("locked_p"),
        col("milestone"),
        col("body"),
        relation("assignees"),
        relation("cards"),
        relation("edits"),
        relation("labels"),
        relation("participants"),
        relation("posts"),
        relation("reactions"),
        relation("timeline"),
    ],
    &[cascade("repository", "repository")],
);

const PULLREQ_V2: TableSpec = entity(
    "pullreq",
    &[
        owner("class"),
        key(),
        owner("repository"),
        col("number"),
        col("state"),
        col("author"),
        col("title"),
        col("created"),
        col("updated"),
        col("closed"),
        col("merged"),
        flag("unread_p"),
        col("locked_p"),
        col("editable_p"),
        col("cross_repo_p"),
        col("base_ref"),
        col("base_repo"),
        col("head_ref"),
        col("head_user"),
        col("head_repo"),
        col("milestone"),
        col("body"),
        relation("assignees"),
        relation("cards"),
        relation("commits"),
        relation("edits"),
        relation("labels"),
        relation("participants"),
        relation("posts"),
        relation("reactions"),
        relation("review_requests"),
        relation("reviews"),
        relation("timeline"),
    ],
    &[cascade("repository", "repository")],
);

const NOTIFICATION_V2: TableSpec = entity(
    "notification",
    &[
        owner("class"),
        key(),
        col("thread_id"),
        owner("repository"),
        col("forge"),
        col("reason"),
        flag("unread_p"),
        col("last_read"),
        col("updated"),
        col("title"),
        col("type"),
        col("topic"),
        col("url"),
    ],
    &[cascade("repository", "repository")],
);

/// Tables whose layout has not changed since the baseline.
const UNCHANGED: &[&str] = &[
    "label",
    "assignee",
    "fork",
    "issue_post",
    "pullreq_post",
    "issue_label",
    "issue_assignee",
    "pullreq_label",
    "pullreq_assignee",
];

/// Creates the baseline layout in an empty store and stamps it with
/// [`BASELINE_VERSION`].
pub fn create_baseline(conn: &Connection) -> Result<()> {
    for spec in [&REPOSITORY_V2, &ISSUE_V2, &PULLREQ_V2, &NOTIFICATION_V2] {
        conn.create_table(spec)?;
    }
    for name in UNCHANGED {
        conn.create_table(schema::declared_table(name)?)?;
    }
    conn.set_user_version(BASELINE_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_tables_are_consistent() {
        let mut tables = vec![REPOSITORY_V2, ISSUE_V2, PULLREQ_V2, NOTIFICATION_V2];
        for name in UNCHANGED {
            tables.push(*schema::table(name).unwrap());
        }
        schema::validate_tables(&tables).unwrap();
    }

    #[test]
    fn test_create_baseline() {
        let conn = Connection::open_in_memory().unwrap();
        create_baseline(&conn).unwrap();

        assert_eq!(conn.user_version().unwrap(), BASELINE_VERSION);
        assert!(conn.has_column("issue", "unread_p").unwrap());
        assert!(conn.has_column("repository", "sparse_p").unwrap());
        assert!(!conn.table_exists("milestone").unwrap());
    }
}
