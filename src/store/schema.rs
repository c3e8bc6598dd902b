//! Declarative description of the store's tables.
//!
//! The registry is the single source of truth for the *current* layout: fresh
//! stores are created from it, and the upgrade chain must land exactly on it.
//! Columns carry no declared type; values keep the storage class they were
//! written with.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::types::UNFETCHED;

/// Schema version produced by this build.
pub const TARGET_VERSION: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDefault {
    Null,
    Integer(i64),
    Text(&'static str),
    /// The relation has never been loaded from the forge.
    Unfetched,
}

impl ColumnDefault {
    fn sql_literal(self) -> String {
        match self {
            ColumnDefault::Null => "NULL".to_string(),
            ColumnDefault::Integer(n) => n.to_string(),
            ColumnDefault::Text(s) => quote_literal(s),
            ColumnDefault::Unfetched => quote_literal(UNFETCHED),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub default: Option<ColumnDefault>,
    pub not_null: bool,
    pub primary_key: bool,
    pub unique: bool,
}

impl ColumnSpec {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            default: None,
            not_null: false,
            primary_key: false,
            unique: false,
        }
    }

    pub const fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub const fn default(mut self, default: ColumnDefault) -> Self {
        self.default = Some(default);
        self
    }

    /// The default as the engine reports it back, e.g. `':unfetched'`.
    #[must_use]
    pub fn default_sql(&self) -> Option<String> {
        self.default.map(ColumnDefault::sql_literal)
    }

    /// Column definition as it appears in `CREATE TABLE` or `ADD COLUMN`.
    #[must_use]
    pub fn definition(&self) -> String {
        let mut def = quote_ident(self.name);
        if self.primary_key {
            def.push_str(" PRIMARY KEY");
        }
        if self.not_null {
            def.push_str(" NOT NULL");
        }
        if self.unique {
            def.push_str(" UNIQUE");
        }
        if let Some(default) = self.default_sql() {
            def.push_str(" DEFAULT ");
            def.push_str(&default);
        }
        def
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    Cascade,
    SetNull,
}

impl OnDelete {
    fn sql(self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKeySpec {
    pub column: &'static str,
    pub references: &'static str,
    pub target_column: &'static str,
    pub on_delete: OnDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// A record type keyed by `id` in its second column.
    Entity,
    /// A keyless `(owner, id)` association between two entities.
    Join,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub kind: TableKind,
    pub columns: &'static [ColumnSpec],
    pub foreign_keys: &'static [ForeignKeySpec],
}

impl TableSpec {
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn primary_key(&self) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.primary_key)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    #[must_use]
    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(ColumnSpec::definition).collect();
        for fk in self.foreign_keys {
            parts.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
                quote_ident(fk.column),
                quote_ident(fk.references),
                quote_ident(fk.target_column),
                fk.on_delete.sql()
            ));
        }
        format!(
            "CREATE TABLE {} (\n    {}\n)",
            quote_ident(self.name),
            parts.join(",\n    ")
        )
    }

    /// One index per foreign-key column so cascades do not scan.
    #[must_use]
    pub fn index_sql(&self) -> Vec<String> {
        self.foreign_keys
            .iter()
            .map(|fk| {
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    quote_ident(&format!("idx_{}_{}", self.name, fk.column)),
                    quote_ident(self.name),
                    quote_ident(fk.column)
                )
            })
            .collect()
    }
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(crate) const fn col(name: &'static str) -> ColumnSpec {
    ColumnSpec::new(name)
}

pub(crate) const fn key() -> ColumnSpec {
    ColumnSpec::new("id").not_null().primary_key()
}

pub(crate) const fn owner(name: &'static str) -> ColumnSpec {
    ColumnSpec::new(name).not_null()
}

pub(crate) const fn relation(name: &'static str) -> ColumnSpec {
    ColumnSpec::new(name).default(ColumnDefault::Unfetched)
}

pub(crate) const fn flag(name: &'static str) -> ColumnSpec {
    ColumnSpec::new(name).default(ColumnDefault::Integer(0))
}

pub(crate) const fn cascade(column: &'static str, references: &'static str) -> ForeignKeySpec {
    ForeignKeySpec {
        column,
        references,
        target_column: "id",
        on_delete: OnDelete::Cascade,
    }
}

pub(crate) const fn join(
    name: &'static str,
    columns: &'static [ColumnSpec],
    foreign_keys: &'static [ForeignKeySpec],
) -> TableSpec {
    TableSpec {
        name,
        kind: TableKind::Join,
        columns,
        foreign_keys,
    }
}

pub(crate) const fn entity(
    name: &'static str,
    columns: &'static [ColumnSpec],
    foreign_keys: &'static [ForeignKeySpec],
) -> TableSpec {
    TableSpec {
        name,
        kind: TableKind::Entity,
        columns,
        foreign_keys,
    }
}

const REPOSITORY: TableSpec = entity(
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
        flag("selective_p"),
        col("worktree"),
        col("issues_until"),
        col("pullreqs_until"),
        relation("milestones"),
        col("condition").default(ColumnDefault::Text(":known")),
        relation("discussion_categories"),
        relation("discussions"),
        flag("discussions_p"),
        col("discussions_until"),
    ],
    &[],
);

const LABEL: TableSpec = entity(
    "label",
    &[
        owner("repository"),
        key(),
        col("name"),
        col("color"),
        col("description"),
    ],
    &[cascade("repository", "repository")],
);

const ASSIGNEE: TableSpec = entity(
    "assignee",
    &[
        owner("repository"),
        key(),
        col("login"),
        col("name"),
        col("forge_id"),
    ],
    &[cascade("repository", "repository")],
);

const MARK: TableSpec = entity(
    "mark",
    &[
        owner("repository"),
        key(),
        col("name"),
        col("face"),
        col("description"),
    ],
    &[cascade("repository", "repository")],
);

const MILESTONE: TableSpec = entity(
    "milestone",
    &[
        owner("repository"),
        key(),
        col("number"),
        col("title"),
        col("created"),
        col("updated"),
        col("due"),
        col("closed"),
        col("state"),
        col("description"),
    ],
    &[cascade("repository", "repository")],
);

const FORK: TableSpec = entity(
    "fork",
    &[owner("parent"), key(), col("owner"), col("name")],
    &[cascade("parent", "repository")],
);

const ISSUE: TableSpec = entity(
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
        col("status"),
        flag("saved_p").not_null(),
        col("slug"),
    ],
    &[cascade("repository", "repository")],
);

const ISSUE_POST: TableSpec = entity(
    "issue_post",
    &[
        owner("class"),
        key(),
        owner("issue"),
        col("number"),
        col("author"),
        col("created"),
        col("updated"),
        col("body"),
        relation("edits"),
        relation("reactions"),
    ],
    &[cascade("issue", "issue")],
);

const PULLREQ: TableSpec = entity(
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
        flag("draft_p"),
        col("base_rev"),
        col("head_rev"),
        col("status"),
        flag("saved_p").not_null(),
        col("slug"),
    ],
    &[cascade("repository", "repository")],
);

const PULLREQ_POST: TableSpec = entity(
    "pullreq_post",
    &[
        owner("class"),
        key(),
        owner("pullreq"),
        col("number"),
        col("author"),
        col("created"),
        col("updated"),
        col("body"),
        relation("edits"),
        relation("reactions"),
    ],
    &[cascade("pullreq", "pullreq")],
);

const DISCUSSION_CATEGORY: TableSpec = entity(
    "discussion_category",
    &[
        owner("repository"),
        key(),
        col("number"),
        col("name"),
        col("emoji"),
        col("answerable_p"),
        col("description"),
    ],
    &[cascade("repository", "repository")],
);

const DISCUSSION: TableSpec = entity(
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
        flag("saved_p").not_null(),
        relation("marks"),
        col("slug"),
    ],
    &[cascade("repository", "repository")],
);

const DISCUSSION_POST: TableSpec = entity(
    "discussion_post",
    &[
        owner("class"),
        key(),
        owner("discussion"),
        col("number"),
        col("author"),
        col("created"),
        col("updated"),
        col("body"),
        relation("edits"),
        relation("reactions"),
        relation("replies"),
    ],
    &[cascade("discussion", "discussion")],
);

const DISCUSSION_REPLY: TableSpec = entity(
    "discussion_reply",
    &[
        owner("class"),
        key(),
        owner("post"),
        owner("discussion"),
        col("number"),
        col("author"),
        col("created"),
        col("updated"),
        col("body"),
        relation("edits"),
        relation("reactions"),
    ],
    &[
        cascade("post", "discussion_post"),
        cascade("discussion", "discussion"),
    ],
);

const NOTIFICATION: TableSpec = entity(
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
        col("status"),
        flag("saved_p").not_null(),
    ],
    &[cascade("repository", "repository")],
);

const ISSUE_LABEL: TableSpec = join(
    "issue_label",
    &[owner("issue"), owner("id")],
    &[cascade("issue", "issue"), cascade("id", "label")],
);

const ISSUE_MARK: TableSpec = join(
    "issue_mark",
    &[owner("issue"), owner("id")],
    &[cascade("issue", "issue"), cascade("id", "mark")],
);

const ISSUE_ASSIGNEE: TableSpec = join(
    "issue_assignee",
    &[owner("issue"), owner("id")],
    &[cascade("issue", "issue"), cascade("id", "assignee")],
);

const PULLREQ_LABEL: TableSpec = join(
    "pullreq_label",
    &[owner("pullreq"), owner("id")],
    &[cascade("pullreq", "pullreq"), cascade("id", "label")],
);

const PULLREQ_MARK: TableSpec = join(
    "pullreq_mark",
    &[owner("pullreq"), owner("id")],
    &[cascade("pullreq", "pullreq"), cascade("id", "mark")],
);

const PULLREQ_ASSIGNEE: TableSpec = join(
    "pullreq_assignee",
    &[owner("pullreq"), owner("id")],
    &[cascade("pullreq", "pullreq"), cascade("id", "assignee")],
);

const PULLREQ_REVIEW_REQUEST: TableSpec = join(
    "pullreq_review_request",
    &[owner("pullreq"), owner("id")],
    &[cascade("pullreq", "pullreq"), cascade("id", "assignee")],
);

const DISCUSSION_LABEL: TableSpec = join(
    "discussion_label",
    &[owner("discussion"), owner("id")],
    &[cascade("discussion", "discussion"), cascade("id", "label")],
);

const DISCUSSION_MARK: TableSpec = join(
    "discussion_mark",
    &[owner("discussion"), owner("id")],
    &[cascade("discussion", "discussion"), cascade("id", "mark")],
);

/// Every table of the current schema, parents before children.
pub static TABLES: &[TableSpec] = &[
    REPOSITORY,
    LABEL,
    ASSIGNEE,
    MARK,
    MILESTONE,
    FORK,
    ISSUE,
    ISSUE_POST,
    PULLREQ,
    PULLREQ_POST,
    DISCUSSION_CATEGORY,
    DISCUSSION,
    DISCUSSION_POST,
    DISCUSSION_REPLY,
    NOTIFICATION,
    ISSUE_LABEL,
    ISSUE_MARK,
    ISSUE_ASSIGNEE,
    PULLREQ_LABEL,
    PULLREQ_MARK,
    PULLREQ_ASSIGNEE,
    PULLREQ_REVIEW_REQUEST,
    DISCUSSION_LABEL,
    DISCUSSION_MARK,
];

#[must_use]
pub fn table(name: &str) -> Option<&'static TableSpec> {
    TABLES.iter().find(|t| t.name == name)
}

/// Looks up a declared table, treating a missing one as a registry defect.
pub fn declared_table(name: &str) -> Result<&'static TableSpec> {
    table(name).ok_or_else(|| Error::InvalidSchema(format!("table `{name}` is not declared")))
}

pub fn declared_column(table: &str, column: &str) -> Result<&'static ColumnSpec> {
    declared_table(table)?
        .columns
        .iter()
        .find(|c| c.name == column)
        .ok_or_else(|| Error::InvalidSchema(format!("column `{table}.{column}` is not declared")))
}

/// Checks the current registry.
pub fn validate() -> Result<()> {
    validate_tables(TABLES)
}

/// Checks a set of table declarations for internal consistency.
pub fn validate_tables(tables: &[TableSpec]) -> Result<()> {
    let mut names = HashSet::new();
    for spec in tables {
        if !names.insert(spec.name) {
            return Err(Error::InvalidSchema(format!(
                "table `{}` is declared twice",
                spec.name
            )));
        }
    }

    for spec in tables {
        let mut columns = HashSet::new();
        for column in spec.columns {
            if !columns.insert(column.name) {
                return Err(Error::InvalidSchema(format!(
                    "column `{}.{}` is declared twice",
                    spec.name, column.name
                )));
            }
        }

        match spec.kind {
            TableKind::Entity => {
                let keys = spec.columns.iter().filter(|c| c.primary_key).count();
                if keys != 1 {
                    return Err(Error::InvalidSchema(format!(
                        "table `{}` declares {keys} primary key columns",
                        spec.name
                    )));
                }
                if !spec.columns.get(1).is_some_and(|c| c.primary_key) {
                    return Err(Error::InvalidSchema(format!(
                        "table `{}` must declare its primary key as the second column",
                        spec.name
                    )));
                }
            }
            TableKind::Join => {
                if spec.columns.len() != 2 || spec.columns.iter().any(|c| c.primary_key) {
                    return Err(Error::InvalidSchema(format!(
                        "join table `{}` must have exactly two non-key columns",
                        spec.name
                    )));
                }
                for column in spec.columns {
                    let covered = spec
                        .foreign_keys
                        .iter()
                        .any(|fk| fk.column == column.name && fk.on_delete == OnDelete::Cascade);
                    if !covered {
                        return Err(Error::InvalidSchema(format!(
                            "join column `{}.{}` needs a cascading foreign key",
                            spec.name, column.name
                        )));
                    }
                }
            }
        }

        for fk in spec.foreign_keys {
            if spec.column(fk.column).is_none() {
                return Err(Error::InvalidSchema(format!(
                    "foreign key on `{}` names unknown column `{}`",
                    spec.name, fk.column
                )));
            }
            let target = tables
                .iter()
                .find(|t| t.name == fk.references)
                .ok_or_else(|| {
                    Error::InvalidSchema(format!(
                        "foreign key `{}.{}` references undeclared table `{}`",
                        spec.name, fk.column, fk.references
                    ))
                })?;
            if !target
                .column(fk.target_column)
                .is_some_and(|c| c.primary_key)
            {
                return Err(Error::InvalidSchema(format!(
                    "foreign key `{}.{}` must reference the primary key of `{}`",
                    spec.name, fk.column, fk.references
                )));
            }
        }
    }

    Ok(())
}
