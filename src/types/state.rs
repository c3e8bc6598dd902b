use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Declares an enumeration stored in the database as one of a fixed set of
/// strings. Unknown stored strings are a conversion error, never a fallback.
macro_rules! stored_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let raw = value.as_str()?;
                $name::parse(raw).ok_or_else(|| {
                    FromSqlError::Other(
                        format!("unknown {} `{raw}`", stringify!($name)).into(),
                    )
                })
            }
        }
    };
}

stored_enum! {
    /// Which forge flavor a repository row belongs to, stored in its `class`.
    RepositoryClass {
        Github => "forge-github-repository",
        Gitlab => "forge-gitlab-repository",
        Gitea => "forge-gitea-repository",
        Gogs => "forge-gogs-repository",
        Bitbucket => "forge-bitbucket-repository",
        SemiNoapi => "forge-semi-noapi-repository",
        Noapi => "forge-noapi-repository",
    }
}

stored_enum! {
    /// How much of a repository the user follows.
    Condition {
        Known => ":known",
        Stub => ":stub",
        Tracked => ":tracked",
    }
}

stored_enum! {
    /// Triage status of a topic or notification.
    Status {
        Unread => "unread",
        Pending => "pending",
        Done => "done",
    }
}

stored_enum! {
    IssueState {
        Open => "open",
        Completed => "completed",
        Unplanned => "unplanned",
    }
}

stored_enum! {
    PullReqState {
        Open => "open",
        Merged => "merged",
        Rejected => "rejected",
    }
}

stored_enum! {
    DiscussionState {
        Open => "open",
        Completed => "completed",
        Outdated => "outdated",
        Duplicate => "duplicate",
    }
}

/// The kinds of numbered topics a repository holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Issue,
    PullReq,
    Discussion,
}

impl RepositoryClass {
    #[must_use]
    pub const fn is_gitlab(self) -> bool {
        matches!(self, RepositoryClass::Gitlab)
    }

    /// Whether topics of this repository can be fetched over an API at all.
    #[must_use]
    pub const fn has_api(self) -> bool {
        !matches!(self, RepositoryClass::SemiNoapi | RepositoryClass::Noapi)
    }

    /// Prefix used when referring to a topic by number, e.g. `#12` or `!12`.
    #[must_use]
    pub const fn slug_prefix(self, kind: TopicKind) -> &'static str {
        match kind {
            TopicKind::PullReq if self.is_gitlab() => "!",
            _ => "#",
        }
    }

    #[must_use]
    pub fn slug(self, kind: TopicKind, number: i64) -> String {
        format!("{}{}", self.slug_prefix(kind), number)
    }
}
