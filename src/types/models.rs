use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    Condition, DiscussionState, IssueState, PullReqState, Relation, RepositoryClass, Status,
};

/// A tracked forge project; the root every other record hangs off.
///
/// Relation fields reflect what is stored; upserts never write them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub class: RepositoryClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forge_id: Option<String>,
    pub forge: String,
    pub owner: String,
    pub name: String,
    pub apihost: String,
    pub githost: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    pub condition: Condition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
    pub selective_p: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pullreqs_until: Option<DateTime<Utc>>,
    pub discussions_p: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discussions_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub issues: Relation<String>,
    #[serde(default)]
    pub pullreqs: Relation<String>,
    #[serde(default)]
    pub labels: Relation<String>,
    #[serde(default)]
    pub milestones: Relation<String>,
    #[serde(default)]
    pub discussions: Relation<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub repository: String,
    pub number: i64,
    pub state: IssueState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub title: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed: Option<DateTime<Utc>>,
    pub status: Status,
    pub locked_p: bool,
    pub saved_p: bool,
    /// Id of the milestone row, not its title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default)]
    pub labels: Relation<String>,
    #[serde(default)]
    pub assignees: Relation<String>,
    #[serde(default)]
    pub posts: Relation<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullReq {
    pub id: String,
    pub repository: String,
    pub number: i64,
    pub state: PullReqState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub title: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<DateTime<Utc>>,
    pub status: Status,
    pub locked_p: bool,
    pub draft_p: bool,
    pub saved_p: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_rev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_rev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default)]
    pub labels: Relation<String>,
    #[serde(default)]
    pub review_requests: Relation<String>,
}

/// A comment on an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuePost {
    pub id: String,
    pub issue: String,
    pub number: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub repository: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A user-defined marker; never fetched from the forge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mark {
    pub id: String,
    pub repository: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub repository: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<i64>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discussion {
    pub id: String,
    pub repository: String,
    pub number: i64,
    pub state: DiscussionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub title: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed: Option<DateTime<Utc>>,
    pub status: Status,
    pub locked_p: bool,
    pub saved_p: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Id of the post marked as the answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub upvotes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default)]
    pub labels: Relation<String>,
    #[serde(default)]
    pub posts: Relation<String>,
    #[serde(default)]
    pub marks: Relation<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionPost {
    pub id: String,
    pub discussion: String,
    pub number: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub replies: Relation<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionReply {
    pub id: String,
    pub post: String,
    pub discussion: String,
    pub number: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub repository: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Kind of topic the notification is about (`issue`, `pullreq`, ...).
    pub kind: String,
    /// Id of the topic, when it is stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_read: Option<DateTime<Utc>>,
    pub updated: DateTime<Utc>,
    pub status: Status,
    pub saved_p: bool,
}
