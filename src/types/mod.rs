mod id;
mod models;
mod relation;
mod state;

pub use id::derive_id;
pub use models::*;
pub use relation::{Relation, UNFETCHED};
pub use state::{
    Condition, DiscussionState, IssueState, PullReqState, RepositoryClass, Status, TopicKind,
};
