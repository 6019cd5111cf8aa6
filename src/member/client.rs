use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::BoxFuture;

pub type MemberId = u64;

/// One entry of the cluster's membership list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    /// Empty until the member process has started and published its name.
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
    pub is_learner: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberListResponse {
    /// The member that served the request.
    pub member_id: MemberId,
    pub members: Vec<Member>,
}

/// How far a learner has replicated relative to the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplicationProgress {
    pub leader_index: u64,
    pub member_applied_index: u64,
}

impl ReplicationProgress {
    pub fn lag(&self) -> u64 {
        self.leader_index.saturating_sub(self.member_applied_index)
    }
}

/// Failure of a membership RPC, classified so callers can tell idempotent races from real errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterApiError {
    /// A member with the requested peer URLs already exists.
    MemberExists,
    MemberNotFound,
    /// Promotion refused: the learner is not in sync with the leader yet.
    LearnerNotReady,
    /// Promotion refused: the member is not a learner (already voting).
    NotLearner,
    Transport { endpoint: String, message: String },
    Rejected { status: u16, message: String },
}

impl fmt::Display for ClusterApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemberExists => write!(f, "member already exists"),
            Self::MemberNotFound => write!(f, "member not found"),
            Self::LearnerNotReady => write!(f, "learner is not in sync with leader"),
            Self::NotLearner => write!(f, "member is not a learner"),
            Self::Transport { endpoint, message } => {
                write!(f, "transport error ({endpoint}): {message}")
            }
            Self::Rejected { status, message } => write!(f, "rejected ({status}): {message}"),
        }
    }
}

impl std::error::Error for ClusterApiError {}

/// The cluster's membership API.
///
/// Mutations are serialized by the cluster itself, so implementations need no client-side
/// locking.
pub trait ClusterClient: Send + Sync + 'static {
    fn member_list(&self) -> BoxFuture<'_, Result<MemberListResponse, ClusterApiError>>;

    fn member_add_as_learner(
        &self,
        peer_urls: Vec<String>,
    ) -> BoxFuture<'_, Result<Member, ClusterApiError>>;

    fn member_update(
        &self,
        id: MemberId,
        peer_urls: Vec<String>,
    ) -> BoxFuture<'_, Result<(), ClusterApiError>>;

    fn member_promote(&self, id: MemberId) -> BoxFuture<'_, Result<(), ClusterApiError>>;
}

/// Catch-up signal used to gate learner promotion.
pub trait ProgressSource: Send + Sync + 'static {
    fn replication_progress<'a>(
        &'a self,
        member: &'a Member,
    ) -> BoxFuture<'a, Result<ReplicationProgress, ClusterApiError>>;
}

/// Produces a fresh connection handle to the cluster.
pub trait ClusterClientFactory: Send + Sync + 'static {
    fn new_cluster(&self) -> Result<Arc<dyn ClusterClient>, ClusterApiError>;
}
