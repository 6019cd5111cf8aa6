//! Member Control: drives this process's cluster membership through
//! `NotMember -> Learner -> Voting` without ever promoting a learner that has not caught up.
//!
//! Every operation is a single idempotent step. Retry cadence belongs to the caller
//! (see [`crate::join`]); nothing here sleeps or loops.

pub mod client;
pub mod http;
#[cfg(test)]
pub(crate) mod testing;

pub use client::{
    ClusterApiError, ClusterClient, ClusterClientFactory, Member, MemberId, MemberListResponse,
    ProgressSource, ReplicationProgress,
};
pub use crate::identity::MemberIdentity;

use std::{fmt, future::Future, sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{debug, info};

use crate::context::{Cancelled, Ctx};

#[derive(Debug)]
pub enum MemberError {
    Configuration {
        reason: String,
    },
    MembershipApi {
        op: &'static str,
        member: String,
        source: ClusterApiError,
    },
    NotInCluster {
        member: String,
    },
    LearnerNotCaughtUp {
        member: String,
        progress: Option<ReplicationProgress>,
    },
    Cancelled(Cancelled),
}

impl MemberError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MembershipApi { .. } | Self::NotInCluster { .. } | Self::LearnerNotCaughtUp { .. }
        )
    }
}

impl fmt::Display for MemberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { reason } => write!(f, "member configuration error: {reason}"),
            Self::MembershipApi { op, member, source } => {
                write!(f, "membership api {op} for {member}: {source}")
            }
            Self::NotInCluster { member } => write!(f, "member {member} is not in the cluster"),
            Self::LearnerNotCaughtUp {
                member,
                progress: Some(p),
            } => write!(
                f,
                "learner {member} has not caught up (applied {} of {}, lag {})",
                p.member_applied_index,
                p.leader_index,
                p.lag()
            ),
            Self::LearnerNotCaughtUp {
                member,
                progress: None,
            } => write!(f, "learner {member} has not caught up"),
            Self::Cancelled(e) => write!(f, "member control {e}"),
        }
    }
}

impl std::error::Error for MemberError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MembershipApi { source, .. } => Some(source),
            Self::Cancelled(e) => Some(e),
            Self::Configuration { .. }
            | Self::NotInCluster { .. }
            | Self::LearnerNotCaughtUp { .. } => None,
        }
    }
}

impl From<Cancelled> for MemberError {
    fn from(value: Cancelled) -> Self {
        Self::Cancelled(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MemberState {
    NotMember,
    Learner { id: MemberId },
    Voting { id: MemberId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Promotion {
    Promoted,
    AlreadyVoting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberControlOptions {
    /// Upper bound for each operation, all of its RPCs included.
    pub request_timeout: Duration,
    /// Largest leader/learner log distance at which promotion is attempted.
    pub max_learner_lag: u64,
}

impl Default for MemberControlOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_learner_lag: 1000,
        }
    }
}

pub struct MemberControl {
    clients: Arc<dyn ClusterClientFactory>,
    progress: Arc<dyn ProgressSource>,
    identity: MemberIdentity,
    options: MemberControlOptions,
}

impl MemberControl {
    pub fn new(
        clients: Arc<dyn ClusterClientFactory>,
        progress: Arc<dyn ProgressSource>,
        identity: MemberIdentity,
        options: MemberControlOptions,
    ) -> Self {
        Self {
            clients,
            progress,
            identity,
            options,
        }
    }

    pub fn identity(&self) -> &MemberIdentity {
        &self.identity
    }

    pub async fn is_member_in_cluster(&self, ctx: &Ctx) -> Result<bool, MemberError> {
        let ctx = ctx.with_timeout(self.options.request_timeout);
        let client = self.client()?;
        Ok(self.find_self(&ctx, client.as_ref()).await?.is_some())
    }

    /// Add this process as a learner. An existing entry for the same peer URLs counts as success.
    pub async fn add_member_as_learner(&self, ctx: &Ctx) -> Result<(), MemberError> {
        let ctx = ctx.with_timeout(self.options.request_timeout);
        let client = self.client()?;
        let op = "member_add_as_learner";
        match rpc(&ctx, op, client.member_add_as_learner(self.identity.peer_urls.clone())).await? {
            Ok(added) => {
                info!(
                    member = %self.identity.name,
                    member_id = added.id,
                    peer_urls = ?self.identity.peer_urls,
                    "added member as learner"
                );
                Ok(())
            }
            Err(ClusterApiError::MemberExists) => {
                info!(member = %self.identity.name, "learner add: member already exists");
                Ok(())
            }
            Err(source) => Err(self.api_err(op, source)),
        }
    }

    pub async fn is_learner_present(&self, ctx: &Ctx) -> Result<bool, MemberError> {
        let ctx = ctx.with_timeout(self.options.request_timeout);
        let client = self.client()?;
        Ok(self
            .find_self(&ctx, client.as_ref())
            .await?
            .is_some_and(|m| m.is_learner))
    }

    pub async fn member_state(&self, ctx: &Ctx) -> Result<MemberState, MemberError> {
        let ctx = ctx.with_timeout(self.options.request_timeout);
        let client = self.client()?;
        Ok(match self.find_self(&ctx, client.as_ref()).await? {
            None => MemberState::NotMember,
            Some(m) if m.is_learner => MemberState::Learner { id: m.id },
            Some(m) => MemberState::Voting { id: m.id },
        })
    }

    /// Promote this learner to a voting member once its replication lag is within bounds.
    pub async fn promote_member(&self, ctx: &Ctx) -> Result<Promotion, MemberError> {
        let ctx = ctx.with_timeout(self.options.request_timeout);
        let client = self.client()?;
        let member = self
            .find_self(&ctx, client.as_ref())
            .await?
            .ok_or_else(|| MemberError::NotInCluster {
                member: self.identity.name.clone(),
            })?;

        if !member.is_learner {
            debug!(member = %self.identity.name, member_id = member.id, "promote: already voting");
            return Ok(Promotion::AlreadyVoting);
        }

        let op = "replication_progress";
        let progress = rpc(&ctx, op, self.progress.replication_progress(&member))
            .await?
            .map_err(|source| self.api_err(op, source))?;
        if progress.lag() > self.options.max_learner_lag {
            debug!(
                member = %self.identity.name,
                leader_index = progress.leader_index,
                applied_index = progress.member_applied_index,
                max_lag = self.options.max_learner_lag,
                "promote: learner still catching up"
            );
            return Err(MemberError::LearnerNotCaughtUp {
                member: self.identity.name.clone(),
                progress: Some(progress),
            });
        }

        let op = "member_promote";
        match rpc(&ctx, op, client.member_promote(member.id)).await? {
            Ok(()) => {
                info!(
                    member = %self.identity.name,
                    member_id = member.id,
                    applied_index = progress.member_applied_index,
                    "promoted learner to voting member"
                );
                Ok(Promotion::Promoted)
            }
            Err(ClusterApiError::NotLearner) => {
                info!(member = %self.identity.name, "promote: member already voting");
                Ok(Promotion::AlreadyVoting)
            }
            Err(ClusterApiError::LearnerNotReady) => Err(MemberError::LearnerNotCaughtUp {
                member: self.identity.name.clone(),
                progress: Some(progress),
            }),
            Err(source) => Err(self.api_err(op, source)),
        }
    }

    /// Apply one step of the membership state machine and report where it ended up.
    ///
    /// A learner that has not caught up yet is reported as `Learner`, not as an error.
    pub async fn reconcile(&self, ctx: &Ctx) -> Result<MemberState, MemberError> {
        match self.member_state(ctx).await? {
            MemberState::NotMember => {
                self.add_member_as_learner(ctx).await?;
                self.member_state(ctx).await
            }
            MemberState::Learner { id } => match self.promote_member(ctx).await {
                Ok(_) => Ok(MemberState::Voting { id }),
                Err(MemberError::LearnerNotCaughtUp { .. }) => Ok(MemberState::Learner { id }),
                Err(e) => Err(e),
            },
            voting @ MemberState::Voting { .. } => Ok(voting),
        }
    }

    /// Correct the peer URLs recorded for this member if they differ from the advertised ones.
    ///
    /// The entry is found by name. The member that served the list request is used instead only
    /// when it carries no name, since a named serving member is some other peer.
    pub async fn update_member_peer_url(
        &self,
        ctx: &Ctx,
        client: &dyn ClusterClient,
    ) -> Result<(), MemberError> {
        let ctx = ctx.with_timeout(self.options.request_timeout);
        let list = self.list(&ctx, client).await?;

        let by_name = (!self.identity.name.is_empty())
            .then(|| list.members.iter().find(|m| m.name == self.identity.name))
            .flatten();
        let serving = || {
            list.members
                .iter()
                .find(|m| m.id == list.member_id)
                .filter(|m| m.name.is_empty() || m.name == self.identity.name)
        };
        let member = by_name
            .or_else(serving)
            .ok_or_else(|| MemberError::NotInCluster {
                member: self.identity.name.clone(),
            })?;

        if self.identity.same_peer_urls(&member.peer_urls) {
            debug!(member = %self.identity.name, member_id = member.id, "peer urls up to date");
            return Ok(());
        }

        let op = "member_update";
        rpc(
            &ctx,
            op,
            client.member_update(member.id, self.identity.peer_urls.clone()),
        )
        .await?
        .map_err(|source| self.api_err(op, source))?;
        info!(
            member = %self.identity.name,
            member_id = member.id,
            old = ?member.peer_urls,
            new = ?self.identity.peer_urls,
            "updated member peer urls"
        );
        Ok(())
    }

    fn client(&self) -> Result<Arc<dyn ClusterClient>, MemberError> {
        self.clients
            .new_cluster()
            .map_err(|source| self.api_err("new_cluster", source))
    }

    async fn list(
        &self,
        ctx: &Ctx,
        client: &dyn ClusterClient,
    ) -> Result<MemberListResponse, MemberError> {
        let op = "member_list";
        rpc(ctx, op, client.member_list())
            .await?
            .map_err(|source| self.api_err(op, source))
    }

    async fn find_self(
        &self,
        ctx: &Ctx,
        client: &dyn ClusterClient,
    ) -> Result<Option<Member>, MemberError> {
        let list = self.list(ctx, client).await?;
        Ok(list
            .members
            .into_iter()
            .find(|m| self.identity.matches(m)))
    }

    fn api_err(&self, op: &'static str, source: ClusterApiError) -> MemberError {
        MemberError::MembershipApi {
            op,
            member: self.identity.name.clone(),
            source,
        }
    }
}

/// Run one RPC under `ctx`, keeping the cluster's answer unclassified for the caller.
async fn rpc<T>(
    ctx: &Ctx,
    op: &'static str,
    fut: impl Future<Output = Result<T, ClusterApiError>>,
) -> Result<Result<T, ClusterApiError>, MemberError> {
    ctx.run(op, async { Ok(fut.await) }).await
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::member::testing::{Call, FakeCluster, PEER, control, identity, voter};

    #[tokio::test]
    async fn never_added_identity_is_not_in_cluster() {
        let cluster = FakeCluster::with_members(vec![voter(1, "etcd-0")]);
        let mc = control(&cluster);
        assert!(!mc.is_member_in_cluster(&Ctx::background()).await.unwrap());
        assert!(!mc.is_learner_present(&Ctx::background()).await.unwrap());
        assert_eq!(
            mc.member_state(&Ctx::background()).await.unwrap(),
            MemberState::NotMember
        );
        assert_eq!(cluster.mutations(), Vec::<Call>::new());
    }

    #[tokio::test]
    async fn add_as_learner_twice_is_idempotent() {
        let cluster = FakeCluster::with_members(vec![voter(1, "etcd-0")]);
        let mc = control(&cluster);
        let ctx = Ctx::background();

        mc.add_member_as_learner(&ctx).await.unwrap();
        assert!(mc.is_learner_present(&ctx).await.unwrap());
        assert!(mc.is_member_in_cluster(&ctx).await.unwrap());

        mc.add_member_as_learner(&ctx).await.unwrap();
        assert!(mc.is_learner_present(&ctx).await.unwrap());

        assert_eq!(
            cluster.mutations(),
            vec![
                Call::AddLearner(vec![PEER.to_string()]),
                Call::AddLearner(vec![PEER.to_string()]),
            ]
        );
        assert_eq!(cluster.state.lock().unwrap().members.len(), 2);
    }

    #[tokio::test]
    async fn add_as_learner_surfaces_other_failures() {
        struct Broken;
        impl ClusterClientFactory for Broken {
            fn new_cluster(&self) -> Result<Arc<dyn ClusterClient>, ClusterApiError> {
                Err(ClusterApiError::Transport {
                    endpoint: "http://127.0.0.1:2379".to_string(),
                    message: "connection refused".to_string(),
                })
            }
        }
        let cluster = FakeCluster::with_members(vec![]);
        let mc = MemberControl::new(
            Arc::new(Broken),
            cluster,
            identity(),
            MemberControlOptions::default(),
        );
        let err = mc.add_member_as_learner(&Ctx::background()).await.unwrap_err();
        assert!(matches!(err, MemberError::MembershipApi { op: "new_cluster", .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn empty_cluster_to_voting_member() {
        let cluster = FakeCluster::with_members(vec![]);
        let mc = control(&cluster);
        let ctx = Ctx::background();

        mc.add_member_as_learner(&ctx).await.unwrap();
        assert!(mc.is_learner_present(&ctx).await.unwrap());

        cluster.set_progress(500, 20);
        let err = mc.promote_member(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            MemberError::LearnerNotCaughtUp {
                progress: Some(ReplicationProgress {
                    leader_index: 500,
                    member_applied_index: 20
                }),
                ..
            }
        ));
        assert!(mc.is_learner_present(&ctx).await.unwrap());

        cluster.set_progress(500, 495);
        assert_eq!(mc.promote_member(&ctx).await.unwrap(), Promotion::Promoted);
        assert!(!mc.is_learner_present(&ctx).await.unwrap());
        assert!(mc.is_member_in_cluster(&ctx).await.unwrap());

        assert_eq!(
            mc.promote_member(&ctx).await.unwrap(),
            Promotion::AlreadyVoting
        );
        assert_eq!(
            cluster.mutations(),
            vec![Call::AddLearner(vec![PEER.to_string()]), Call::Promote(101)]
        );
    }

    #[tokio::test]
    async fn promote_maps_cluster_refusal_to_not_caught_up() {
        let cluster = FakeCluster::with_members(vec![]);
        let mc = control(&cluster);
        let ctx = Ctx::background();
        mc.add_member_as_learner(&ctx).await.unwrap();

        // Within our lag bound but below the fake cluster's 90% rule.
        cluster.set_progress(50, 41);
        let err = mc.promote_member(&ctx).await.unwrap_err();
        assert!(matches!(err, MemberError::LearnerNotCaughtUp { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn promote_requires_membership_and_progress() {
        let cluster = FakeCluster::with_members(vec![]);
        let mc = control(&cluster);
        let ctx = Ctx::background();

        let err = mc.promote_member(&ctx).await.unwrap_err();
        assert!(matches!(err, MemberError::NotInCluster { .. }));

        mc.add_member_as_learner(&ctx).await.unwrap();
        let err = mc.promote_member(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            MemberError::MembershipApi {
                op: "replication_progress",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn reconcile_steps_through_the_state_machine() {
        let cluster = FakeCluster::with_members(vec![voter(1, "etcd-0")]);
        let mc = control(&cluster);
        let ctx = Ctx::background();

        assert_eq!(
            mc.reconcile(&ctx).await.unwrap(),
            MemberState::Learner { id: 101 }
        );

        cluster.set_progress(100, 0);
        assert_eq!(
            mc.reconcile(&ctx).await.unwrap(),
            MemberState::Learner { id: 101 }
        );

        cluster.set_progress(100, 100);
        assert_eq!(
            mc.reconcile(&ctx).await.unwrap(),
            MemberState::Voting { id: 101 }
        );
        assert_eq!(
            mc.reconcile(&ctx).await.unwrap(),
            MemberState::Voting { id: 101 }
        );
        assert_eq!(
            cluster.mutations(),
            vec![Call::AddLearner(vec![PEER.to_string()]), Call::Promote(101)]
        );
    }

    #[tokio::test]
    async fn update_peer_url_issues_one_update_when_stale() {
        let mut stale = voter(7, "etcd-1");
        stale.peer_urls = vec!["http://10.0.0.7:2380".to_string()];
        let cluster = FakeCluster::with_members(vec![voter(1, "etcd-0"), stale]);
        let mc = control(&cluster);

        mc.update_member_peer_url(&Ctx::background(), cluster.as_ref())
            .await
            .unwrap();
        assert_eq!(
            cluster.mutations(),
            vec![Call::Update(7, vec![PEER.to_string()])]
        );

        mc.update_member_peer_url(&Ctx::background(), cluster.as_ref())
            .await
            .unwrap();
        assert_eq!(cluster.mutations().len(), 1);
    }

    #[tokio::test]
    async fn update_peer_url_is_noop_when_matching() {
        let mut current = voter(7, "etcd-1");
        current.peer_urls = vec![format!("{PEER}/")];
        let cluster = FakeCluster::with_members(vec![current]);
        let mc = control(&cluster);

        mc.update_member_peer_url(&Ctx::background(), cluster.as_ref())
            .await
            .unwrap();
        assert_eq!(cluster.mutations(), Vec::<Call>::new());
        assert_eq!(cluster.calls(), vec![Call::List]);
    }

    #[tokio::test]
    async fn update_peer_url_falls_back_to_unnamed_serving_member() {
        let serving = Member {
            id: 1111,
            peer_urls: vec!["http://10.0.0.11:2380".to_string()],
            ..Default::default()
        };
        let cluster = FakeCluster::with_members(vec![serving, voter(1112, "etcd-main-1")]);
        let mc = control(&cluster);

        mc.update_member_peer_url(&Ctx::background(), cluster.as_ref())
            .await
            .unwrap();
        assert_eq!(
            cluster.mutations(),
            vec![Call::Update(1111, vec![PEER.to_string()])]
        );
    }

    #[tokio::test]
    async fn update_peer_url_never_rewrites_another_named_member() {
        let cluster = FakeCluster::with_members(vec![voter(1, "etcd-0"), voter(2, "etcd-2")]);
        let mc = control(&cluster);

        let err = mc
            .update_member_peer_url(&Ctx::background(), cluster.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, MemberError::NotInCluster { .. }));
        assert_eq!(cluster.mutations(), Vec::<Call>::new());
        assert_eq!(
            cluster.state.lock().unwrap().members[0].peer_urls,
            vec!["http://etcd-0.etcd-peer.default.svc:2380".to_string()]
        );
    }

    #[tokio::test]
    async fn update_peer_url_failure_is_membership_api_error() {
        let mut stale = voter(7, "etcd-1");
        stale.peer_urls = vec!["http://10.0.0.7:2380".to_string()];
        let cluster = FakeCluster::with_members(vec![stale]);
        cluster.state.lock().unwrap().fail_update = true;
        let mc = control(&cluster);

        let err = mc
            .update_member_peer_url(&Ctx::background(), cluster.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MemberError::MembershipApi {
                op: "member_update",
                source: ClusterApiError::Transport { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn update_peer_url_without_any_match_is_not_in_cluster() {
        let cluster = FakeCluster::with_members(vec![]);
        let mc = control(&cluster);
        let err = mc
            .update_member_peer_url(&Ctx::background(), cluster.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, MemberError::NotInCluster { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_cluster_hits_the_request_timeout() {
        let cluster = FakeCluster::with_members(vec![]);
        cluster.state.lock().unwrap().hang_list = true;
        let mc = control(&cluster);

        let err = mc
            .is_member_in_cluster(&Ctx::background())
            .await
            .unwrap_err();
        assert!(
            matches!(&err, MemberError::Cancelled(c) if c.op == "member_list"),
            "err={err}"
        );
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn cancelled_context_stops_before_any_call() {
        let cluster = FakeCluster::with_members(vec![]);
        let mc = control(&cluster);
        let ctx = Ctx::background();
        ctx.cancel();

        let err = mc.add_member_as_learner(&ctx).await.unwrap_err();
        assert!(matches!(err, MemberError::Cancelled(_)));
        assert_eq!(cluster.calls(), Vec::<Call>::new());
    }
}
