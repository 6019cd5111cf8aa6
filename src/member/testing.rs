//! In-memory cluster used by membership and join tests.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    BoxFuture,
    member::{
        ClusterApiError, ClusterClient, ClusterClientFactory, Member, MemberControl,
        MemberControlOptions, MemberId, MemberIdentity, MemberListResponse, ProgressSource,
        ReplicationProgress,
    },
};

pub(crate) const PEER: &str = "http://etcd-1.etcd-peer.default.svc:2380";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    List,
    AddLearner(Vec<String>),
    Update(MemberId, Vec<String>),
    Promote(MemberId),
}

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub(crate) next_id: MemberId,
    pub(crate) header_member_id: MemberId,
    pub(crate) members: Vec<Member>,
    pub(crate) calls: Vec<Call>,
    pub(crate) progress: Option<ReplicationProgress>,
    pub(crate) fail_update: bool,
    pub(crate) hang_list: bool,
}

/// In-memory cluster with etcd's membership rules.
#[derive(Debug, Default)]
pub(crate) struct FakeCluster {
    pub(crate) state: Mutex<FakeState>,
}

impl FakeCluster {
    pub(crate) fn with_members(members: Vec<Member>) -> Arc<Self> {
        let cluster = Arc::new(Self::default());
        {
            let mut s = cluster.state.lock().unwrap();
            s.next_id = 100;
            s.header_member_id = members.first().map(|m| m.id).unwrap_or_default();
            s.members = members;
        }
        cluster
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| *c != Call::List)
            .collect()
    }

    pub(crate) fn set_progress(&self, leader_index: u64, member_applied_index: u64) {
        self.state.lock().unwrap().progress = Some(ReplicationProgress {
            leader_index,
            member_applied_index,
        });
    }
}

impl ClusterClient for FakeCluster {
    fn member_list(&self) -> BoxFuture<'_, Result<MemberListResponse, ClusterApiError>> {
        Box::pin(async move {
            let hang = {
                let mut s = self.state.lock().unwrap();
                s.calls.push(Call::List);
                s.hang_list
            };
            if hang {
                std::future::pending::<()>().await;
            }
            let s = self.state.lock().unwrap();
            Ok(MemberListResponse {
                member_id: s.header_member_id,
                members: s.members.clone(),
            })
        })
    }

    fn member_add_as_learner(
        &self,
        peer_urls: Vec<String>,
    ) -> BoxFuture<'_, Result<Member, ClusterApiError>> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.calls.push(Call::AddLearner(peer_urls.clone()));
            if s
                .members
                .iter()
                .any(|m| m.peer_urls.iter().any(|u| peer_urls.contains(u)))
            {
                return Err(ClusterApiError::MemberExists);
            }
            s.next_id += 1;
            let member = Member {
                id: s.next_id,
                name: String::new(),
                peer_urls,
                client_urls: Vec::new(),
                is_learner: true,
            };
            s.members.push(member.clone());
            Ok(member)
        })
    }

    fn member_update(
        &self,
        id: MemberId,
        peer_urls: Vec<String>,
    ) -> BoxFuture<'_, Result<(), ClusterApiError>> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.calls.push(Call::Update(id, peer_urls.clone()));
            if s.fail_update {
                return Err(ClusterApiError::Transport {
                    endpoint: "fake".to_string(),
                    message: "connection reset".to_string(),
                });
            }
            let member = s
                .members
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or(ClusterApiError::MemberNotFound)?;
            member.peer_urls = peer_urls;
            Ok(())
        })
    }

    fn member_promote(&self, id: MemberId) -> BoxFuture<'_, Result<(), ClusterApiError>> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.calls.push(Call::Promote(id));
            let progress = s.progress;
            let member = s
                .members
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or(ClusterApiError::MemberNotFound)?;
            if !member.is_learner {
                return Err(ClusterApiError::NotLearner);
            }
            if progress.is_none_or(|p| p.member_applied_index < p.leader_index * 9 / 10) {
                return Err(ClusterApiError::LearnerNotReady);
            }
            member.is_learner = false;
            Ok(())
        })
    }
}

impl ProgressSource for FakeCluster {
    fn replication_progress<'a>(
        &'a self,
        _member: &'a Member,
    ) -> BoxFuture<'a, Result<ReplicationProgress, ClusterApiError>> {
        Box::pin(async move {
            self.state
                .lock()
                .unwrap()
                .progress
                .ok_or_else(|| ClusterApiError::Rejected {
                    status: 503,
                    message: "learner unreachable".to_string(),
                })
        })
    }
}

pub(crate) struct FakeFactory(pub(crate) Arc<FakeCluster>);

impl ClusterClientFactory for FakeFactory {
    fn new_cluster(&self) -> Result<Arc<dyn ClusterClient>, ClusterApiError> {
        Ok(self.0.clone())
    }
}

pub(crate) fn identity() -> MemberIdentity {
    MemberIdentity::new("etcd-1", vec![PEER.to_string()]).unwrap()
}

pub(crate) fn control(cluster: &Arc<FakeCluster>) -> MemberControl {
    MemberControl::new(
        Arc::new(FakeFactory(cluster.clone())),
        cluster.clone(),
        identity(),
        MemberControlOptions {
            request_timeout: Duration::from_secs(5),
            max_learner_lag: 10,
        },
    )
}

pub(crate) fn voter(id: MemberId, name: &str) -> Member {
    Member {
        id,
        name: name.to_string(),
        peer_urls: vec![format!("http://{name}.etcd-peer.default.svc:2380")],
        client_urls: vec![format!("http://{name}.etcd-peer.default.svc:2379")],
        is_learner: false,
    }
}
