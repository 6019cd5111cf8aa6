//! [`ClusterClient`] and [`ProgressSource`] over the store's JSON gateway (`/v3/...`).

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    BoxFuture,
    member::client::{
        ClusterApiError, ClusterClient, ClusterClientFactory, Member, MemberId,
        MemberListResponse, ProgressSource, ReplicationProgress,
    },
};

const MEMBER_LIST: &str = "/v3/cluster/member/list";
const MEMBER_ADD: &str = "/v3/cluster/member/add";
const MEMBER_UPDATE: &str = "/v3/cluster/member/update";
const MEMBER_PROMOTE: &str = "/v3/cluster/member/promote";
const STATUS: &str = "/v3/maintenance/status";

#[derive(Debug, Clone)]
pub struct HttpClusterClient {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HttpClusterClientFactory {
    endpoints: Vec<String>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HttpClusterClientFactory {
    pub fn new(endpoints: Vec<String>, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            endpoints,
            connect_timeout,
            request_timeout,
        }
    }

    pub fn new_client(&self) -> Result<HttpClusterClient, ClusterApiError> {
        HttpClusterClient::new(&self.endpoints, self.connect_timeout, self.request_timeout)
    }
}

impl ClusterClientFactory for HttpClusterClientFactory {
    fn new_cluster(&self) -> Result<Arc<dyn ClusterClient>, ClusterApiError> {
        Ok(Arc::new(self.new_client()?))
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireHeader {
    #[serde(default, deserialize_with = "u64_from_str_or_num")]
    member_id: u64,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    #[serde(rename = "ID", default, deserialize_with = "u64_from_str_or_num")]
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(rename = "peerURLs", default)]
    peer_urls: Vec<String>,
    #[serde(rename = "clientURLs", default)]
    client_urls: Vec<String>,
    #[serde(rename = "isLearner", default)]
    is_learner: bool,
}

impl From<WireMember> for Member {
    fn from(w: WireMember) -> Self {
        Self {
            id: w.id,
            name: w.name,
            peer_urls: w.peer_urls,
            client_urls: w.client_urls,
            is_learner: w.is_learner,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireMemberList {
    #[serde(default)]
    header: WireHeader,
    #[serde(default)]
    members: Vec<WireMember>,
}

#[derive(Debug, Deserialize)]
struct WireMemberAdd {
    member: Option<WireMember>,
}

#[derive(Debug, Deserialize)]
struct WireStatus {
    #[serde(rename = "raftIndex", default, deserialize_with = "u64_from_str_or_num")]
    raft_index: u64,
    #[serde(
        rename = "raftAppliedIndex",
        default,
        deserialize_with = "u64_from_str_or_num"
    )]
    raft_applied_index: u64,
}

#[derive(Debug, Deserialize)]
struct WireEmpty {}

#[derive(Debug, Default, Deserialize)]
struct GatewayError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct EmptyRequest {}

#[derive(Serialize)]
struct AddRequest<'a> {
    #[serde(rename = "peerURLs")]
    peer_urls: &'a [String],
    #[serde(rename = "isLearner")]
    is_learner: bool,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "peerURLs")]
    peer_urls: &'a [String],
}

#[derive(Serialize)]
struct PromoteRequest {
    #[serde(rename = "ID")]
    id: String,
}

/// 64-bit ids travel as JSON strings; accept plain numbers too.
fn u64_from_str_or_num<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u64),
        Str(String),
    }
    match Repr::deserialize(d)? {
        Repr::Num(n) => Ok(n),
        Repr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Map a gateway error body onto the membership outcomes callers treat specially.
fn classify(status: u16, body: &str) -> ClusterApiError {
    let parsed = serde_json::from_str::<GatewayError>(body).unwrap_or_default();
    let message = [parsed.message, parsed.error]
        .into_iter()
        .find(|m| !m.is_empty())
        .unwrap_or_else(|| body.trim().to_string());

    let lower = message.to_ascii_lowercase();
    if lower.contains("peer urls already exists") || lower.contains("member id already exist") {
        ClusterApiError::MemberExists
    } else if lower.contains("member not found") {
        ClusterApiError::MemberNotFound
    } else if lower.contains("in sync with leader") {
        ClusterApiError::LearnerNotReady
    } else if lower.contains("can only promote a learner member") {
        ClusterApiError::NotLearner
    } else {
        ClusterApiError::Rejected { status, message }
    }
}

impl HttpClusterClient {
    pub fn new(
        endpoints: &[String],
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ClusterApiError> {
        let endpoints: Vec<String> = endpoints
            .iter()
            .map(|e| e.trim().trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(ClusterApiError::Transport {
                endpoint: String::new(),
                message: "no cluster endpoints configured".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ClusterApiError::Transport {
                endpoint: endpoints.join(","),
                message: format!("build client: {e}"),
            })?;
        Ok(Self { client, endpoints })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// POST to each endpoint in order until one answers. Only transport failures fail over.
    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ClusterApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut last_err = None;
        for endpoint in &self.endpoints {
            match self.post_to(endpoint, path, body).await {
                Err(err @ ClusterApiError::Transport { .. }) => {
                    debug!(endpoint = %endpoint, path, error = %err, "cluster endpoint failed; trying next");
                    last_err = Some(err);
                }
                other => return other,
            }
        }
        Err(last_err.unwrap_or_else(|| ClusterApiError::Transport {
            endpoint: String::new(),
            message: "no cluster endpoints configured".to_string(),
        }))
    }

    async fn post_to<B, T>(&self, endpoint: &str, path: &str, body: &B) -> Result<T, ClusterApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let transport = |e: reqwest::Error| ClusterApiError::Transport {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        };
        let resp = self
            .client
            .post(format!("{endpoint}{path}"))
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status().as_u16();
        let success = resp.status().is_success();
        let text = resp.text().await.map_err(transport)?;

        if !success {
            return Err(classify(status, &text));
        }
        serde_json::from_str(&text).map_err(|e| ClusterApiError::Rejected {
            status,
            message: format!("decode {path} response: {e}"),
        })
    }
}

impl ClusterClient for HttpClusterClient {
    fn member_list(&self) -> BoxFuture<'_, Result<MemberListResponse, ClusterApiError>> {
        Box::pin(async move {
            let list: WireMemberList = self.post(MEMBER_LIST, &EmptyRequest {}).await?;
            Ok(MemberListResponse {
                member_id: list.header.member_id,
                members: list.members.into_iter().map(Member::from).collect(),
            })
        })
    }

    fn member_add_as_learner(
        &self,
        peer_urls: Vec<String>,
    ) -> BoxFuture<'_, Result<Member, ClusterApiError>> {
        Box::pin(async move {
            let req = AddRequest {
                peer_urls: &peer_urls,
                is_learner: true,
            };
            let added: WireMemberAdd = self.post(MEMBER_ADD, &req).await?;
            Ok(added.member.map(Member::from).unwrap_or_else(|| Member {
                peer_urls: peer_urls.clone(),
                is_learner: true,
                ..Default::default()
            }))
        })
    }

    fn member_update(
        &self,
        id: MemberId,
        peer_urls: Vec<String>,
    ) -> BoxFuture<'_, Result<(), ClusterApiError>> {
        Box::pin(async move {
            let req = UpdateRequest {
                id: id.to_string(),
                peer_urls: &peer_urls,
            };
            let _: WireEmpty = self.post(MEMBER_UPDATE, &req).await?;
            Ok(())
        })
    }

    fn member_promote(&self, id: MemberId) -> BoxFuture<'_, Result<(), ClusterApiError>> {
        Box::pin(async move {
            let req = PromoteRequest { id: id.to_string() };
            let _: WireEmpty = self.post(MEMBER_PROMOTE, &req).await?;
            Ok(())
        })
    }
}

/// Leader index comes from the cluster endpoints, applied index from the learner itself.
///
/// If a cluster endpoint happens to be the learner, the lag reads as zero; the cluster still
/// refuses to promote an out-of-sync learner, which surfaces as `LearnerNotReady`.
impl ProgressSource for HttpClusterClient {
    fn replication_progress<'a>(
        &'a self,
        member: &'a Member,
    ) -> BoxFuture<'a, Result<ReplicationProgress, ClusterApiError>> {
        Box::pin(async move {
            let learner_url = member
                .client_urls
                .first()
                .map(|u| u.trim().trim_end_matches('/'))
                .filter(|u| !u.is_empty())
                .ok_or_else(|| ClusterApiError::Transport {
                    endpoint: format!("member {:x}", member.id),
                    message: "member has not published client URLs yet".to_string(),
                })?;

            let cluster: WireStatus = self.post(STATUS, &EmptyRequest {}).await?;
            let learner: WireStatus = self.post_to(learner_url, STATUS, &EmptyRequest {}).await?;
            Ok(ReplicationProgress {
                leader_index: cluster.raft_index,
                member_applied_index: learner.raft_applied_index,
            })
        })
    }
}
