//! Who this process is in the cluster: its member name and advertised peer URLs.
//!
//! Member Control receives a [`MemberIdentity`] explicitly; this module only knows how to derive
//! one from the store's YAML configuration file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::member::{Member, MemberError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberIdentity {
    pub name: String,
    pub peer_urls: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EtcdConfigFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "initial-advertise-peer-urls", default)]
    initial_advertise_peer_urls: Option<String>,
}

impl MemberIdentity {
    pub fn new(name: impl Into<String>, peer_urls: Vec<String>) -> Result<Self, MemberError> {
        let name = name.into().trim().to_string();
        let peer_urls: Vec<String> = peer_urls
            .iter()
            .map(|u| normalize_url(u))
            .filter(|u| !u.is_empty())
            .collect();
        if peer_urls.is_empty() {
            return Err(MemberError::Configuration {
                reason: "at least one peer URL is required".to_string(),
            });
        }
        Ok(Self { name, peer_urls })
    }

    /// Read `name` and `initial-advertise-peer-urls` from the store's config file.
    ///
    /// `pod_name` wins over the file's `name`. Peer URLs are either a comma separated list or the
    /// `scheme@service@namespace@port` template, which expands against the member name.
    pub fn from_etcd_config(path: &Path, pod_name: Option<&str>) -> Result<Self, MemberError> {
        let raw = std::fs::read_to_string(path).map_err(|e| MemberError::Configuration {
            reason: format!("read {}: {e}", path.display()),
        })?;
        Self::from_etcd_yaml(&raw, pod_name).map_err(|e| match e {
            MemberError::Configuration { reason } => MemberError::Configuration {
                reason: format!("{}: {reason}", path.display()),
            },
            other => other,
        })
    }

    fn from_etcd_yaml(raw: &str, pod_name: Option<&str>) -> Result<Self, MemberError> {
        let file: EtcdConfigFile =
            serde_yaml::from_str(raw).map_err(|e| MemberError::Configuration {
                reason: format!("parse yaml: {e}"),
            })?;

        let name = pod_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or(file.name)
            .unwrap_or_default();
        if name.is_empty() {
            return Err(MemberError::Configuration {
                reason: "member name is missing (set POD_NAME or `name`)".to_string(),
            });
        }

        let raw_urls = file
            .initial_advertise_peer_urls
            .ok_or_else(|| MemberError::Configuration {
                reason: "missing initial-advertise-peer-urls".to_string(),
            })?;
        let peer_urls =
            expand_peer_urls(&raw_urls, &name).map_err(|reason| MemberError::Configuration {
                reason,
            })?;

        Self::new(name, peer_urls)
    }

    /// A member matches by name once it has one, or by any shared peer URL before it starts.
    pub fn matches(&self, member: &Member) -> bool {
        if !self.name.is_empty() && member.name == self.name {
            return true;
        }
        member
            .peer_urls
            .iter()
            .any(|u| self.peer_urls.contains(&normalize_url(u)))
    }

    /// Order-insensitive comparison against a member's recorded peer URLs.
    pub fn same_peer_urls(&self, recorded: &[String]) -> bool {
        let mut recorded: Vec<String> = recorded.iter().map(|u| normalize_url(u)).collect();
        let mut mine = self.peer_urls.clone();
        recorded.sort();
        recorded.dedup();
        mine.sort();
        mine.dedup();
        recorded == mine
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn expand_peer_urls(raw: &str, name: &str) -> Result<Vec<String>, String> {
    let raw = raw.trim();
    if raw.contains('@') {
        let parts: Vec<&str> = raw.split('@').map(str::trim).collect();
        let [scheme, service, namespace, port] = parts.as_slice() else {
            return Err(format!(
                "peer url template must be scheme@service@namespace@port, got {raw:?}"
            ));
        };
        if parts.iter().any(|p| p.is_empty()) {
            return Err(format!("peer url template has an empty field: {raw:?}"));
        }
        if port.parse::<u16>().is_err() {
            return Err(format!("peer url template has an invalid port: {port:?}"));
        }
        return Ok(vec![format!(
            "{scheme}://{name}.{service}.{namespace}.svc:{port}"
        )]);
    }

    let urls: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect();
    if let Some(bad) = urls.iter().find(|u| !u.contains("://")) {
        return Err(format!("peer url is missing a scheme: {bad:?}"));
    }
    Ok(urls)
}
