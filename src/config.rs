use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    member::{MemberControlOptions, MemberError, MemberIdentity},
    snapshot::SnapshotKind,
    snapstore::StoreConfig,
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "kvbackup",
    about = "Snapshot storage and membership control for a replicated KV store",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Inspect and manage stored snapshots.
    #[command(subcommand)]
    Snapshots(SnapshotsCommand),

    /// Inspect and drive this process's cluster membership.
    #[command(subcommand)]
    Member(MemberCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum SnapshotsCommand {
    /// List snapshots ordered by last revision.
    List,
    /// Print the latest snapshot (or null).
    Latest,
    /// Print the full + incremental chain a restore would apply.
    Chain(ChainArgs),
    /// Upload a snapshot artifact from a file.
    Save(SaveArgs),
    /// Download a snapshot artifact to a file.
    Fetch(FetchArgs),
    /// Delete one snapshot artifact.
    Delete(NameArgs),
    /// Delete everything older than the newest N full snapshots.
    Gc(GcArgs),
}

#[derive(Subcommand, Debug, Clone)]
pub enum MemberCommand {
    /// Print this member's state: not_member, learner or voting.
    Status,
    /// Add this process as a learner (no-op if already present).
    AddLearner,
    /// Promote this learner to a voting member once caught up.
    Promote,
    /// Correct the peer URLs recorded for this member.
    UpdatePeerUrl,
    /// Add as learner and promote, retrying until voting or timeout.
    Join(JoinArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ChainArgs {
    #[arg(long, value_name = "REV")]
    pub target_revision: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct SaveArgs {
    #[arg(long, value_name = "full|incr")]
    pub kind: SnapshotKind,

    #[arg(long, value_name = "REV")]
    pub start_revision: u64,

    #[arg(long, value_name = "REV")]
    pub last_revision: u64,

    #[arg(long, value_name = "PATH")]
    pub input: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    /// Snapshot key as printed by `snapshots list`.
    #[arg(long, value_name = "KEY")]
    pub name: String,

    #[arg(long, value_name = "PATH")]
    pub output: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct NameArgs {
    #[arg(long, value_name = "KEY")]
    pub name: String,
}

#[derive(Args, Debug, Clone)]
pub struct GcArgs {
    #[arg(
        long,
        value_name = "N",
        value_parser = clap::value_parser!(u64).range(1..=1000)
    )]
    pub max_full: u64,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    #[arg(
        long = "timeout-secs",
        value_name = "SECS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..=86400)
    )]
    pub timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Cluster client endpoints, comma separated.
    #[arg(
        long,
        global = true,
        env = "KVBR_ENDPOINTS",
        value_name = "URLS",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:2379"
    )]
    pub endpoints: Vec<String>,

    #[arg(
        long = "connection-timeout-secs",
        global = true,
        env = "KVBR_CONNECTION_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    pub connection_timeout_secs: u64,

    #[arg(
        long = "snapshot-timeout-secs",
        global = true,
        env = "KVBR_SNAPSHOT_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 900,
        value_parser = clap::value_parser!(u64).range(1..=86400)
    )]
    pub snapshot_timeout_secs: u64,

    #[arg(
        long = "defrag-timeout-secs",
        global = true,
        env = "KVBR_DEFRAG_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 900,
        value_parser = clap::value_parser!(u64).range(1..=86400)
    )]
    pub defrag_timeout_secs: u64,

    /// Local, S3, ABS or GCS.
    #[arg(
        long = "storage-provider",
        global = true,
        env = "KVBR_STORAGE_PROVIDER",
        value_name = "PROVIDER",
        default_value = "Local"
    )]
    pub storage_provider: String,

    /// Bucket/container, or the base directory for Local.
    #[arg(
        long = "storage-container",
        global = true,
        env = "KVBR_STORAGE_CONTAINER",
        value_name = "NAME",
        default_value = ""
    )]
    pub storage_container: String,

    #[arg(
        long = "store-prefix",
        global = true,
        env = "KVBR_STORE_PREFIX",
        value_name = "PREFIX",
        default_value = "v2"
    )]
    pub store_prefix: String,

    #[arg(long = "member-name", global = true, env = "POD_NAME", value_name = "NAME")]
    pub member_name: Option<String>,

    /// Advertised peer URLs, comma separated. Takes precedence over --etcd-config.
    #[arg(
        long = "peer-urls",
        global = true,
        env = "KVBR_PEER_URLS",
        value_name = "URLS",
        value_delimiter = ','
    )]
    pub peer_urls: Vec<String>,

    /// The store's YAML config, read for `name` and `initial-advertise-peer-urls`.
    #[arg(long = "etcd-config", global = true, env = "ETCD_CONF", value_name = "PATH")]
    pub etcd_config: Option<PathBuf>,

    #[arg(
        long = "max-learner-lag",
        global = true,
        env = "KVBR_MAX_LEARNER_LAG",
        value_name = "ENTRIES",
        default_value_t = 1000
    )]
    pub max_learner_lag: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub endpoints: Vec<String>,
    pub connection_timeout: Duration,
    pub snapshot_timeout: Duration,
    /// Carried for snapshot takers; nothing in this crate defragments.
    pub defrag_timeout: Duration,
}

impl Config {
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            endpoints: self
                .endpoints
                .iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            snapshot_timeout: Duration::from_secs(self.snapshot_timeout_secs),
            defrag_timeout: Duration::from_secs(self.defrag_timeout_secs),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            provider: self.storage_provider.clone(),
            container: self.storage_container.clone(),
            prefix: self.store_prefix.clone(),
        }
    }

    pub fn identity(&self) -> Result<MemberIdentity, MemberError> {
        if !self.peer_urls.is_empty() {
            return MemberIdentity::new(
                self.member_name.clone().unwrap_or_default(),
                self.peer_urls.clone(),
            );
        }
        match &self.etcd_config {
            Some(path) => MemberIdentity::from_etcd_config(path, self.member_name.as_deref()),
            None => Err(MemberError::Configuration {
                reason: "member identity needs --peer-urls or --etcd-config".to_string(),
            }),
        }
    }

    pub fn member_options(&self) -> MemberControlOptions {
        MemberControlOptions {
            request_timeout: Duration::from_secs(self.connection_timeout_secs),
            max_learner_lag: self.max_learner_lag,
        }
    }
}
