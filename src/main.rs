use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde_json::{Value, json};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use kvbackup::{
    config::{Cli, Command, Config, MemberCommand, SnapshotsCommand},
    context::Ctx,
    join::{JoinOptions, join_cluster},
    member::{MemberControl, http::HttpClusterClientFactory},
    snapshot::{self, Snapshot},
    snapstore::{self, new_snap_store},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let ctx = Ctx::background();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            interrupt.cancel();
        }
    });

    let output = match cli.command {
        Command::Snapshots(cmd) => run_snapshots(&cli.config, &ctx, cmd).await?,
        Command::Member(cmd) => run_member(&cli.config, &ctx, cmd).await?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_snapshots(config: &Config, ctx: &Ctx, cmd: SnapshotsCommand) -> Result<Value> {
    let store = new_snap_store(&config.store_config()).context("build snapshot store")?;
    let ctx = ctx.with_timeout(config.connection().snapshot_timeout);

    match cmd {
        SnapshotsCommand::List => {
            let snaps = ctx.run("list", store.list()).await?;
            Ok(serde_json::to_value(snaps)?)
        }
        SnapshotsCommand::Latest => {
            let latest = ctx.run("get_latest", store.get_latest()).await?;
            Ok(serde_json::to_value(latest)?)
        }
        SnapshotsCommand::Chain(args) => {
            let snaps = ctx.run("list", store.list()).await?;
            let chain = snapshot::restore_chain(&snaps, args.target_revision)?;
            Ok(serde_json::to_value(chain)?)
        }
        SnapshotsCommand::Save(args) => {
            let snap = Snapshot::new(
                args.kind,
                args.start_revision,
                args.last_revision,
                chrono::Utc::now(),
            )?;
            let mut input = tokio::fs::File::open(&args.input)
                .await
                .with_context(|| format!("open {}", args.input.display()))?;
            ctx.run("save", store.save(&snap, &mut input)).await?;
            info!(provider = %store.provider(), path = %snap.path, "snapshot saved");
            Ok(serde_json::to_value(snap)?)
        }
        SnapshotsCommand::Fetch(args) => {
            let snap = parse_name(&args.name)?;
            let mut reader = ctx.run("fetch", store.fetch(&snap)).await?;
            let bytes = ctx
                .run("fetch", async {
                    let mut out = tokio::fs::File::create(&args.output)
                        .await
                        .with_context(|| format!("create {}", args.output.display()))?;
                    tokio::io::copy(&mut reader, &mut out)
                        .await
                        .with_context(|| format!("download {}", snap.path))
                })
                .await?;
            Ok(json!({ "snapshot": snap, "bytes": bytes, "output": args.output }))
        }
        SnapshotsCommand::Delete(args) => {
            let snap = parse_name(&args.name)?;
            ctx.run("delete", store.delete(&snap)).await?;
            Ok(json!({ "deleted": [snap] }))
        }
        SnapshotsCommand::Gc(args) => {
            let max_full = usize::try_from(args.max_full).context("--max-full out of range")?;
            let deleted = if args.dry_run {
                let snaps = ctx.run("list", store.list()).await?;
                snapshot::garbage(&snaps, max_full)
            } else {
                ctx.run("gc", snapstore::collect_garbage(store.as_ref(), max_full))
                    .await?
            };
            Ok(json!({ "dry_run": args.dry_run, "deleted": deleted }))
        }
    }
}

async fn run_member(config: &Config, ctx: &Ctx, cmd: MemberCommand) -> Result<Value> {
    let connection = config.connection();
    let identity = config.identity().context("resolve member identity")?;
    let factory = HttpClusterClientFactory::new(
        connection.endpoints.clone(),
        connection.connection_timeout,
        connection.connection_timeout,
    );
    let client = Arc::new(factory.new_client().context("build cluster client")?);
    let control = MemberControl::new(
        Arc::new(factory),
        client.clone(),
        identity,
        config.member_options(),
    );
    let member = control.identity().name.clone();

    match cmd {
        MemberCommand::Status => {
            let state = control.member_state(ctx).await?;
            Ok(json!({ "member": member, "status": state }))
        }
        MemberCommand::AddLearner => {
            control.add_member_as_learner(ctx).await?;
            let state = control.member_state(ctx).await?;
            Ok(json!({ "member": member, "status": state }))
        }
        MemberCommand::Promote => {
            let promotion = control.promote_member(ctx).await?;
            Ok(json!({ "member": member, "promotion": promotion }))
        }
        MemberCommand::UpdatePeerUrl => {
            control.update_member_peer_url(ctx, client.as_ref()).await?;
            Ok(json!({ "member": member, "peer_urls": control.identity().peer_urls }))
        }
        MemberCommand::Join(args) => {
            let options = JoinOptions::with_timeout(Duration::from_secs(args.timeout_secs));
            let state = join_cluster(&control, ctx, options).await?;
            Ok(json!({ "member": member, "status": state }))
        }
    }
}

fn parse_name(name: &str) -> Result<Snapshot> {
    Snapshot::parse_key(name.trim()).ok_or_else(|| anyhow!("invalid snapshot key: {name:?}"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
