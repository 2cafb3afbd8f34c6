//! Cirrus Node - process entry point
//!
//! Loads the TOML config, merges CLI overrides, assembles the role's
//! runner group, and runs it to completion. Start-up errors are fatal;
//! a shutdown signal terminates the group cleanly.

use anyhow::Context;
use cirrus_cluster::ClusterMap;
use cirrus_common::config::{CacheConfig, Config, Role};
use cirrus_common::{Error, Member, NodeId, Result};
use cirrus_node::proxy::{ProxyRunner, ProxyState};
use cirrus_node::runners::{EvictionRunner, SignalRunner, StatsRunner};
use cirrus_node::target::{TargetRunner, TargetState};
use cirrus_placement::{MountpathSet, Placement};
use cirrus_runner::RunGroup;
use cirrus_store::{CacheStats, EvictionManager, ObjectCache, StatvfsProbe};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "cirrus-node")]
#[command(about = "Cirrus cluster node - object-cache target and membership proxy")]
#[command(version)]
struct Args {
    /// Role: proxy or target (overrides the config file)
    #[arg(short, long)]
    role: Option<String>,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/cirrus/node.toml")]
    config: PathBuf,

    /// Listen address (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Proxy base URL targets register with
    #[arg(long)]
    proxy_url: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds between stats log lines (0 disables)
    #[arg(long)]
    stats_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config: Config = if args.config.exists() {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", args.config.display()))?
    } else {
        Config::default()
    };

    // CLI takes precedence over the config file
    if let Some(role) = &args.role {
        config.node.role = Some(role.parse()?);
    }
    if let Some(listen) = args.listen {
        config.node.listen = listen;
    }
    if let Some(proxy_url) = args.proxy_url {
        config.node.proxy_url = proxy_url;
    }
    if let Some(interval) = args.stats_interval {
        config.stats.interval_secs = interval;
    }
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(role) = config.node.role else {
        anyhow::bail!("node.role missing after validation");
    };
    let member = build_member(&config)?;
    info!(role = ?role, id = %member.id, listen = %config.node.listen, "starting cirrus node");

    let cluster = Arc::new(ClusterMap::new());
    let stats = Arc::new(CacheStats::default());
    let mut group = RunGroup::new();

    match role {
        Role::Target => {
            let mounts = build_mounts(&config.cache)?;
            let backend = cirrus_cloud::from_config(&config.cloud)?;
            let cache = Arc::new(ObjectCache::new(
                member.id.clone(),
                Placement::new(Arc::clone(&mounts)),
                Arc::clone(&cluster),
                backend,
                Arc::clone(&stats),
            ));
            let evictor = Arc::new(EvictionManager::new(
                Arc::clone(&mounts),
                config.cache.watermarks,
                Arc::clone(cache.pins()),
                Box::new(StatvfsProbe),
                Arc::clone(&stats),
            ));
            let state = Arc::new(TargetState::new(
                member.clone(),
                config.node.proxy_url.clone(),
                Arc::clone(&cluster),
                cache,
                Arc::clone(&stats),
            )?);

            group.add(
                Arc::new(TargetRunner::new(state, config.node.listen.clone())),
                "target",
            );
            group.add(
                Arc::new(EvictionRunner::new(
                    evictor,
                    Duration::from_secs(config.cache.evict_interval_secs.max(1)),
                )),
                "eviction",
            );
            if config.stats.interval_secs > 0 {
                group.add(
                    Arc::new(StatsRunner::new(
                        Arc::clone(&stats),
                        Some(mounts),
                        Duration::from_secs(config.stats.interval_secs),
                    )),
                    "storstats",
                );
            }
        }
        Role::Proxy => {
            let state = Arc::new(ProxyState::new(
                member.clone(),
                Arc::clone(&cluster),
                Arc::clone(&stats),
            )?);
            group.add(
                Arc::new(ProxyRunner::new(state, config.node.listen.clone())),
                "proxy",
            );
            if config.stats.interval_secs > 0 {
                group.add(
                    Arc::new(StatsRunner::new(
                        Arc::clone(&stats),
                        None,
                        Duration::from_secs(config.stats.interval_secs),
                    )),
                    "proxystats",
                );
            }
        }
    }
    group.add(Arc::new(SignalRunner::new()), "signal");

    match group.run().await {
        Ok(()) => info!("terminated OK"),
        Err(e) if e.is_shutdown() => info!("terminated OK"),
        Err(e) => return Err(e).context("node terminated with error"),
    }
    Ok(())
}

/// Build this process's member record from the configured identity and
/// listen address
fn build_member(config: &Config) -> Result<Member> {
    let id = config
        .node
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());

    let (host, port) = config
        .node
        .listen
        .rsplit_once(':')
        .ok_or_else(|| Error::configuration(format!("invalid listen address {:?}", config.node.listen)))?;
    let port: u16 = port
        .parse()
        .map_err(|e| Error::configuration(format!("invalid listen port: {e}")))?;
    // a wildcard bind is not reachable by peers; advertise loopback
    let host = if host.is_empty() || host == "0.0.0.0" || host == "[::]" {
        "127.0.0.1"
    } else {
        host
    };
    Ok(Member::new(NodeId::new(id), host, port))
}

/// Assemble the mountpath set: explicit paths win, then a /proc/mounts
/// scan, then emulated directories
fn build_mounts(cache: &CacheConfig) -> Result<Arc<MountpathSet>> {
    let set = if !cache.paths.is_empty() {
        MountpathSet::from_paths(&cache.paths)?
    } else if let Some(prefix) = &cache.mount_prefix {
        MountpathSet::discover(prefix)?
    } else if let Some(base) = &cache.emulate_path {
        MountpathSet::emulated(base, cache.emulate_count)?
    } else {
        return Err(Error::configuration("no cache layout configured"));
    };
    Ok(Arc::new(set))
}
