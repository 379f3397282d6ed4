use anyhow::{Context, Result, bail};
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use unfsd::auth::exports::{ExportDefaults, load_exports};
use unfsd::auth::netgroup::FileNetgroups;
use unfsd::config::{Args, ServerConfig};
use unfsd::mount::{MOUNT_PROGRAM, MOUNT_V1};
use unfsd::portmap::{PORTMAP_PROGRAM, PORTMAP_V2, Registry};
use unfsd::protocol::v2::nfs::{NFS_PROGRAM, NFS_V2};
use unfsd::protocol::v2::portmap::{IPPROTO_TCP, Mapping};
use unfsd::rpc::worker::TableLoader;
use unfsd::rpc::{self, Control, RpcServer, WorkerPool};

/// Programs this server answers, all on the listening port
const PROGRAMS: [(u32, u32); 3] = [
    (PORTMAP_PROGRAM, PORTMAP_V2),
    (MOUNT_PROGRAM, MOUNT_V1),
    (NFS_PROGRAM, NFS_V2),
];

/// Register all RPC services in the portmapper registry
fn register_services(registry: &Registry, port: u16) {
    for (prog, vers) in PROGRAMS {
        registry.set(&Mapping {
            prog,
            vers,
            prot: IPPROTO_TCP,
            port: port.into(),
        });
    }
}

fn unregister_services(registry: &Registry) {
    for (prog, vers) in PROGRAMS {
        registry.unset(&Mapping {
            prog,
            vers,
            prot: IPPROTO_TCP,
            port: 0,
        });
    }
}

/// Loader re-reading the netgroup and exports files on every call
fn table_loader(config: &ServerConfig) -> TableLoader {
    let exports_file = config.exports_file.clone();
    let netgroup_file = config.netgroup_file.clone();
    let defaults = ExportDefaults {
        cross_mounts: config.cross_mounts,
        promiscuous: config.promiscuous,
    };
    Arc::new(move || {
        let netgroups = FileNetgroups::load(&netgroup_file)?;
        load_exports(&exports_file, defaults, Arc::new(netgroups))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(args.log_filter()))
        .init();

    let config = Arc::new(args.server_config()?);
    if unsafe { libc::geteuid() } != 0 {
        if !config.allow_non_root {
            bail!("unfsd must run as root (use --allow-non-root to override)");
        }
        warn!("Not running as root; requests run with the server's own identity");
    }

    let loader = table_loader(&config);
    // Refuse to start on a broken exports file; later reloads keep the old table
    loader().context("Failed to load exports")?;

    let control = Arc::new(Control::new());
    let pool = Arc::new(WorkerPool::start(config.clone(), control.clone(), loader)?);

    let registry = Registry::new();
    let server = RpcServer::bind(config.listen, registry.clone(), pool.clone()).await?;
    register_services(&registry, server.local_addr()?.port());

    let signals = tokio::spawn(rpc::watch_signals(
        control.clone(),
        pool.clone(),
        config.flush_interval,
    ));

    let mut terminate = signal(SignalKind::terminate()).context("Failed to watch SIGTERM")?;
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        info!("Shutting down");
    };

    info!(
        "Serving NFS v2 with {} workers on {}",
        config.workers, config.listen
    );
    let result = server.run(shutdown).await;

    signals.abort();
    unregister_services(&registry);
    tokio::task::spawn_blocking(move || pool.shutdown()).await?;
    result
}
