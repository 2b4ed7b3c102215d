#![warn(missing_docs)]

//! NFSv4.1 state daemon: owns client leases, share reservations and locks.

use anyhow::Result;
use clap::Parser;
use nfs4_state::clock::SystemClock;
use nfs4_state::config::{LockBackend, ServerConfig};
use nfs4_state::delegation::AdaptiveDelegation;
use nfs4_state::file_tracker::FileTracker;
use nfs4_state::lock_manager::LockManager;
use nfs4_state::state::StateRelease;
use nfs4_state::state_handler::StateHandler;
use nfs4_state::vfs::{MemoryFs, VirtualFileSystem};
use nfs4_state::vfs_cache::VfsCache;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MEMORY_FS_SIZE: u64 = 1 << 30;

#[derive(Parser, Debug)]
#[command(name = "nfs4-stated", version, about = "NFSv4.1 server state daemon")]
struct Args {
    /// Configuration file (.toml or .json)
    #[arg(short, long, default_value = "/etc/nfs4-state/config.toml")]
    config: PathBuf,

    /// Overrides the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        ServerConfig::from_file(&args.config)?
    } else {
        ServerConfig::default()
    };

    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    if !args.config.exists() {
        tracing::warn!("Config file not found, using defaults: {}", args.config.display());
    }
    config.validate()?;

    tracing::info!(
        "{} ({}) starting...",
        config.implementation_id,
        config.implementation_domain
    );
    tracing::info!(
        "Limits: lease {}s, {} session slots, {} ops/request, name {} bytes, read {} / write {} bytes",
        config.lease_time_secs,
        config.max_session_slots,
        config.max_request_ops,
        config.max_file_name,
        config.max_read_size,
        config.max_write_size
    );

    let clock = Arc::new(SystemClock);
    let file_tracker = Arc::new(FileTracker::new());
    let lock_manager = build_lock_manager(&config).await?;
    let handler = Arc::new(StateHandler::new(
        config.client_limits(),
        clock.clone(),
        vec![file_tracker.clone() as Arc<dyn StateRelease>, lock_manager],
    ));
    let delegation = AdaptiveDelegation::from_config(&config.delegation, clock);

    let vfs = VfsCache::new(MemoryFs::new(MEMORY_FS_SIZE), &config.vfs_cache);
    let fs_stat = vfs.fs_stat().await?;
    tracing::info!(
        "Exporting in-memory filesystem: {} bytes, {} files",
        fs_stat.total_space,
        fs_stat.total_files
    );

    let sweeper = {
        let handler = handler.clone();
        let period = (config.lease_time() / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let expired = handler.expire_stale_clients().await;
                if !expired.is_empty() {
                    tracing::info!("Expired {} stale clients", expired.len());
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down, disposing {} clients", handler.client_count());
    sweeper.abort();

    for client in handler.clients() {
        if let Err(e) = handler.remove_client(client.id()).await {
            tracing::warn!("Failed to dispose {}: {}", client, e);
        }
    }
    delegation.reset();

    let stats = vfs.stats();
    tracing::info!(
        "VFS cache: lookup {}/{} stat {}/{} (hits/misses)",
        stats.lookup.hits,
        stats.lookup.misses,
        stats.stat.hits,
        stats.stat.misses
    );
    Ok(())
}

async fn build_lock_manager(config: &ServerConfig) -> Result<Arc<dyn StateRelease>> {
    let timeout = config.locks.acquire_timeout();
    match &config.locks.backend {
        LockBackend::Local => Ok(Arc::new(LockManager::local(timeout))),
        #[cfg(feature = "etcd")]
        LockBackend::Etcd { endpoints, prefix } => {
            use nfs4_state::dlm::{self, EtcdExclusion, EtcdLockStore};

            let client = dlm::connect(endpoints).await?;
            tracing::info!("Coordinating locks through etcd at {:?}", endpoints);
            Ok(Arc::new(LockManager::new(
                Arc::new(EtcdExclusion::new(client.clone(), prefix.clone())),
                Arc::new(EtcdLockStore::new(client, prefix.clone())),
                timeout,
            )))
        }
        #[cfg(not(feature = "etcd"))]
        LockBackend::Etcd { .. } => {
            anyhow::bail!("etcd lock backend requested but built without the `etcd` feature")
        }
    }
}
