//! albumfs - mount a remote photo-album service as a filesystem
//!
//! Users, albums and photos appear as directories and files; reads
//! download content on demand, writes and directory operations
//! synchronize back in the background. See `.control/help` inside the
//! mounted filesystem for day-to-day usage.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use albumfs_core::{Config, Locator};
use albumfs_daemon::media::PassthroughMedia;
use albumfs_daemon::remote::{Disconnected, RemoteService};
use albumfs_daemon::{
    control, AlbumFs, CacheElement, CacheStore, Observer, Queues, Reconciler, Scheduler,
};

#[derive(Parser)]
#[command(name = "albumfs")]
#[command(version, about = "Mount a remote photo-album service as a filesystem")]
struct Cli {
    /// Where to mount the filesystem
    mount_point: PathBuf,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Account user name
    #[arg(short, long, env = "ALBUMFS_USER")]
    user: Option<String>,

    /// Account password
    #[arg(short, long, env = "ALBUMFS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Cache directory override
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// Staleness window in seconds
    #[arg(long)]
    update_interval: Option<u64>,

    /// Start with networking suspended (pure offline cache)
    #[arg(long)]
    offline: bool,

    /// Allow other local users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    use fuser::MountOption;

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = Config::load(cli.config.as_deref());
    if let Some(user) = cli.user {
        config.account.user = user;
    }
    if let Some(password) = cli.password {
        config.account.password = Some(password);
    }
    if let Some(root) = cli.cache_root {
        config.cache.root = Some(root);
    }
    if let Some(interval) = cli.update_interval {
        config.sync.update_interval_secs = interval;
    }
    if cli.offline {
        config.sync.offline = true;
    }

    let cache_root = config.cache_root();
    let store = Arc::new(
        CacheStore::new(&cache_root)
            .with_context(|| format!("preparing cache root {cache_root:?}"))?,
    );
    if store.restore() {
        info!("restored {} cached elements from {:?}", store.len(), cache_root);
    } else {
        info!("starting with an empty cache under {:?}", cache_root);
    }
    if !store.exists(&Locator::root()) {
        let mut root = CacheElement::directory("");
        root.world_readable = true;
        store.put(&Locator::root(), root);
    }
    control::install(&store);

    // The concrete protocol client plugs in through RemoteService; the
    // stand-in reports the network as unreachable, so without one the
    // mount serves the cache read-only-ish and queues every change.
    let remote: Arc<dyn RemoteService> = Arc::new(Disconnected::new(config.account.user.clone()));

    let queues = Arc::new(Queues::new());
    let observer = Arc::new(Observer::new(config.cache.log_capacity));
    let reconciler = Reconciler::new(
        store.clone(),
        queues.clone(),
        remote.clone(),
        Arc::new(PassthroughMedia),
        observer.clone(),
        config.sync.update_interval_secs,
        config.sync.max_pixels,
        config.account.password.clone(),
    );
    if config.sync.offline {
        info!("starting offline as requested");
    } else if !reconciler.go_online() {
        warn!("no network connection; starting as an offline cache");
    }

    let scheduler = Scheduler::new(
        store.clone(),
        queues.clone(),
        reconciler.clone(),
        observer.clone(),
        config.cache.snapshot_interval_secs,
    );
    scheduler.start();

    let fs = Arc::new(AlbumFs::new(
        store,
        queues,
        reconciler,
        scheduler.clone(),
        observer,
        remote,
        Arc::new(PassthroughMedia),
        config.sync.max_pixels,
    ));

    let mut options = vec![MountOption::FSName("albumfs".to_string())];
    if cli.allow_other {
        options.push(MountOption::AllowOther);
    }
    info!("mounting albumfs at {:?}", cli.mount_point);
    let result = fuser::mount2(
        albumfs_daemon::AlbumFuse::new(fs),
        &cli.mount_point,
        &options,
    )
    .with_context(|| format!("mounting at {:?}", cli.mount_point));

    scheduler.shutdown();
    result
}

#[cfg(not(unix))]
fn main() {
    eprintln!("albumfs requires a Unix system with FUSE support");
    std::process::exit(1);
}
