use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::cli::commands;
use crate::config::{server_url, Config};
use crate::error::{Error, Result};
use crate::fs::cache::CacheConfig;
use crate::fs::operations::{self, MountOptions};
use crate::fs::{FsCore, RemoteFsFilesystem};
use crate::remote::{run_subscriber, RemoteClient};

/// Mount the remote tree and serve it until a shutdown signal arrives.
pub async fn mount(
    server: String,
    mount_point: Option<PathBuf>,
    daemon: bool,
    allow_other: bool,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let base_url = server_url(&server)?;
    let mount_point = mount_point.unwrap_or_else(|| config.mount_point());

    if daemon {
        return spawn_daemon(&server, &mount_point, allow_other);
    }

    let client = RemoteClient::new(&base_url)
        .with_timeout(config.request_timeout())
        .with_retries(config.remote.retry_attempts)
        .with_retry_deadline(Duration::from_secs(config.remote.retry_deadline_secs));

    // Probe before touching the kernel: an unreachable server aborts the
    // mount with a diagnostic instead of a dead mount point.
    client.statfs().await.map_err(|e| {
        Error::Transport(format!("server {} is unreachable: {}", base_url, e))
    })?;
    info!("Server reachable: {}", base_url);

    let cache_config = CacheConfig {
        attr_ttl: config.attr_ttl(),
        dir_ttl: config.dir_ttl(),
    };
    let core = Arc::new(FsCore::new(client, cache_config));

    let subscriber_core = Arc::clone(&core);
    let subscriber = tokio::spawn(run_subscriber(base_url.clone(), move |event| {
        subscriber_core.apply_change(event)
    }));

    let fs = RemoteFsFilesystem::new(Arc::clone(&core), tokio::runtime::Handle::current());
    let options = MountOptions {
        allow_other: allow_other || config.mount.allow_other,
        allow_root: false,
        auto_unmount: config.mount.auto_unmount,
    };
    let session = operations::mount_filesystem(fs, &mount_point, &options)?;

    commands::write_pidfile()?;
    println!("Mounted {} at {}", base_url, mount_point.display());
    println!("Press Ctrl+C to unmount and exit");

    wait_for_shutdown().await;

    info!("Shutting down");
    subscriber.abort();
    if let Err(e) = operations::unmount(&mount_point, false) {
        warn!("Graceful unmount failed ({}), forcing", e);
        operations::unmount(&mount_point, true)?;
    }
    let _ = session.join();
    commands::remove_pidfile();
    println!("Unmounted {}", mount_point.display());
    Ok(())
}

/// Unmount without touching a running session's state beyond the kernel.
pub async fn unmount(
    mount_point: Option<PathBuf>,
    force: bool,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let mount_point = mount_point.unwrap_or_else(|| config.mount_point());

    operations::unmount(&mount_point, force)?;
    println!("Unmounted {}", mount_point.display());
    Ok(())
}

/// Re-exec ourselves detached; the child serves the mount in the foreground
/// and owns the pidfile.
fn spawn_daemon(server: &str, mount_point: &PathBuf, allow_other: bool) -> Result<()> {
    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("mount")
        .arg(server)
        .arg(mount_point)
        .arg("--foreground")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if allow_other {
        cmd.arg("--allow-other");
    }

    let child = cmd.spawn()?;
    println!(
        "Daemon started (pid {}), mounting at {}",
        child.id(),
        mount_point.display()
    );
    println!("Use 'remotefs-fuse stop' to unmount and exit");
    Ok(())
}

async fn wait_for_shutdown() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}
