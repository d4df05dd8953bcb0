use std::io;
use std::path::PathBuf;

use clap::CommandFactory;
use clap_complete::{generate, Shell};
use tracing::{debug, info, warn};

use crate::cli::Cli;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fs::operations;

pub fn init_logging(debug: bool, verbose: bool) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = if debug {
        EnvFilter::new("debug")
    } else if verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::new("warn")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(debug)
        .with_line_number(debug)
        .init();

    debug!("Logging initialized");
    Ok(())
}

pub fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

/// Show mount state and whether a daemon pidfile is present.
pub async fn status(mount_point: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let mount_point = mount_point.unwrap_or_else(|| config.mount_point());

    println!("Mount point: {}", mount_point.display());
    if operations::is_mounted(&mount_point) {
        if operations::is_mount_stale(&mount_point) {
            println!("State:       mounted (stale - transport endpoint gone)");
            println!("             run 'remotefs-fuse unmount --force {}'", mount_point.display());
        } else {
            println!("State:       mounted");
        }
    } else {
        println!("State:       not mounted");
    }

    match read_pidfile() {
        Ok(Some(pid)) => println!("Daemon:      running (pid {})", pid),
        Ok(None) => println!("Daemon:      not running"),
        Err(e) => warn!("Could not read pidfile: {}", e),
    }

    Ok(())
}

/// Signal the running daemon to unmount and exit.
pub async fn stop(config_path: Option<PathBuf>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let mount_point = config.mount_point();

    let Some(pid) = read_pidfile()? else {
        // No daemon; still try to clean up a leftover mount.
        if operations::is_mounted(&mount_point) {
            operations::unmount(&mount_point, false)?;
            println!("Unmounted {}", mount_point.display());
            return Ok(());
        }
        return Err(Error::NotFound("no running daemon found".to_string()));
    };

    info!("Stopping daemon (pid {})", pid);
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret != 0 {
        warn!("Signal delivery failed; removing stale pidfile");
        remove_pidfile();
        if operations::is_mounted(&mount_point) {
            operations::unmount(&mount_point, true)?;
        }
        return Ok(());
    }

    // Give the daemon a moment to unmount cleanly.
    for _ in 0..50 {
        if !operations::is_mounted(&mount_point) {
            println!("Stopped daemon (pid {})", pid);
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    warn!("Daemon did not unmount in time, forcing");
    operations::unmount(&mount_point, true)?;
    Ok(())
}

pub fn pidfile_path() -> Result<PathBuf> {
    Ok(Config::runtime_dir()?.join("remotefs-fuse.pid"))
}

pub fn write_pidfile() -> Result<()> {
    let path = pidfile_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, std::process::id().to_string())?;
    debug!("Wrote pidfile {}", path.display());
    Ok(())
}

pub fn read_pidfile() -> Result<Option<u32>> {
    let path = pidfile_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    match content.trim().parse::<u32>() {
        Ok(pid) => Ok(Some(pid)),
        Err(_) => {
            warn!("Ignoring malformed pidfile {}", path.display());
            Ok(None)
        }
    }
}

pub fn remove_pidfile() {
    if let Ok(path) = pidfile_path() {
        let _ = std::fs::remove_file(path);
    }
}
