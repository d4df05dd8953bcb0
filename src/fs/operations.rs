use std::path::Path;
use std::process::Command;
use std::thread::JoinHandle;

use fuser::MountOption;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::fs::filesystem::RemoteFsFilesystem;

/// Mount options surfaced through the CLI.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub allow_root: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            allow_root: false,
            auto_unmount: false,
        }
    }
}

/// Start the FUSE session on its own thread. The thread lives until the
/// filesystem is unmounted.
pub fn mount_filesystem(
    fs: RemoteFsFilesystem,
    mount_point: &Path,
    options: &MountOptions,
) -> Result<JoinHandle<()>> {
    validate_mount_point(mount_point)?;

    let mut mount_options = vec![
        MountOption::FSName("remotefs".to_string()),
        MountOption::DefaultPermissions,
    ];
    if options.allow_other {
        mount_options.push(MountOption::AllowOther);
    }
    if options.allow_root {
        mount_options.push(MountOption::AllowRoot);
    }
    if options.auto_unmount {
        mount_options.push(MountOption::AutoUnmount);
    }
    debug!("FUSE mount options: {:?}", mount_options);

    let target = mount_point.to_path_buf();
    let handle = std::thread::spawn(move || {
        info!("Starting FUSE session at {}", target.display());
        match fuser::mount2(fs, &target, &mount_options) {
            Ok(()) => info!("FUSE session ended"),
            Err(e) => error!("FUSE session failed: {}", e),
        }
    });

    // Wait for the kernel handshake before callers probe the mount.
    for _ in 0..50 {
        if is_mounted(mount_point) {
            info!("Mounted at {}", mount_point.display());
            return Ok(handle);
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    Err(Error::Mount(format!(
        "filesystem did not come up at {}",
        mount_point.display()
    )))
}

/// Unmount with escalating strategies: graceful, then (with `force`) lazy.
pub fn unmount(mount_point: &Path, force: bool) -> Result<()> {
    let target = mount_point
        .to_str()
        .ok_or_else(|| Error::Mount("invalid mount point path".to_string()))?;

    if !is_mounted(mount_point) && !force {
        warn!("Not mounted: {}", mount_point.display());
        return Ok(());
    }

    if try_unmount(target, &[]).is_ok() {
        info!("Unmounted {}", mount_point.display());
        return Ok(());
    }

    if force {
        if try_unmount(target, &["-z"]).is_ok() {
            warn!("Lazy-unmounted {}; cleanup finishes when the mount is idle", target);
            return Ok(());
        }
    }

    Err(Error::Mount(format!(
        "failed to unmount {} - close processes using the mount or retry with --force",
        mount_point.display()
    )))
}

fn try_unmount(target: &str, extra: &[&str]) -> Result<()> {
    let mut args = vec!["-u"];
    args.extend_from_slice(extra);
    args.push(target);
    let output = Command::new("fusermount")
        .args(&args)
        .output()
        .map_err(|e| Error::Mount(format!("failed to run fusermount: {}", e)))?;
    if output.status.success() {
        return Ok(());
    }

    // macOS/BSD fallback.
    let mut args: Vec<&str> = extra.iter().map(|f| if *f == "-z" { "-l" } else { *f }).collect();
    args.push(target);
    let output = Command::new("umount")
        .args(&args)
        .output()
        .map_err(|e| Error::Mount(format!("failed to run umount: {}", e)))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Mount(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

/// Check /proc/mounts (with a `mount` fallback) for the given target.
pub fn is_mounted(mount_point: &Path) -> bool {
    let Some(target) = mount_point.to_str() else {
        return false;
    };

    if let Ok(mounts) = std::fs::read_to_string("/proc/mounts") {
        return mounts.lines().any(|line| {
            let mut parts = line.split_whitespace();
            parts.next();
            parts.next() == Some(target)
        });
    }

    if let Ok(output) = Command::new("mount").output() {
        let mounts = String::from_utf8_lossy(&output.stdout);
        return mounts.lines().any(|line| line.contains(target));
    }
    false
}

/// A mount that is listed but errors on access is a leftover from a dead
/// session.
pub fn is_mount_stale(mount_point: &Path) -> bool {
    if !is_mounted(mount_point) {
        return false;
    }
    match std::fs::read_dir(mount_point) {
        Ok(_) => false,
        Err(e) => {
            let msg = e.to_string().to_lowercase();
            msg.contains("transport endpoint is not connected")
                || msg.contains("stale file handle")
                || msg.contains("input/output error")
        }
    }
}

pub fn cleanup_stale_mount(mount_point: &Path) -> Result<()> {
    info!("Cleaning up stale mount: {}", mount_point.display());
    let target = mount_point
        .to_str()
        .ok_or_else(|| Error::Mount("invalid mount point path".to_string()))?;
    try_unmount(target, &["-z"])
}

/// Ensure the mount point exists, is a directory, and is not in use.
pub fn validate_mount_point(mount_point: &Path) -> Result<()> {
    if !mount_point.exists() {
        info!("Creating mount point: {}", mount_point.display());
        std::fs::create_dir_all(mount_point).map_err(|e| {
            Error::PermissionDenied(format!(
                "failed to create mount point {}: {}",
                mount_point.display(),
                e
            ))
        })?;
    }

    if !mount_point.is_dir() {
        return Err(Error::Mount(format!(
            "mount point is not a directory: {}",
            mount_point.display()
        )));
    }

    if is_mounted(mount_point) {
        if is_mount_stale(mount_point) {
            cleanup_stale_mount(mount_point)?;
        } else {
            return Err(Error::AlreadyExists(format!(
                "mount point is already mounted: {}",
                mount_point.display()
            )));
        }
    }

    match std::fs::read_dir(mount_point) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                warn!("Mount point is not empty: {}", mount_point.display());
            }
            Ok(())
        }
        Err(e) => Err(Error::PermissionDenied(format!(
            "cannot read mount point {}: {}",
            mount_point.display(),
            e
        ))),
    }
}
