use std::fs::OpenOptions;
use std::path::Path;

use anyhow::Result;
use nix::sys::utsname;
use nix::unistd::Uid;
use tracing::warn;

const PROCFS_PATH: &str = "/proc";
const DEBUGFS_PATH: &str = "/sys/kernel/debug";

/// What the host offers for kcov based coverage collection. Only used to
/// explain a failed setup; coverage sessions never consult it.
#[derive(Debug)]
pub struct SystemInfo {
    pub os_release: String,
    pub running_as_root: bool,
    pub procfs_mount_detected: bool,
    pub debugfs_mount_detected: bool,
    pub kcov_device_detected: bool,
    pub kcov_device_accessible: bool,
}

fn debugfs_mount_detected() -> bool {
    let mounts = match procfs::process::Process::myself().and_then(|p| p.mountinfo()) {
        Ok(mounts) => mounts,
        Err(err) => {
            warn!("Failed to read mountinfo {}", err);
            return false;
        }
    };

    mounts
        .into_iter()
        .any(|mount| mount.fs_type == "debugfs" && mount.mount_point == Path::new(DEBUGFS_PATH))
}

fn kcov_device_accessible(kcov_path: &Path) -> bool {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(kcov_path)
        .is_ok()
}

impl SystemInfo {
    pub fn new(kcov_path: &Path) -> Result<SystemInfo> {
        Ok(SystemInfo {
            os_release: utsname::uname()?.release().to_string_lossy().to_string(),
            running_as_root: Uid::effective().is_root(),
            procfs_mount_detected: Path::new(PROCFS_PATH).exists(),
            debugfs_mount_detected: debugfs_mount_detected(),
            kcov_device_detected: kcov_path.exists(),
            kcov_device_accessible: kcov_device_accessible(kcov_path),
        })
    }

    pub fn has_minimal_requirements(&self) -> bool {
        self.procfs_mount_detected && self.kcov_device_detected && self.kcov_device_accessible
    }

    /// Human readable hint for the first missing requirement, if any.
    pub fn hint(&self) -> Option<&'static str> {
        if !self.debugfs_mount_detected && !self.kcov_device_detected {
            Some("debugfs does not seem to be mounted, try `mount -t debugfs none /sys/kernel/debug`")
        } else if !self.kcov_device_detected {
            Some("the kernel was not built with CONFIG_KCOV")
        } else if !self.kcov_device_accessible && !self.running_as_root {
            Some("the kcov device is not accessible, are you running as root?")
        } else if !self.kcov_device_accessible {
            Some("the kcov device exists but could not be opened")
        } else {
            None
        }
    }
}
