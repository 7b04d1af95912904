use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

/// Directory holding the running executable. Artifacts that ship with
/// `kcover` are looked up next to it, whatever the working directory is.
pub fn executable_dir() -> Result<PathBuf> {
    let exe = procfs::process::Process::myself()
        .and_then(|myself| myself.exe())
        .context("failed to resolve /proc/self/exe")?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("executable {} has no parent directory", exe.display()))
}

/// Resolves `path` against `base` unless it's already absolute.
pub fn anchor(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Removes a file, returning whether there was anything to remove.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
