use std::path::Path;

use anyhow::{Context, Result};
use kcover_session::{write_log, CoverageSession, LogWriteMode, Mode, RemoteHandle, SessionError};
use tracing::{debug, info};

/// Remote coverage for the whole traced process tree, collected by the
/// tracer itself.
///
/// Started before the command is forked and finished after it was reaped,
/// so the capture window covers its entire lifetime.
#[derive(Debug)]
pub struct RemoteCapture {
    session: CoverageSession,
    handle: RemoteHandle,
}

impl RemoteCapture {
    /// Opens a remote session on `device` with a handle derived from our own
    /// pid. The handle is not unique over time: a tracer that gets a reused
    /// pid while the earlier handle is still registered fails with `EEXIST`.
    pub fn start(device: &Path) -> Result<Self, SessionError> {
        let handle = RemoteHandle::for_process(std::process::id());
        let session = CoverageSession::open_device(device, Mode::Remote(handle))?;
        info!("remote coverage enabled with handle {:#x}", handle.raw());
        Ok(RemoteCapture { session, handle })
    }

    pub fn handle(&self) -> RemoteHandle {
        self.handle
    }

    /// Snapshots the buffer, releases the session and writes the entries to
    /// `log_path`, replacing what was there. Returns how many were written.
    pub fn finish(mut self, log_path: &Path) -> Result<usize> {
        let entries = self
            .session
            .drain()
            .context("failed to read remote coverage")?;
        self.session.close();

        write_log(log_path, &entries, LogWriteMode::Truncate)
            .with_context(|| format!("failed to write {}", log_path.display()))?;
        debug!(
            "wrote {} remote entries to {}",
            entries.len(),
            log_path.display()
        );
        Ok(entries.len())
    }
}
