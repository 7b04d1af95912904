use std::fmt;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;

use memmap2::MmapMut;
use memmap2::MmapOptions;
use nix::errno::Errno;
use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::{CoverageBuffer, COVER_SIZE};
use crate::entry::RawLogEntry;
use crate::ioctl;

pub const KCOV_PATH: &str = "/sys/kernel/debug/kcov";

pub const KCOV_SUBSYSTEM_COMMON: u64 = 0x00 << 56;
const KCOV_SUBSYSTEM_MASK: u64 = 0xff << 56;
const KCOV_INSTANCE_MASK: u64 = 0xffff_ffff;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("KCOV_INIT_TRACE failed: {0}")]
    InitTrace(#[source] Errno),

    #[error("could not map the coverage buffer: {0}")]
    Map(#[source] io::Error),

    #[error("enabling {mode} coverage failed: {source}")]
    Enable {
        mode: &'static str,
        #[source]
        source: Errno,
    },

    #[error("KCOV_DISABLE failed: {0}")]
    Disable(#[source] Errno),

    #[error("session is {0:?}, coverage can only be read while enabled")]
    NotEnabled(SessionState),

    #[error("remote handle out of range (subsystem={subsystem:#x}, instance={instance:#x})")]
    InvalidHandle { subsystem: u64, instance: u64 },
}

/// Identifies the kernel work whose coverage is attributed to a remote
/// session. Background work tagged with the same handle, e.g. by a child of
/// the process that enabled remote coverage, lands in that session's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteHandle(u64);

impl RemoteHandle {
    pub fn new(subsystem: u64, instance: u64) -> Result<Self, SessionError> {
        if subsystem & !KCOV_SUBSYSTEM_MASK != 0 || instance & !KCOV_INSTANCE_MASK != 0 {
            return Err(SessionError::InvalidHandle {
                subsystem,
                instance,
            });
        }
        Ok(RemoteHandle(subsystem | instance))
    }

    /// Handle in the common subsystem derived from a process id. Two tracers
    /// that get the same pid over time share a handle.
    pub fn for_process(pid: u32) -> Self {
        RemoteHandle(KCOV_SUBSYSTEM_COMMON | u64::from(pid))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Coverage of the calling thread.
    Local,
    /// Coverage of kernel work done on behalf of a handle.
    Remote(RemoteHandle),
}

impl Mode {
    fn name(&self) -> &'static str {
        match self {
            Mode::Local => "local",
            Mode::Remote(_) => "remote",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Local => write!(f, "local"),
            Mode::Remote(handle) => write!(f, "remote(handle={:#x})", handle.raw()),
        }
    }
}

/// `Closed → Initialized → Mapped → Enabled → Disabled → Closed`. Closing is
/// allowed from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Initialized,
    Mapped,
    Enabled,
    Disabled,
}

/// An open kcov handle together with its mapped coverage area.
///
/// Both resources are released when the session is closed or dropped,
/// whichever comes first, including when `open` bails out half way.
pub struct CoverageSession {
    mode: Mode,
    state: SessionState,
    // Declared before `device` so that the mapping goes away first.
    area: Option<MmapMut>,
    device: Option<File>,
}

impl CoverageSession {
    /// Opens the system kcov device and enables coverage in the given mode.
    pub fn open(mode: Mode) -> Result<Self, SessionError> {
        Self::open_device(Path::new(KCOV_PATH), mode)
    }

    pub fn open_device(path: &Path, mode: Mode) -> Result<Self, SessionError> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| SessionError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let mut session = CoverageSession {
            mode,
            state: SessionState::Closed,
            area: None,
            device: Some(device),
        };
        session.init_trace()?;
        session.map()?;
        session.enable()?;

        debug!("{} coverage enabled", session.mode);
        Ok(session)
    }

    fn raw_fd(&self) -> i32 {
        self.device.as_ref().map_or(-1, |device| device.as_raw_fd())
    }

    fn init_trace(&mut self) -> Result<(), SessionError> {
        unsafe { ioctl::kcov_init_trace(self.raw_fd(), COVER_SIZE as i32) }
            .map_err(SessionError::InitTrace)?;
        self.state = SessionState::Initialized;
        Ok(())
    }

    fn map(&mut self) -> Result<(), SessionError> {
        let Some(device) = self.device.as_ref() else {
            return Err(SessionError::Map(io::Error::from(io::ErrorKind::NotFound)));
        };
        // The area is shared with the kernel, which keeps writing into it
        // while coverage is enabled.
        let area = unsafe {
            MmapOptions::new()
                .len(COVER_SIZE * std::mem::size_of::<u64>())
                .map_mut(device)
        }
        .map_err(SessionError::Map)?;
        self.area = Some(area);
        self.state = SessionState::Mapped;
        Ok(())
    }

    fn enable(&mut self) -> Result<(), SessionError> {
        let fd = self.raw_fd();
        let res = match self.mode {
            Mode::Local => unsafe { ioctl::kcov_enable(fd, ioctl::KCOV_TRACE_PC as i32) },
            Mode::Remote(handle) => {
                let arg = ioctl::KcovRemoteArg {
                    trace_mode: ioctl::KCOV_TRACE_PC,
                    area_size: COVER_SIZE as u32,
                    num_handles: 0,
                    reserved: 0,
                    common_handle: handle.raw(),
                };
                unsafe { ioctl::kcov_remote_enable(fd, &arg) }
            }
        };
        res.map_err(|source| SessionError::Enable {
            mode: self.mode.name(),
            source,
        })?;

        self.state = SessionState::Enabled;
        if let Some(buffer) = self.buffer() {
            buffer.reset();
        }
        Ok(())
    }

    fn buffer(&self) -> Option<CoverageBuffer<'_>> {
        let area = self.area.as_ref()?;
        // mmap returns page aligned memory and `AtomicU64` has the same
        // layout as `u64`. The slice can't outlive the mapping.
        let slots = unsafe {
            std::slice::from_raw_parts(area.as_ptr() as *const AtomicU64, COVER_SIZE)
        };
        Some(CoverageBuffer::new(slots))
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn enabled_buffer(&self) -> Result<CoverageBuffer<'_>, SessionError> {
        if self.state != SessionState::Enabled {
            return Err(SessionError::NotEnabled(self.state));
        }
        self.buffer()
            .ok_or(SessionError::NotEnabled(SessionState::Closed))
    }

    /// Number of program counters recorded so far.
    pub fn count(&self) -> Result<usize, SessionError> {
        Ok(self.enabled_buffer()?.count())
    }

    /// Snapshot of the recorded program counters. Only meaningful once the
    /// traced work is over, otherwise the snapshot may miss the newest
    /// entries.
    pub fn drain(&self) -> Result<Vec<RawLogEntry>, SessionError> {
        Ok(self.enabled_buffer()?.entries())
    }

    /// Stops recording. The area stays mapped until the session is closed.
    pub fn disable(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Enabled {
            return Err(SessionError::NotEnabled(self.state));
        }
        unsafe { ioctl::kcov_disable(self.raw_fd(), 0) }.map_err(SessionError::Disable)?;
        self.state = SessionState::Disabled;
        Ok(())
    }

    /// Disables coverage if needed, unmaps the area and closes the handle.
    /// Closing a closed session does nothing.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed && self.device.is_none() {
            return;
        }
        if self.state == SessionState::Enabled {
            if let Err(e) = self.disable() {
                warn!("{} session: {}", self.mode, e);
            }
        }
        self.area = None;
        self.device = None;
        self.state = SessionState::Closed;
        debug!("{} session closed", self.mode);
    }
}

impl CoverageSession {
    /// Unmaps the area and closes the handle without disabling coverage.
    ///
    /// For a task that inherited the session without having enabled it, a
    /// forked child or another thread. The kernel only accepts
    /// `KCOV_DISABLE` from the enabling task, and it disables coverage by
    /// itself when that task exits.
    pub fn abandon(&mut self) {
        if self.device.is_none() {
            return;
        }
        self.area = None;
        self.device = None;
        self.state = SessionState::Closed;
        debug!("{} session abandoned", self.mode);
    }
}

impl Drop for CoverageSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for CoverageSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoverageSession")
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("fd", &self.raw_fd())
            .finish()
    }
}
