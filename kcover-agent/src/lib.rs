//! Local coverage agent.
//!
//! Built as a shared object and injected with `LD_PRELOAD` into the command
//! traced by `kcover`. It has no API: loading it enables kcov for the
//! process' main thread, and process exit writes whatever was recorded to
//! the local log. There is exactly one agent per process, held in
//! [`AGENT`].
//!
//! Failing to set up coverage must never change what the host program does,
//! so every failure is reported as a warning and the agent stays inert.

use std::env;
use std::io::IsTerminal;
use std::panic;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use kcover_session::{write_log, CoverageSession, LogWriteMode, Mode, RawLogEntry};
use kcover_session::{LOCAL_LOG, LOCAL_LOG_ENV, LOG_LEVEL_ENV};
use nix::unistd::{getpid, gettid, Pid};
use tracing::{debug, warn, Level};

/// The process' coverage session.
///
/// Filled in by [`agent_init`] when the object is loaded, emptied by
/// [`agent_fini`] when the process exits.
static AGENT: Mutex<Option<LocalAgent>> = Mutex::new(None);

struct LocalAgent {
    session: CoverageSession,
    /// Process that enabled coverage. A child forked without exec inherits
    /// this state and the shared mapping but not kcov itself.
    owner: Pid,
    /// Task that enabled coverage. Only it may disable it.
    owner_task: Pid,
    log_path: PathBuf,
}

/// What process exit does with the session, depending on who exits.
#[derive(Debug, PartialEq, Eq)]
enum Teardown {
    /// Another process: nothing recorded here is ours.
    Skip,
    /// Owner process, other thread: the entries are ours but the kernel
    /// refuses to disable from this task.
    DrainAndAbandon,
    DrainAndClose,
}

fn teardown_for(owner: Pid, owner_task: Pid, pid: Pid, tid: Pid) -> Teardown {
    if pid != owner {
        Teardown::Skip
    } else if tid != owner_task {
        Teardown::DrainAndAbandon
    } else {
        Teardown::DrainAndClose
    }
}

impl LocalAgent {
    fn start() -> Option<Self> {
        match CoverageSession::open(Mode::Local) {
            Ok(session) => Some(LocalAgent {
                session,
                owner: getpid(),
                owner_task: gettid(),
                log_path: local_log_path(),
            }),
            Err(e) => {
                warn!("local coverage disabled: {}", e);
                None
            }
        }
    }

    fn finish(mut self) {
        let teardown = teardown_for(self.owner, self.owner_task, getpid(), gettid());
        if teardown == Teardown::Skip {
            debug!("not the process that enabled coverage, skipping local log");
            self.session.abandon();
            return;
        }

        // Snapshot before touching the filesystem so that writing the log
        // doesn't show up in it.
        let entries: Vec<RawLogEntry> = match self.session.drain() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("reading local coverage failed: {}", e);
                Vec::new()
            }
        };
        match teardown {
            Teardown::DrainAndAbandon => self.session.abandon(),
            _ => self.session.close(),
        }

        if let Err(e) = write_log(&self.log_path, &entries, LogWriteMode::Append) {
            warn!(
                "writing local coverage to {} failed: {}",
                self.log_path.display(),
                e
            );
            return;
        }
        debug!(
            "wrote {} local entries to {}",
            entries.len(),
            self.log_path.display()
        );
    }
}

fn local_log_path() -> PathBuf {
    match env::var_os(LOCAL_LOG_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(LOCAL_LOG),
    }
}

fn setup_logging() {
    let level = env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|level| Level::from_str(&level).ok())
        .unwrap_or(Level::WARN);
    // The host program might have its own subscriber; ours only has to
    // exist for the agent's diagnostics and never goes to stdout.
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .try_init();
}

fn agent_init() {
    setup_logging();
    let agent = LocalAgent::start();
    if let Ok(mut slot) = AGENT.lock() {
        *slot = agent;
    }
}

fn agent_fini() {
    let agent = match AGENT.lock() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(agent) = agent {
        agent.finish();
    }
}

extern "C" fn on_load() {
    let _ = panic::catch_unwind(agent_init);
}

extern "C" fn on_exit() {
    let _ = panic::catch_unwind(agent_fini);
}

#[cfg(all(target_os = "linux", not(test)))]
#[link_section = ".init_array"]
#[used]
static INIT: extern "C" fn() = on_load;

#[cfg(all(target_os = "linux", not(test)))]
#[link_section = ".fini_array"]
#[used]
static FINI: extern "C" fn() = on_exit;
