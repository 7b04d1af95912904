use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::fmt;
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use thiserror::Error;
use tracing::{debug, warn};

/// Makes the dynamic loader load the agent before the program's own code.
pub const PRELOAD_ENV: &str = "LD_PRELOAD";

/// Exit code of the child when the command could not be executed.
pub const EXEC_FAILED_EXIT_CODE: i32 = 127;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no command to run")]
    EmptyCommand,

    #[error("{0:?} contains a NUL byte")]
    InvalidArgument(OsString),

    #[error("coverage agent not found at {}", .0.display())]
    AgentNotFound(PathBuf),

    #[error("fork failed: {0}")]
    Fork(#[source] Errno),

    #[error("waiting for pid {pid} failed: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: Errno,
    },
}

/// How the traced command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited with the given code.
    Exited(i32),
    /// Killed by a signal, with or without a coredump.
    Signaled(Signal, bool),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        *self == ExitStatus::Exited(0)
    }

    /// Exit code to report for this status. Signals map to `128 + signo`,
    /// like shells do.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal, _) => 128 + *signal as i32,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {}", code),
            ExitStatus::Signaled(signal, true) => write!(f, "signal {} (core dumped)", signal),
            ExitStatus::Signaled(signal, false) => write!(f, "signal {}", signal),
        }
    }
}

fn to_cstring(s: &OsStr) -> Result<CString, LaunchError> {
    CString::new(s.as_bytes()).map_err(|_| LaunchError::InvalidArgument(s.to_os_string()))
}

/// A command that gets the coverage agent injected when spawned.
///
/// The environment is assembled here and handed to the child as a whole, so
/// the tracer's own environment is never modified.
#[derive(Debug)]
pub struct InstrumentedCommand {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl InstrumentedCommand {
    /// `command[0]` is looked up in `PATH` like a shell would.
    pub fn new<S: AsRef<OsStr>>(command: &[S]) -> Result<Self, LaunchError> {
        let Some(program) = command.first() else {
            return Err(LaunchError::EmptyCommand);
        };
        Ok(InstrumentedCommand {
            program: program.as_ref().to_os_string(),
            args: command.iter().map(|a| a.as_ref().to_os_string()).collect(),
            env: env::vars_os().collect(),
        })
    }

    /// Sets a variable in the child's environment only.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        let key = key.as_ref();
        let value = value.as_ref().to_os_string();
        match self.env.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.env.push((key.to_os_string(), value)),
        }
        self
    }

    fn env_value(&self, key: &str) -> Option<&OsStr> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    /// Preloads `agent` into the child. Objects that were already being
    /// preloaded keep being preloaded, after the agent.
    pub fn preload(self, agent: &Path) -> Self {
        let mut preload = agent.as_os_str().to_os_string();
        if let Some(existing) = self.env_value(PRELOAD_ENV).filter(|v| !v.is_empty()) {
            preload.push(":");
            preload.push(existing);
        }
        self.env(PRELOAD_ENV, preload)
    }

    /// Forks and executes the command in the child.
    pub fn spawn(self) -> Result<Tracee, LaunchError> {
        // Everything the child needs is allocated up front: after forking a
        // (possibly multithreaded) process only async-signal-safe calls are
        // allowed.
        let program = to_cstring(&self.program)?;
        let args = self
            .args
            .iter()
            .map(|arg| to_cstring(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let env = self
            .env
            .iter()
            .map(|(k, v)| {
                let mut pair = k.clone();
                pair.push("=");
                pair.push(v);
                to_cstring(&pair)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let exec_error = CString::new(format!(
            "kcover: failed to execute {}\n",
            self.program.to_string_lossy()
        ))
        .unwrap_or_default();

        let argv = null_terminated(&args);
        let envp = null_terminated(&env);

        match unsafe { fork() }.map_err(LaunchError::Fork)? {
            ForkResult::Parent { child } => {
                debug!("spawned {:?} as pid {}", self.program, child);
                Ok(Tracee {
                    pid: child,
                    status: None,
                })
            }
            ForkResult::Child => unsafe {
                libc::execvpe(program.as_ptr(), argv.as_ptr(), envp.as_ptr());
                let msg = exec_error.as_bytes();
                libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
                libc::_exit(EXEC_FAILED_EXIT_CODE)
            },
        }
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// The forked child. Reaped on drop if nobody waited for it.
#[derive(Debug)]
pub struct Tracee {
    pid: Pid,
    status: Option<ExitStatus>,
}

impl Tracee {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Blocks until the child terminates. There's no timeout.
    pub fn wait(&mut self) -> Result<ExitStatus, LaunchError> {
        if let Some(status) = self.status {
            return Ok(status);
        }

        let status = loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => break ExitStatus::Exited(code),
                Ok(WaitStatus::Signaled(_, signal, core_dumped)) => {
                    break ExitStatus::Signaled(signal, core_dumped)
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(LaunchError::Wait {
                        pid: self.pid,
                        source,
                    })
                }
            }
        };
        debug!("pid {} terminated with {}", self.pid, status);
        self.status = Some(status);
        Ok(status)
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        if self.status.is_none() {
            if let Err(e) = self.wait() {
                warn!("{}", e);
            }
        }
    }
}

/// Checks that the agent shared object exists. `agent` is normally
/// resolved against the directory holding the tracer binary.
pub fn locate_agent(agent: &Path) -> Result<&Path, LaunchError> {
    if agent.is_file() {
        Ok(agent)
    } else {
        Err(LaunchError::AgentNotFound(agent.to_path_buf()))
    }
}

/// Runs `command` with `agent` preloaded and waits for it.
pub fn run_instrumented<S: AsRef<OsStr>>(
    command: &[S],
    agent: Option<&Path>,
    extra_env: &[(&str, &OsStr)],
) -> Result<ExitStatus, LaunchError> {
    let mut instrumented = InstrumentedCommand::new(command)?;
    for (key, value) in extra_env {
        instrumented = instrumented.env(key, value);
    }
    if let Some(agent) = agent {
        instrumented = instrumented.preload(agent);
    }
    let mut tracee = instrumented.spawn()?;
    tracee.wait()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> InstrumentedCommand {
        InstrumentedCommand::new(&["sh", "-c", script]).unwrap()
    }

    #[test]
    fn exit_code_is_reported() {
        let status = sh("exit 7").spawn().unwrap().wait().unwrap();
        assert_eq!(status, ExitStatus::Exited(7));
        assert_eq!(status.exit_code(), 7);
        assert!(!status.success());
    }

    #[test]
    fn signals_are_reported() {
        let status = sh("kill -TERM $$").spawn().unwrap().wait().unwrap();
        assert_eq!(status, ExitStatus::Signaled(Signal::SIGTERM, false));
        assert_eq!(status.exit_code(), 143);
    }

    #[test]
    fn exec_failure_exits_with_127() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-program");
        let mut tracee = InstrumentedCommand::new(&[missing]).unwrap().spawn().unwrap();
        assert_eq!(tracee.wait().unwrap(), ExitStatus::Exited(EXEC_FAILED_EXIT_CODE));
    }

    #[test]
    fn wait_is_idempotent() {
        let mut tracee = sh("exit 3").spawn().unwrap();
        assert_eq!(tracee.wait().unwrap(), ExitStatus::Exited(3));
        assert_eq!(tracee.wait().unwrap(), ExitStatus::Exited(3));
    }

    #[test]
    fn agent_is_preloaded_in_the_child_only() {
        // The loader complains about the missing object and carries on.
        let status = sh(r#"test "$LD_PRELOAD" = /opt/kcover/libkcover_agent.so"#)
            .env(PRELOAD_ENV, "")
            .preload(Path::new("/opt/kcover/libkcover_agent.so"))
            .spawn()
            .unwrap()
            .wait()
            .unwrap();
        assert!(status.success());
    }

    #[test]
    fn existing_preloads_are_kept() {
        let command = sh("true")
            .env(PRELOAD_ENV, "/usr/lib/libother.so")
            .preload(Path::new("/opt/kcover/libkcover_agent.so"));
        assert_eq!(
            command.env_value(PRELOAD_ENV),
            Some(OsStr::new(
                "/opt/kcover/libkcover_agent.so:/usr/lib/libother.so"
            ))
        );
    }

    #[test]
    fn child_environment_does_not_leak() {
        let status = sh(r#"test "$KCOVER_LAUNCHER_TEST" = child"#)
            .env("KCOVER_LAUNCHER_TEST", "child")
            .spawn()
            .unwrap()
            .wait()
            .unwrap();
        assert!(status.success());
        assert!(env::var_os("KCOVER_LAUNCHER_TEST").is_none());
    }

    #[test]
    fn arguments_are_passed_verbatim() {
        let script = r#"test "$1" = "--filter" && test "$2" = "a b""#;
        let status = InstrumentedCommand::new(&["sh", "-c", script, "sh", "--filter", "a b"])
            .unwrap()
            .spawn()
            .unwrap()
            .wait()
            .unwrap();
        assert!(status.success());
    }

    #[test]
    fn invalid_commands() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            InstrumentedCommand::new(&empty),
            Err(LaunchError::EmptyCommand)
        ));
        assert!(matches!(
            InstrumentedCommand::new(&["true", "a\0b"]).unwrap().spawn(),
            Err(LaunchError::InvalidArgument(_))
        ));
    }

    #[test]
    fn agent_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("libkcover_agent.so");
        let err = locate_agent(&agent).unwrap_err();
        assert!(matches!(err, LaunchError::AgentNotFound(path) if path == agent));

        std::fs::write(&agent, b"").unwrap();
        assert_eq!(locate_agent(&agent).unwrap(), agent.as_path());
        assert!(locate_agent(dir.path()).is_err());
    }

    #[test]
    fn run_instrumented_passes_extra_env() {
        let status = run_instrumented(
            &["sh", "-c", r#"test "$KCOVER_LOCAL_LOG" = /tmp/local_coverage.log"#],
            None,
            &[("KCOVER_LOCAL_LOG", OsStr::new("/tmp/local_coverage.log"))],
        )
        .unwrap();
        assert!(status.success());
    }
}
