use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};

use thiserror::Error;
use tracing::debug;

/// Options forwarded to the report generator untouched. They don't change
/// what gets captured.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReportHints {
    pub kernel_src: Option<PathBuf>,
    pub vmlinux: Option<PathBuf>,
    pub filter: Option<String>,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("could not start report generator {program:?}: {source}")]
    Spawn {
        program: OsString,
        #[source]
        source: io::Error,
    },

    #[error("waiting for report generator {program:?} failed: {source}")]
    Wait {
        program: OsString,
        #[source]
        source: io::Error,
    },
}

/// Runs the external program that turns the merged log into a report.
#[derive(Debug, Clone)]
pub struct ReportInvoker {
    program: OsString,
    leading_args: Vec<OsString>,
    hints: ReportHints,
    working_dir: Option<PathBuf>,
}

impl ReportInvoker {
    pub fn new(program: impl Into<OsString>, hints: ReportHints) -> Self {
        ReportInvoker {
            program: program.into(),
            leading_args: Vec::new(),
            hints,
            working_dir: None,
        }
    }

    /// Picks how to start `reporter`: Python scripts go through `python3`,
    /// anything else is executed directly.
    pub fn for_reporter(reporter: &Path, hints: ReportHints) -> Self {
        if reporter.extension().is_some_and(|ext| ext == "py") {
            ReportInvoker::new("python3", hints).leading_arg(reporter)
        } else {
            ReportInvoker::new(reporter, hints)
        }
    }

    /// Argument passed before the report options, e.g. a script path.
    pub fn leading_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.leading_args.push(arg.into());
        self
    }

    /// Directory the generator runs in, and where it looks for the merged
    /// log. Defaults to ours.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn args(&self) -> Vec<OsString> {
        let mut args = self.leading_args.clone();
        args.push("--mode".into());
        args.push("merge".into());
        if let Some(kernel_src) = &self.hints.kernel_src {
            args.push("--kernel-src".into());
            args.push(kernel_src.into());
        }
        if let Some(vmlinux) = &self.hints.vmlinux {
            args.push("--vmlinux".into());
            args.push(vmlinux.into());
        }
        if let Some(filter) = &self.hints.filter {
            args.push("--filter".into());
            args.push(filter.into());
        }
        args
    }

    /// Runs the generator to completion. A non-zero exit is returned as is,
    /// callers decide how much they care.
    pub fn run(&self) -> Result<ExitStatus, ReportError> {
        let mut command = Command::new(&self.program);
        command.args(self.args());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        debug!("running report generator {:?}", command);

        let mut child = command.spawn().map_err(|source| ReportError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        child.wait().map_err(|source| ReportError::Wait {
            program: self.program.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_hints() -> ReportHints {
        ReportHints {
            kernel_src: Some(PathBuf::from("/src/linux")),
            vmlinux: Some(PathBuf::from("/src/linux/vmlinux")),
            filter: Some("ext4".to_string()),
        }
    }

    #[test]
    fn merge_mode_without_hints() {
        let invoker = ReportInvoker::new("kcover-report", ReportHints::default());
        insta::assert_debug_snapshot!(invoker.args(), @r###"
        [
            "--mode",
            "merge",
        ]
        "###);
    }

    #[test]
    fn hints_are_forwarded_verbatim() {
        let invoker = ReportInvoker::new("kcover-report", all_hints());
        insta::assert_debug_snapshot!(invoker.args(), @r###"
        [
            "--mode",
            "merge",
            "--kernel-src",
            "/src/linux",
            "--vmlinux",
            "/src/linux/vmlinux",
            "--filter",
            "ext4",
        ]
        "###);
    }

    #[test]
    fn only_supplied_hints_are_forwarded() {
        let hints = ReportHints {
            filter: Some("ext4".to_string()),
            kernel_src: Some(PathBuf::from("/src/linux")),
            ..Default::default()
        };
        let args = ReportInvoker::new("kcover-report", hints).args();
        assert_eq!(
            args,
            vec!["--mode", "merge", "--kernel-src", "/src/linux", "--filter", "ext4"]
        );
    }

    #[test]
    fn python_reporters_go_through_the_interpreter() {
        let invoker = ReportInvoker::for_reporter(Path::new("/opt/kcover/report.py"), all_hints());
        assert_eq!(invoker.program, "python3");
        assert_eq!(invoker.args()[0], "/opt/kcover/report.py");
        assert_eq!(invoker.args()[1..3], ["--mode", "merge"]);

        let invoker =
            ReportInvoker::for_reporter(Path::new("/opt/kcover/kcover-report"), all_hints());
        assert_eq!(invoker.program, "/opt/kcover/kcover-report");
        assert_eq!(invoker.args()[0], "--mode");
    }

    #[test]
    fn generator_sees_the_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let status = ReportInvoker::new("sh", all_hints())
            .leading_arg("-c")
            .leading_arg(r#"printf '%s\n' "$@" > args.txt"#)
            .leading_arg("kcover-report")
            .working_dir(dir.path())
            .run()
            .unwrap();

        assert!(status.success());
        let recorded = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert_eq!(
            recorded,
            "--mode\nmerge\n--kernel-src\n/src/linux\n--vmlinux\n/src/linux/vmlinux\n--filter\next4\n"
        );
    }

    #[test]
    fn failing_generator_reports_its_status() {
        let status = ReportInvoker::new("sh", ReportHints::default())
            .leading_arg("-c")
            .leading_arg("exit 3")
            .run()
            .unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn missing_generator() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReportInvoker::new(dir.path().join("kcover-report"), ReportHints::default())
            .run()
            .unwrap_err();
        assert!(matches!(err, ReportError::Spawn { .. }));
    }
}
