use std::path::{Path, PathBuf};

use kcover_session::{KCOV_PATH, LOCAL_LOG, MERGED_LOG, REMOTE_LOG};

use crate::report::ReportHints;
use crate::util::anchor;

/// File name of the coverage agent, shipped next to the `kcover` binary.
pub const AGENT_FILE_NAME: &str = "libkcover_agent.so";
/// File name of the default report generator, shipped next to the `kcover`
/// binary and run with `python3`.
pub const REPORTER_FILE_NAME: &str = "report.py";

/// Everything a coverage run needs to know.
///
/// The default values are relative: logs live in the working directory and
/// the shipped artifacts next to the binary. [`KcoverConfig::resolve`] turns
/// them into absolute paths.
#[derive(Debug, Clone, PartialEq)]
pub struct KcoverConfig {
    pub kcov_device: PathBuf,
    pub local_log: PathBuf,
    pub remote_log: PathBuf,
    pub merged_log: PathBuf,
    pub agent: PathBuf,
    pub reporter: PathBuf,
    pub report_hints: ReportHints,
}

impl Default for KcoverConfig {
    fn default() -> Self {
        Self {
            kcov_device: PathBuf::from(KCOV_PATH),
            local_log: PathBuf::from(LOCAL_LOG),
            remote_log: PathBuf::from(REMOTE_LOG),
            merged_log: PathBuf::from(MERGED_LOG),
            agent: PathBuf::from(AGENT_FILE_NAME),
            reporter: PathBuf::from(REPORTER_FILE_NAME),
            report_hints: ReportHints::default(),
        }
    }
}

impl KcoverConfig {
    /// Anchors the logs at `working_dir` and the agent and reporter at
    /// `executable_dir`. Absolute paths are kept as they are.
    pub fn resolve(self, working_dir: &Path, executable_dir: &Path) -> Self {
        Self {
            local_log: anchor(working_dir, &self.local_log),
            remote_log: anchor(working_dir, &self.remote_log),
            merged_log: anchor(working_dir, &self.merged_log),
            agent: anchor(executable_dir, &self.agent),
            reporter: anchor(executable_dir, &self.reporter),
            ..self
        }
    }

    /// Directory the merged log is written to.
    pub fn output_dir(&self) -> &Path {
        self.merged_log.parent().unwrap_or_else(|| Path::new("."))
    }
}
