use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;
use kcover::config::KcoverConfig;
use kcover::report::ReportHints;
use tracing::Level;

#[derive(clap::ValueEnum, Debug, Clone, Default, PartialEq)]
pub(crate) enum LoggingLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LoggingLevel> for Level {
    fn from(level: LoggingLevel) -> Self {
        match level {
            LoggingLevel::Trace => Level::TRACE,
            LoggingLevel::Debug => Level::DEBUG,
            LoggingLevel::Info => Level::INFO,
            LoggingLevel::Warn => Level::WARN,
            LoggingLevel::Error => Level::ERROR,
        }
    }
}

/// Collects kernel code coverage for a command and everything it starts.
#[derive(Parser, Debug)]
#[command(version)]
pub(crate) struct CliArgs {
    /// Kernel source tree, forwarded to the report generator
    #[arg(long, value_name = "PATH")]
    pub(crate) kernel_src: Option<PathBuf>,
    /// Kernel image with symbols, forwarded to the report generator
    #[arg(long, value_name = "FILE")]
    pub(crate) vmlinux: Option<PathBuf>,
    /// Only report locations matching this keyword, forwarded to the report
    /// generator
    #[arg(long, value_name = "KEYWORD")]
    pub(crate) filter: Option<String>,
    /// Set kcover's logging level
    #[arg(long, default_value_t, value_enum, env = "KCOVER_LOG")]
    pub(crate) logging: LoggingLevel,
    /// Report generator to run on the merged log [default: report.py next
    /// to the kcover binary]
    #[arg(long, value_name = "PATH", env = "KCOVER_REPORTER")]
    pub(crate) reporter: Option<PathBuf>,
    #[arg(long, hide = true, env = "KCOVER_DEVICE",
        default_value = KcoverConfig::default().kcov_device.into_os_string())]
    pub(crate) kcov_device: PathBuf,
    /// Command to trace, with its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true,
        value_name = "COMMAND")]
    pub(crate) command: Vec<OsString>,
}

impl CliArgs {
    pub(crate) fn report_hints(&self) -> ReportHints {
        ReportHints {
            kernel_src: self.kernel_src.clone(),
            vmlinux: self.vmlinux.clone(),
            filter: self.filter.clone(),
        }
    }

    /// Configuration before paths are resolved.
    pub(crate) fn config(&self) -> KcoverConfig {
        let defaults = KcoverConfig::default();
        KcoverConfig {
            kcov_device: self.kcov_device.clone(),
            reporter: self.reporter.clone().unwrap_or(defaults.reporter.clone()),
            report_hints: self.report_hints(),
            ..defaults
        }
    }
}
