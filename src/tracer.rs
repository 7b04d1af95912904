use std::ffi::OsStr;
use std::fs;

use anyhow::{Context, Result};
use kcover_session::LOCAL_LOG_ENV;
use tracing::{debug, info, span, warn, Level};

use crate::config::KcoverConfig;
use crate::launcher::{locate_agent, run_instrumented, ExitStatus};
use crate::merge::merge_logs;
use crate::remote::RemoteCapture;
use crate::report::ReportInvoker;
use crate::util::remove_if_exists;

/// Runs `command` under coverage and produces the merged log.
///
/// Fails only when the command could not be run at all. Once it ran, its
/// exit status is returned whatever happens to the logs or the report.
pub fn run<S: AsRef<OsStr>>(config: &KcoverConfig, command: &[S]) -> Result<ExitStatus> {
    let remote = RemoteCapture::start(&config.kcov_device)
        .context("failed to set up remote coverage")?;

    // Left behind by an interrupted run. The agent appends, so they would
    // end up in this run's log.
    for stale in [&config.local_log, &config.remote_log] {
        match remove_if_exists(stale) {
            Ok(true) => debug!("removed stale {}", stale.display()),
            Ok(false) => {}
            Err(e) => warn!("failed to remove stale {}: {}", stale.display(), e),
        }
    }

    let agent = match locate_agent(&config.agent) {
        Ok(agent) => Some(agent),
        Err(e) => {
            warn!("{}, local coverage won't be collected", e);
            None
        }
    };

    let status = run_instrumented(
        command,
        agent,
        &[(LOCAL_LOG_ENV, config.local_log.as_os_str())],
    )
    .context("failed to run the traced command")?;
    info!("traced command finished with {}", status);

    if let Err(e) = remote.finish(&config.remote_log) {
        warn!("remote coverage lost: {:#}", e);
    }

    merge_and_report(config);
    Ok(status)
}

/// Merges the partial logs and runs the report generator. Problems are only
/// logged.
pub fn merge_and_report(config: &KcoverConfig) {
    let _span = span!(Level::DEBUG, "merge_and_report").entered();

    match merge_logs(&config.local_log, &config.remote_log, &config.merged_log) {
        Ok(summary) => info!(
            "wrote {} entries to {} ({} local, {} remote)",
            summary.total(),
            config.merged_log.display(),
            summary.local_lines,
            summary.remote_lines
        ),
        Err(e) => warn!("merging coverage logs failed: {:#}", e),
    }

    if let Ok(metadata) = fs::metadata(&config.merged_log) {
        debug!(
            "{} is {} bytes",
            config.merged_log.display(),
            metadata.len()
        );
    }

    let invoker = ReportInvoker::for_reporter(&config.reporter, config.report_hints.clone())
        .working_dir(config.output_dir());
    match invoker.run() {
        Ok(status) if status.success() => info!("report generated"),
        Ok(status) => warn!("report generator failed with {}", status),
        Err(e) => warn!("{}", e),
    }
}
