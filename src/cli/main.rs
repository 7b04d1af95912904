use std::env;
use std::io::IsTerminal;
use std::process;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use kcover_session::SessionError;
use tracing::{debug, error, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::FmtSubscriber;

use kcover::system_info::SystemInfo;
use kcover::tracer;
use kcover::util::executable_dir;

mod args;

use crate::args::CliArgs;

/// Exit code when the traced command never ran.
const SETUP_FAILURE_EXIT_CODE: i32 = 1;

fn parse_args() -> CliArgs {
    match CliArgs::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => process::exit(0),
                _ => process::exit(SETUP_FAILURE_EXIT_CODE),
            }
        }
    }
}

/// Explains why coverage could not be set up on this host.
fn report_setup_failure(args: &CliArgs) {
    let system_info = match SystemInfo::new(&args.kcov_device) {
        Ok(system_info) => system_info,
        Err(e) => {
            error!("Failed to detect system info: {:#}", e);
            return;
        }
    };
    error!("system_info = {:?}", system_info);
    if let Some(hint) = system_info.hint() {
        error!("{}", hint);
    }
}

fn run(args: &CliArgs) -> anyhow::Result<i32> {
    let working_dir = env::current_dir().context("failed to get the working directory")?;
    let config = args.config().resolve(&working_dir, &executable_dir()?);
    debug!("config = {:?}", config);

    let status = tracer::run(&config, &args.command)?;
    Ok(status.exit_code())
}

fn main() {
    let args = parse_args();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::from(args.logging.clone()))
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    match run(&args) {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            if e.downcast_ref::<SessionError>().is_some() {
                report_setup_failure(&args);
            }
            process::exit(SETUP_FAILURE_EXIT_CODE);
        }
    }
}
