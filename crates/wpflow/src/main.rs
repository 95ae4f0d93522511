//! wpflow: parallel work packages on git worktrees
//!
//! Thin command layer over `wpflow_coordination`. Logs go to stderr so
//! `--json` output on stdout stays machine-readable.
//!
//! # Usage
//!
//! ```bash
//! # Workspace for WP02, branched from its dependency's branch
//! wpflow implement WP02 --feature 001-auth
//!
//! # Lane changes are committed on the feature's target branch
//! wpflow move WP02 doing --feature 001-auth --note "picked up"
//!
//! # Inspect the plan, then merge everything into the target
//! wpflow merge --feature 001-auth --dry-run --json
//! wpflow merge --feature 001-auth --push
//!
//! # Bring an older project layout up to date
//! wpflow upgrade --dry-run
//! ```
//!
//! Exit codes: 0 success, 1 usage, 2 validation, 3 execution, 4 precondition.

mod cli;
mod commands;

use clap::error::ErrorKind;
use clap::Parser;
use std::process::ExitCode;
use wpflow_coordination::CoordError;

use cli::Cli;

/// Exit code for bad arguments
const EXIT_USAGE: u8 = 1;
/// Exit code for failures that are not coordination errors
const EXIT_EXECUTION: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(parse_exit_code(&err));
        }
    };

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match commands::run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err, cli.json);
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Help and version output succeed; every other argument error is usage
fn parse_exit_code(err: &clap::Error) -> u8 {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => EXIT_USAGE,
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<CoordError>()
        .and_then(|e| u8::try_from(e.exit_code()).ok())
        .unwrap_or(EXIT_EXECUTION)
}

fn report(err: &anyhow::Error, json: bool) {
    match err.downcast_ref::<CoordError>() {
        Some(coord) if json => println!("{}", coord.to_structured_json()),
        Some(coord) => eprintln!("error: {}", coord.with_suggestion()),
        None if json => println!(
            "{}",
            serde_json::json!({
                "code": "INTERNAL_ERROR",
                "category": "execution",
                "message": format!("{err:#}"),
            })
        ),
        None => eprintln!("error: {err:#}"),
    }
}
