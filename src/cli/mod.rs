//! CLI command implementations (SPEC_FULL.md §3.4).
//!
//! Organized the way the teacher splits `cli/` by command group
//! (`simple`/`project`/`config`): `run`/`suite` drive the execution
//! pipeline, `registry` handles introspection (`list`/`check`), and
//! `report` formats a `TestResult`/`SuiteResult` for a human or for
//! `--json`.

pub mod registry;
pub mod report;
pub mod run;
pub mod suite;
pub mod vars;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// vigil — a declarative HTTP integration-testing engine.
#[derive(Parser, Debug)]
#[command(name = "vigil", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a single Test file.
    Run {
        /// Path to a Test file (JSON5).
        path: PathBuf,

        /// Seed a variable before substitution (repeatable, KEY=VALUE).
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Emit a machine-readable JSON report instead of text.
        #[arg(long)]
        json: bool,

        /// Substitute and Prepare every Check/Extractor without sending
        /// the request.
        #[arg(long = "dry-run")]
        dry_run: bool,

        /// Increase log verbosity (stacks: -v, -vv, -vvv).
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
    },

    /// Run a Suite file.
    Suite {
        /// Path to a Suite file (JSON5).
        path: PathBuf,

        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        #[arg(long)]
        json: bool,

        #[arg(long = "dry-run")]
        dry_run: bool,

        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
    },

    /// Print the registered fields for a Check or Extractor.
    Check {
        /// Check or Extractor name (e.g. `StatusCode`, `JSONExtractor`).
        name: String,
    },

    /// List every registered Check and Extractor name.
    List,
}

/// Parse `argv`, dispatch, and return the process exit code (spec §6).
pub async fn main(argv: impl Iterator<Item = String>) -> ExitCode {
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(e) => {
            // clap already printed usage/help/errors to the right stream.
            e.print().ok();
            return if e.use_stderr() { ExitCode::from(4) } else { ExitCode::SUCCESS };
        }
    };

    match cli.command {
        Command::Run { path, vars, json, dry_run, verbose } => {
            init_tracing(verbose);
            run::cmd_run(&path, &vars, json, dry_run).await
        }
        Command::Suite { path, vars, json, dry_run, verbose } => {
            init_tracing(verbose);
            suite::cmd_suite(&path, &vars, json, dry_run).await
        }
        Command::Check { name } => registry::cmd_check(&name),
        Command::List => registry::cmd_list(),
    }
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
