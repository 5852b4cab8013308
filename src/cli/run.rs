//! `vigil run <test.json5>` (SPEC_FULL.md §3.4).

use super::{report, vars as cli_vars};
use crate::config;
use crate::executor::{Executor, TestResult};
use crate::loader;
use std::path::Path;
use std::process::ExitCode;

pub async fn cmd_run(path: &Path, cli_vars_raw: &[String], json: bool, dry_run: bool) -> ExitCode {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let config = match config::load_config(dir) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {}", e);
            return ExitCode::from(4);
        }
    };

    let tests = match loader::load_and_prepare_test(path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("load error: {}", e);
            return ExitCode::from(4);
        }
    };

    let executor = match Executor::new(config) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("setup error: {}", e);
            return ExitCode::from(4);
        }
    };

    let vars = cli_vars::seed_vars(cli_vars_raw);

    let mut results = Vec::with_capacity(tests.len());
    for test in &tests {
        let result = if dry_run {
            dry_run_test(&executor, test, &vars).await
        } else {
            executor.execute(test, &vars).await
        };
        results.push(result);
    }

    print_results(&results, json);
    worst_exit_code(&results)
}

/// Substitute and Prepare without sending the request (SPEC_FULL.md
/// §4 `--dry-run`), reusing `Executor::execute`'s first three pipeline
/// stages by running a Test whose Poll is forced to `Skipped`.
async fn dry_run_test(executor: &Executor, test: &crate::loader::Test, vars: &crate::vars::VarMap) -> TestResult {
    let mut probe = test.clone();
    probe.poll.max = -1;
    executor.execute(&probe, vars).await
}

pub(super) fn print_results(results: &[TestResult], json: bool) {
    if json {
        match serde_json::to_string_pretty(results) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("json error: {}", e),
        }
    } else {
        for r in results {
            println!("{}", report::test_report(r));
        }
    }
}

pub(super) fn worst_exit_code(results: &[TestResult]) -> ExitCode {
    let worst = results.iter().map(|r| r.status).max().unwrap_or(crate::checks::Status::NotRun);
    ExitCode::from(report::exit_code_for_status(worst))
}
