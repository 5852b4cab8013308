//! `vigil suite <suite.json5>` (SPEC_FULL.md §3.4).

use super::{report, vars as cli_vars};
use crate::config;
use crate::loader;
use crate::suite as suite_runner;
use std::path::Path;
use std::process::ExitCode;

pub async fn cmd_suite(path: &Path, cli_vars_raw: &[String], json: bool, dry_run: bool) -> ExitCode {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let config = match config::load_config(dir) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {}", e);
            return ExitCode::from(4);
        }
    };

    let suite = match loader::load_suite_file(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("load error: {}", e);
            return ExitCode::from(4);
        }
    };

    let vars = cli_vars::seed_vars(cli_vars_raw);
    let result = match suite_runner::run_suite_with_options(&suite, config, &vars, dry_run).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("suite error: {}", e);
            return ExitCode::from(4);
        }
    };

    if json {
        match serde_json::to_string_pretty(&SuiteResultJson::from(&result)) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("json error: {}", e),
        }
    } else {
        println!("{}", report::suite_report(&result));
    }

    ExitCode::from(report::exit_code_for_status(result.status))
}

/// `SuiteResult` serializes field-by-field since it has no `Serialize`
/// derive of its own (its `Status` type does); a thin owned mirror
/// keeps `suite.rs` free of a `serde` dependency it otherwise has no
/// use for.
#[derive(serde::Serialize)]
struct SuiteResultJson<'a> {
    name: &'a str,
    status: crate::checks::Status,
    setup: &'a [crate::executor::TestResult],
    tests: &'a [crate::executor::TestResult],
    teardown: &'a [crate::executor::TestResult],
}

impl<'a> From<&'a suite_runner::SuiteResult> for SuiteResultJson<'a> {
    fn from(r: &'a suite_runner::SuiteResult) -> Self {
        SuiteResultJson {
            name: &r.name,
            status: r.status,
            setup: &r.setup,
            tests: &r.tests,
            teardown: &r.teardown,
        }
    }
}
