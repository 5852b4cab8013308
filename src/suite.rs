//! Suite runner (spec §4.9): setup/tests/teardown sequencing, a shared
//! cookie jar, variable propagation between Tests, and aggregate Status.
//!
//! Grounded on the teacher's `completeness/suite.rs` setup/body
//! sequencing and aggregate-status-by-max pattern.

use crate::checks::Status;
use crate::config::VigilConfig;
use crate::error::Result;
use crate::executor::{Executor, TestResult};
use crate::loader::{resolve_suite_entry, Suite};
use crate::vars::VarMap;
use std::sync::Arc;

/// The outcome of one Suite run: every Test result plus the aggregate
/// Status (spec §3 "a Suite's status is the maximum of its Tests'").
#[derive(Debug, Clone)]
pub struct SuiteResult {
    pub name: String,
    pub setup: Vec<TestResult>,
    pub tests: Vec<TestResult>,
    pub teardown: Vec<TestResult>,
    pub status: Status,
}

impl SuiteResult {
    fn all(&self) -> impl Iterator<Item = &TestResult> {
        self.setup.iter().chain(self.tests.iter()).chain(self.teardown.iter())
    }

    pub fn has_failures(&self) -> bool {
        self.all().any(|t| t.status >= Status::Fail)
    }
}

/// Run a Suite to completion (spec §4.9 steps 1-5).
pub async fn run_suite(suite: &Suite, config: VigilConfig, base_vars: &VarMap) -> Result<SuiteResult> {
    run_suite_with_options(suite, config, base_vars, false).await
}

/// Like `run_suite`, but `dry_run` forces every entry's Poll to
/// `Skipped` (SPEC_FULL.md §4 `--dry-run`): substitution and Prepare
/// still run for every Check/Extractor, but no entry ever dispatches a
/// request.
pub async fn run_suite_with_options(
    suite: &Suite,
    config: VigilConfig,
    base_vars: &VarMap,
    dry_run: bool,
) -> Result<SuiteResult> {
    let suite_dir = suite
        .source_path
        .as_deref()
        .and_then(|p| p.parent())
        .map(|p| p.to_path_buf())
        .unwrap_or_default();

    // 1. Build a shared cookie jar if KeepCookies.
    let jar = suite.keep_cookies.then(|| Arc::new(reqwest::cookie::Jar::default()));
    let executor = Executor::with_cookie_jar(config, jar)?;

    let mut vars = base_vars.clone();
    for (k, v) in &suite.variables {
        vars.entry(k.clone()).or_insert_with(|| v.clone());
    }

    // 2. Run setup tests sequentially; propagate extractions forward.
    let mut setup_results = Vec::new();
    let mut setup_failed = false;
    for entry in &suite.setup {
        let tests = resolve_suite_entry(entry, &suite_dir)?;
        for mut test in tests {
            if dry_run {
                test.poll.max = -1;
            }
            let result = executor.execute_with_options(&test, &vars, suite.omit_checks).await;
            if result.status >= Status::Fail {
                setup_failed = true;
            }
            for (k, v) in result.variables() {
                vars.insert(k, v);
            }
            setup_results.push(result);
        }
    }

    // 3. Run main tests sequentially, or mark Skipped if Setup failed.
    let mut test_results = Vec::new();
    for entry in &suite.tests {
        let tests = resolve_suite_entry(entry, &suite_dir)?;
        for mut test in tests {
            if dry_run {
                test.poll.max = -1;
            }
            let result = if setup_failed {
                skipped(&test.name)
            } else {
                let r = executor.execute_with_options(&test, &vars, suite.omit_checks).await;
                for (k, v) in r.variables() {
                    vars.insert(k, v);
                }
                r
            };
            test_results.push(result);
        }
    }

    // 4. Run teardown tests unconditionally.
    let mut teardown_results = Vec::new();
    for entry in &suite.teardown {
        let tests = resolve_suite_entry(entry, &suite_dir)?;
        for mut test in tests {
            if dry_run {
                test.poll.max = -1;
            }
            let result = executor.execute_with_options(&test, &vars, suite.omit_checks).await;
            for (k, v) in result.variables() {
                vars.insert(k, v);
            }
            teardown_results.push(result);
        }
    }

    // 5. Aggregate Status = max over all tests.
    let status = setup_results
        .iter()
        .chain(test_results.iter())
        .chain(teardown_results.iter())
        .map(|t| t.status)
        .max()
        .unwrap_or(Status::NotRun);

    Ok(SuiteResult {
        name: suite.name.clone(),
        setup: setup_results,
        tests: test_results,
        teardown: teardown_results,
        status,
    })
}

fn skipped(name: &str) -> TestResult {
    TestResult {
        name: name.to_string(),
        status: Status::Skipped,
        checks: Vec::new(),
        extracted: Default::default(),
        error: Some("skipped: suite setup failed".to_string()),
        duration: std::time::Duration::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::SuiteEntry;

    #[test]
    fn suite_result_has_failures_detects_any_fail_status() {
        let result = SuiteResult {
            name: "s".to_string(),
            setup: vec![],
            tests: vec![TestResult {
                name: "t".to_string(),
                status: Status::Fail,
                checks: vec![],
                extracted: Default::default(),
                error: None,
                duration: std::time::Duration::default(),
            }],
            teardown: vec![],
            status: Status::Fail,
        };
        assert!(result.has_failures());
    }

    #[test]
    fn skipped_marks_status_skipped() {
        let r = skipped("t");
        assert_eq!(r.status, Status::Skipped);
    }

    #[test]
    fn suite_entry_inline_round_trips_through_json5() {
        let json = r#"{ "Name": "inline test", "Request": { "URL": "http://example.com" } }"#;
        let parsed: Result<SuiteEntry> =
            json5::from_str(json).map_err(|e| crate::error::Error::Load(e.to_string()));
        assert!(parsed.is_ok());
    }
}
