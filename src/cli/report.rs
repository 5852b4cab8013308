//! Human-readable and `--json` report formatting for `TestResult`/
//! `SuiteResult` (SPEC_FULL.md §3.4), in the teacher's terse
//! `to_report()`-style reporting idiom.

use crate::checks::Status;
use crate::executor::TestResult;
use crate::suite::SuiteResult;

/// Render one `TestResult` as a short human-readable report.
pub fn test_report(result: &TestResult) -> String {
    let mut out = format!("{} ... {} ({:?})", result.name, result.status, result.duration);
    if let Some(err) = &result.error {
        out.push_str(&format!("\n  error: {}", err));
    }
    for check in &result.checks {
        if check.status != Status::Pass {
            out.push_str(&format!("\n  [{}] {}: {}", check.status, check.name, check.error.as_deref().unwrap_or("")));
        }
    }
    for (name, value) in &result.extracted {
        match value {
            Ok(v) => out.push_str(&format!("\n  extracted {} = {:?}", name, v)),
            Err(e) => out.push_str(&format!("\n  extracted {} FAILED: {}", name, e)),
        }
    }
    out
}

/// Render a `SuiteResult` as a human-readable report: one line per
/// setup/test/teardown Test plus an aggregate status line.
pub fn suite_report(result: &SuiteResult) -> String {
    let mut out = format!("Suite {} ... {}\n", result.name, result.status);
    for (label, tests) in [("setup", &result.setup), ("tests", &result.tests), ("teardown", &result.teardown)] {
        if tests.is_empty() {
            continue;
        }
        out.push_str(&format!("-- {} --\n", label));
        for t in tests {
            out.push_str(&test_report(t));
            out.push('\n');
        }
    }
    out
}

/// Exit code for a single Test's Status (spec §6): 0 = Pass, 2 = Fail,
/// 3 = Error/Bogus. `Skipped`/`NotRun` are treated as success.
pub fn exit_code_for_status(status: Status) -> u8 {
    match status {
        Status::NotRun | Status::Skipped | Status::Pass => 0,
        Status::Fail => 2,
        Status::Error | Status::Bogus => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_spec_section_6() {
        assert_eq!(exit_code_for_status(Status::Pass), 0);
        assert_eq!(exit_code_for_status(Status::Skipped), 0);
        assert_eq!(exit_code_for_status(Status::Fail), 2);
        assert_eq!(exit_code_for_status(Status::Error), 3);
        assert_eq!(exit_code_for_status(Status::Bogus), 3);
    }
}
