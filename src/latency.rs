//! The concurrent Latency check (spec §4.7): sample a Test's response
//! time under K workers, estimate percentiles via the R-8 (Hyndman-Fan
//! type 8) quantile formula, and fail if any declared limit is exceeded.
//!
//! Grounded in `tokio::sync::mpsc` worker/channel idioms; unlike a
//! `Check::execute`, this runs concurrently and owns its own `Executor`
//! clones, so it lives outside the `Check` enum's `execute` match arm
//! (which rejects `Latency` outright) and is invoked by the executor's
//! check loop as a special case.

use crate::checks::{parse_percentile_limits, LatencyCheck, Status};
use crate::executor::{CheckResult, Executor};
use crate::loader::Test;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const HARD_BUDGET: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
struct Sample {
    worker_id: usize,
    started: DateTime<Utc>,
    duration: Duration,
    status: Status,
    complete: bool,
}

/// Run one `Latency` Check end to end (spec §4.7 steps 1-6). Always
/// returns a `CheckResult` named `"Latency"`.
pub async fn run(executor: Executor, test: &Test, params: &LatencyCheck) -> CheckResult {
    let limits = match parse_percentile_limits(&params.limits) {
        Ok(l) => l,
        Err(e) => {
            return CheckResult {
                name: "Latency".to_string(),
                status: Status::Bogus,
                error: Some(e),
            }
        }
    };

    let sample_test = strip_latency_checks(test, params.skip_checks);
    let concurrent = params.concurrent.max(1);

    let warmup_avg = warmup(&executor, &sample_test, concurrent).await;
    let stagger = warmup_avg / concurrent as u32;

    let (tx, mut rx) = mpsc::channel::<Sample>(concurrent * 4);
    let deadline = Instant::now() + HARD_BUDGET;
    let mut handles = Vec::with_capacity(concurrent);

    for worker_id in 0..concurrent {
        let worker_executor = spawn_worker_executor(&executor, params.individual_sessions);
        let test_clone = sample_test.clone();
        let tx = tx.clone();
        let delay = stagger * worker_id as u32;
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            loop {
                if Instant::now() >= deadline {
                    break;
                }
                let started = Utc::now();
                let attempt_start = Instant::now();
                let (response, checks) = worker_executor.run_attempt(&test_clone).await;
                let duration = attempt_start.elapsed();
                let exec_status = if response.transport_error.is_some() { Status::Error } else { Status::Pass };
                let checks_status = checks.iter().map(|c| c.status).max().unwrap_or(Status::Pass);
                let status = exec_status.max(checks_status);
                let sample = Sample {
                    worker_id,
                    started,
                    duration,
                    status,
                    complete: true,
                };
                if tx.send(sample).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);

    let (samples, participating) = collect_until_n_passing(rx, params.n, deadline, concurrent).await;
    let passing = samples.iter().filter(|s| s.status == Status::Pass).count();
    for handle in handles {
        handle.abort();
    }

    if let Some(path) = &params.dump_to {
        dump_csv(path, test, concurrent, &samples);
    }

    let mut errors = Vec::new();
    if passing < params.n {
        errors.push(format!("timed out with {} of {} passing samples", passing, params.n));
    }
    if participating.iter().any(|contributed| !contributed) {
        errors.push("not every worker contributed a sample".to_string());
    }
    let failing = samples.iter().filter(|s| s.status != Status::Pass).count();
    if failing > 0 {
        errors.push(format!("{} of {} samples did not Pass", failing, samples.len()));
    }

    let mut durations: Vec<Duration> = samples
        .iter()
        .filter(|s| s.status == Status::Pass)
        .map(|s| s.duration)
        .collect();
    durations.sort();

    for limit in &limits {
        if let Some(q) = quantile_r8(&durations, limit.quantile) {
            if q > limit.max {
                errors.push(format!(
                    "{:.2}% = {}ms > limit {}ms",
                    limit.quantile,
                    q.as_millis(),
                    limit.max.as_millis()
                ));
            }
        }
    }

    if errors.is_empty() {
        CheckResult {
            name: "Latency".to_string(),
            status: Status::Pass,
            error: None,
        }
    } else {
        CheckResult {
            name: "Latency".to_string(),
            status: Status::Fail,
            error: Some(errors.join("; ")),
        }
    }
}

/// Drain `rx` until `n` *passing* samples have been collected or
/// `deadline` passes (spec §4.7 step 3: "N passes are stored", not N
/// samples of any status — a flaky endpoint must not be allowed to
/// reach the cutoff on mostly-failing samples).
async fn collect_until_n_passing(
    mut rx: mpsc::Receiver<Sample>,
    n: usize,
    deadline: Instant,
    concurrent: usize,
) -> (Vec<Sample>, Vec<bool>) {
    let mut samples = Vec::with_capacity(n);
    let mut participating = vec![false; concurrent];
    let mut passing = 0usize;
    while passing < n {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(sample)) => {
                participating[sample.worker_id] = true;
                if sample.status == Status::Pass {
                    passing += 1;
                }
                samples.push(sample);
            }
            _ => break,
        }
    }
    (samples, participating)
}

fn spawn_worker_executor(executor: &Executor, individual_sessions: bool) -> Executor {
    if individual_sessions {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        Executor::with_cookie_jar(executor.config().clone(), Some(jar)).unwrap_or_else(|_| executor.clone())
    } else {
        executor.clone()
    }
}

fn strip_latency_checks(test: &Test, skip_all_checks: bool) -> Test {
    let mut clone = test.clone();
    if skip_all_checks {
        clone.checks.clear();
    } else {
        clone.checks.retain(|c| !c.is_latency());
    }
    clone
}

/// Run two warmup rounds across `concurrent` clones in parallel; return
/// the average per-request duration, used to derive the worker stagger
/// offset `Δ = Tavg / Concurrent` (spec §4.7 step 2).
async fn warmup(executor: &Executor, test: &Test, concurrent: usize) -> Duration {
    let mut tasks = Vec::with_capacity(concurrent);
    for _ in 0..concurrent {
        let executor = executor.clone();
        let test = test.clone();
        tasks.push(tokio::spawn(async move {
            let mut total = Duration::ZERO;
            for _ in 0..2 {
                let start = Instant::now();
                let _ = executor.run_attempt(&test).await;
                total += start.elapsed();
            }
            total / 2
        }));
    }
    let mut sum = Duration::ZERO;
    let mut count = 0u32;
    for task in tasks {
        if let Ok(avg) = task.await {
            sum += avg;
            count += 1;
        }
    }
    if count == 0 {
        Duration::from_millis(1)
    } else {
        sum / count
    }
}

/// Hyndman-Fan type 8 quantile estimate over already-sorted durations.
/// `percentile` is in `[0, 100]`.
fn quantile_r8(sorted: &[Duration], percentile: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len() as f64;
    let p = (percentile / 100.0).clamp(0.0, 1.0);
    let h = (n + 1.0 / 3.0) * p + 1.0 / 3.0;
    let h = h.clamp(1.0, n);
    let lo = (h.floor() as usize).clamp(1, sorted.len()) - 1;
    let hi = (h.ceil() as usize).clamp(1, sorted.len()) - 1;
    let frac = h - h.floor();
    let lo_secs = sorted[lo].as_secs_f64();
    let hi_secs = sorted[hi].as_secs_f64();
    let value = lo_secs + frac * (hi_secs - lo_secs);
    Some(Duration::from_secs_f64(value.max(0.0)))
}

fn dump_csv(path: &str, test: &Test, concurrency: usize, samples: &[Sample]) {
    let writer: Box<dyn std::io::Write> = match path {
        "stdout" => Box::new(std::io::stdout()),
        "stderr" => Box::new(std::io::stderr()),
        other => match std::fs::File::create(other) {
            Ok(f) => Box::new(f),
            Err(e) => {
                tracing::warn!(error = %e, path = other, "failed to open Latency DumpTo path");
                return;
            }
        },
    };
    let mut writer = csv::Writer::from_writer(writer);
    for sample in samples {
        let _ = writer.write_record([
            test.name.as_str(),
            &concurrency.to_string(),
            &sample.started.to_rfc3339_opts(SecondsFormat::Nanos, true),
            &sample.status.to_string(),
            &sample.duration.as_millis().to_string(),
            &sample.complete.to_string(),
        ]);
    }
    let _ = writer.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dur_ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn quantile_r8_matches_literal_scenario() {
        let durations: Vec<Duration> = (1..=100).map(dur_ms).collect();
        let p75 = quantile_r8(&durations, 75.0).unwrap();
        assert!(p75 <= dur_ms(80), "expected ~75.58ms to pass an 80ms limit, got {:?}", p75);

        let p50 = quantile_r8(&durations, 50.0).unwrap();
        assert!(p50 > dur_ms(40), "expected ~50.5ms to fail a 40ms limit, got {:?}", p50);
    }

    #[test]
    fn quantile_r8_empty_is_none() {
        assert_eq!(quantile_r8(&[], 50.0), None);
    }

    #[test]
    fn strip_latency_checks_removes_only_latency_by_default() {
        let mut test = Test::default();
        test.checks.push(crate::checks::Check::StatusCode { expect: 200 });
        test.checks.push(crate::checks::Check::Latency(LatencyCheck::default()));
        let stripped = strip_latency_checks(&test, false);
        assert_eq!(stripped.checks.len(), 1);
    }

    #[test]
    fn strip_latency_checks_clears_everything_on_skip_checks() {
        let mut test = Test::default();
        test.checks.push(crate::checks::Check::StatusCode { expect: 200 });
        let stripped = strip_latency_checks(&test, true);
        assert!(stripped.checks.is_empty());
    }

    fn sample(worker_id: usize, status: Status) -> Sample {
        Sample {
            worker_id,
            started: Utc::now(),
            duration: dur_ms(1),
            status,
            complete: true,
        }
    }

    #[tokio::test]
    async fn collect_until_n_passing_waits_out_failures() {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            tx.send(sample(0, Status::Fail)).await.unwrap();
            tx.send(sample(0, Status::Fail)).await.unwrap();
            tx.send(sample(0, Status::Pass)).await.unwrap();
            tx.send(sample(0, Status::Pass)).await.unwrap();
            tx.send(sample(0, Status::Pass)).await.unwrap();
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let (samples, participating) = collect_until_n_passing(rx, 3, deadline, 1).await;

        // Two Fails don't count toward the target of 3 Passes: all five
        // sent samples are consumed before the cutoff is reached.
        assert_eq!(samples.len(), 5);
        assert_eq!(samples.iter().filter(|s| s.status == Status::Pass).count(), 3);
        assert!(participating[0]);
    }

    #[tokio::test]
    async fn collect_until_n_passing_stops_at_deadline_if_short() {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            tx.send(sample(0, Status::Fail)).await.unwrap();
            tx.send(sample(0, Status::Pass)).await.unwrap();
            // Sender drops here: only one Pass will ever arrive.
        });

        let deadline = Instant::now() + Duration::from_millis(200);
        let (samples, _) = collect_until_n_passing(rx, 3, deadline, 1).await;

        assert_eq!(samples.iter().filter(|s| s.status == Status::Pass).count(), 1);
    }
}
