//! Black-box executor tests (SPEC_FULL.md §3.5): drive the pipeline
//! against a real (wiremock) HTTP server so poll/retry, redirects, and
//! Check/Extractor execution run hermetically end to end.

use std::collections::HashMap;
use vigil::checks::{Check, Status};
use vigil::condition::Condition;
use vigil::config::VigilConfig;
use vigil::executor::Executor;
use vigil::extract::{Extractor, JsonExtractorParams};
use vigil::request::Request;
use vigil::{Poll, Test};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn base_test(url: String) -> Test {
    Test {
        name: "smoke".to_string(),
        request: Request {
            url,
            ..Default::default()
        },
        poll: Poll { max: 1, sleep: None },
        ..Default::default()
    }
}

#[tokio::test]
async fn status_code_check_passes_on_200() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&server)
        .await;

    let mut test = base_test(format!("{}/ok", server.uri()));
    test.checks.push(Check::StatusCode { expect: 200 });

    let executor = Executor::new(VigilConfig::default()).unwrap();
    let result = executor.execute(&test, &HashMap::new()).await;

    assert_eq!(result.status, Status::Pass);
    assert_eq!(result.checks.len(), 1);
    assert_eq!(result.checks[0].status, Status::Pass);
}

#[tokio::test]
async fn status_code_check_fails_on_mismatch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/teapot"))
        .respond_with(ResponseTemplate::new(418))
        .mount(&server)
        .await;

    let mut test = base_test(format!("{}/teapot", server.uri()));
    test.checks.push(Check::StatusCode { expect: 200 });

    let executor = Executor::new(VigilConfig::default()).unwrap();
    let result = executor.execute(&test, &HashMap::new()).await;

    assert_eq!(result.status, Status::Fail);
}

#[tokio::test]
async fn poll_retries_until_pass_or_exhausted() {
    let server = MockServer::start().await;
    // Always 503: poll should exhaust all attempts and report Fail via StatusCode.
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut test = base_test(format!("{}/flaky", server.uri()));
    test.poll = Poll { max: 3, sleep: Some(std::time::Duration::from_millis(1)) };
    test.checks.push(Check::StatusCode { expect: 200 });

    let executor = Executor::new(VigilConfig::default()).unwrap();
    let result = executor.execute(&test, &HashMap::new()).await;

    assert_eq!(result.status, Status::Fail);
}

#[tokio::test]
async fn negative_poll_max_skips_the_test() {
    let mut test = base_test("http://127.0.0.1:1/unreachable".to_string());
    test.poll = Poll { max: -1, sleep: None };

    let executor = Executor::new(VigilConfig::default()).unwrap();
    let result = executor.execute(&test, &HashMap::new()).await;

    assert_eq!(result.status, Status::Skipped);
}

#[tokio::test]
async fn extractor_runs_only_after_a_passing_test() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"a":"foo","b":"bar","c":[1,2,3]}"#))
        .mount(&server)
        .await;

    let mut test = base_test(format!("{}/json", server.uri()));
    test.checks.push(Check::StatusCode { expect: 200 });
    test.data_extraction.insert(
        "third".to_string(),
        Extractor::JsonExtractor(JsonExtractorParams {
            element: "c.2".to_string(),
            sep: ".".to_string(),
            embedded: None,
        }),
    );

    let executor = Executor::new(VigilConfig::default()).unwrap();
    let result = executor.execute(&test, &HashMap::new()).await;

    assert_eq!(result.status, Status::Pass);
    assert_eq!(result.extracted.get("third"), Some(&Ok("3".to_string())));
}

#[tokio::test]
async fn malformed_check_reports_bogus_before_dispatch() {
    let mut test = base_test("http://127.0.0.1:1/never-reached".to_string());
    test.checks.push(Check::Body(Condition {
        regexp: Some("(unterminated".to_string()),
        ..Default::default()
    }));

    let executor = Executor::new(VigilConfig::default()).unwrap();
    let result = executor.execute(&test, &HashMap::new()).await;

    assert_eq!(result.status, Status::Bogus);
}

#[tokio::test]
async fn variable_substitution_applies_before_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/greet"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
        .mount(&server)
        .await;

    let mut test = base_test(format!("{}/greet", server.uri()));
    test.request.header.insert("X-Name", "{{NAME}}");
    test.checks.push(Check::Header(vigil::checks::HeaderCheck {
        name: "nonexistent".to_string(),
        absent: true,
        condition: Condition::default(),
    }));

    let mut vars = HashMap::new();
    vars.insert("NAME".to_string(), "alice".to_string());

    let executor = Executor::new(VigilConfig::default()).unwrap();
    let result = executor.execute(&test, &vars).await;

    assert_eq!(result.status, Status::Pass);
}

#[tokio::test]
async fn tests_own_variables_field_is_substituted_without_caller_help() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/greet"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
        .mount(&server)
        .await;

    let mut test = base_test(format!("{}/greet", server.uri()));
    test.request.header.insert("X-Name", "{{NAME}}");
    test.variables.insert("NAME".to_string(), "bob".to_string());
    test.checks.push(Check::Header(vigil::checks::HeaderCheck {
        name: "nonexistent".to_string(),
        absent: true,
        condition: Condition::default(),
    }));

    // No `NAME` supplied by the caller at all — the Test's own
    // `Variables` field must resolve `{{NAME}}` on its own.
    let executor = Executor::new(VigilConfig::default()).unwrap();
    let result = executor.execute(&test, &HashMap::new()).await;

    assert_eq!(result.status, Status::Pass);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received[0].headers.get("x-name").unwrap().to_str().unwrap(), "bob");
}

#[tokio::test]
async fn tests_own_variables_field_wins_over_caller_supplied_on_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/greet"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut test = base_test(format!("{}/greet", server.uri()));
    test.request.header.insert("X-Name", "{{NAME}}");
    test.variables.insert("NAME".to_string(), "own".to_string());

    let mut inherited = HashMap::new();
    inherited.insert("NAME".to_string(), "inherited".to_string());

    let executor = Executor::new(VigilConfig::default()).unwrap();
    executor.execute(&test, &inherited).await;

    let received = server.received_requests().await.unwrap();
    assert_eq!(received[0].headers.get("x-name").unwrap().to_str().unwrap(), "own");
}

#[tokio::test]
async fn varfile_body_is_substituted_before_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("payload.txt");
    std::fs::write(&file_path, "hello {{NAME}}").unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/echo"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut test = base_test(format!("{}/echo", server.uri()));
    test.request.method = "POST".to_string();
    test.request.params_as = vigil::request::ParamsAs::Body;
    test.request.body = format!("@vfile:{}", file_path.display());

    let mut vars = HashMap::new();
    vars.insert("NAME".to_string(), "world".to_string());

    let executor = Executor::new(VigilConfig::default()).unwrap();
    let result = executor.execute(&test, &vars).await;

    assert_eq!(result.status, Status::Pass);
    assert!(result.error.is_none());

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body, b"hello world");
}

#[tokio::test]
async fn transport_failure_yields_error_status() {
    // Nothing listens on this port: the client should fail to connect.
    let test = base_test("http://127.0.0.1:1/unreachable".to_string());
    let executor = Executor::new(VigilConfig::default()).unwrap();
    let result = executor.execute(&test, &HashMap::new()).await;
    assert_eq!(result.status, Status::Error);
}
