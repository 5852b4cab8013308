//! The Test execution pipeline (spec §4.8): resolve variables,
//! substitute, prepare, poll-and-retry, dispatch the request, classify
//! the outcome, run Checks and Extractors.
//!
//! Grounded on the teacher's `verify()`-delegates-to-`Verifier` shape
//! (`verify.rs`): a free function wrapping a struct that owns the
//! long-lived client/config. Redirects are followed manually
//! (`Policy::none()` plus `dispatch_http`'s own loop) rather than via
//! reqwest's built-in policy, so a `Latency` sample's redirect chain
//! never leaks state shared with a concurrent sibling request.

use crate::checks::{Check, CheckContext, CheckError, Status};
use crate::config::VigilConfig;
use crate::error::{Error, Result};
use crate::extract::{ExtractContext, ExtractError};
use crate::loader::Test;
use crate::pseudo;
use crate::request::{BasicAuth, BodySource, Cookie, MultipartOverride, OrderedMultiMap, ParamsAs, Request};
use crate::response::{RedirectHop, Response};
use crate::vars::{self, IntVarMap, VarMap};
use chrono::Utc;
use reqwest::redirect::Policy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_REDIRECT_HOPS: usize = 10;

/// Outcome of one Check within a `TestResult`.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: Status,
    pub error: Option<String>,
}

impl CheckResult {
    fn pass(name: &str) -> Self {
        CheckResult {
            name: name.to_string(),
            status: Status::Pass,
            error: None,
        }
    }

    fn fail(name: &str, error: impl std::fmt::Display) -> Self {
        CheckResult {
            name: name.to_string(),
            status: Status::Fail,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of one Test invocation (spec §3, §4.8 step 9).
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub status: Status,
    pub checks: Vec<CheckResult>,
    pub extracted: HashMap<String, std::result::Result<String, String>>,
    /// Set on `Bogus`/`Error`/`Skipped` terminal states; `None` once
    /// Checks have actually run (their own failures live in `checks`).
    pub error: Option<String>,
    pub duration: Duration,
}

impl TestResult {
    /// Extracted values available to forward into a subsequent Test
    /// (spec §4.9 "propagate extracted variables forward").
    pub fn variables(&self) -> VarMap {
        self.extracted
            .iter()
            .filter_map(|(k, v)| v.as_ref().ok().map(|s| (k.clone(), s.clone())))
            .collect()
    }

    fn terminal(name: &str, status: Status, error: impl Into<Option<String>>, duration: Duration) -> Self {
        TestResult {
            name: name.to_string(),
            status,
            checks: Vec::new(),
            extracted: HashMap::new(),
            error: error.into(),
            duration,
        }
    }
}

/// Drives Test invocations against a real HTTP client (spec §4.8).
#[derive(Clone)]
pub struct Executor {
    client: reqwest::Client,
    config: VigilConfig,
}

impl Executor {
    pub fn new(config: VigilConfig) -> Result<Self> {
        Self::with_cookie_jar(config, None)
    }

    /// Build an Executor sharing `cookie_jar` with siblings (spec §4.9
    /// Suite's shared cookie jar).
    pub fn with_cookie_jar(config: VigilConfig, cookie_jar: Option<Arc<reqwest::cookie::Jar>>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .user_agent(config.defaults.user_agent.clone());
        if let Some(jar) = cookie_jar {
            builder = builder.cookie_provider(jar).cookie_store(true);
        }
        let client = builder.build().map_err(Error::Http)?;
        Ok(Executor { client, config })
    }

    pub fn config(&self) -> &VigilConfig {
        &self.config
    }

    /// Run one Test to completion (spec §4.8, steps 1-9).
    pub async fn execute(&self, test: &Test, inherited_vars: &VarMap) -> TestResult {
        self.execute_with_options(test, inherited_vars, false).await
    }

    /// Like `execute`, but `omit_checks` mirrors a Suite's `OmitChecks`
    /// flag: Extractors run regardless of whether Checks passed.
    pub async fn execute_with_options(&self, test: &Test, inherited_vars: &VarMap, omit_checks: bool) -> TestResult {
        let overall_start = Instant::now();
        let now = Utc::now();

        // 1. Resolve special variables against every string source in the Test.
        // `test.variables` carries the loader's TEST_NAME/TEST_DIR/TEST_PATH,
        // any BasedOn-merged Variables, and each Unroll copy's own binding
        // (loader.rs); its own explicit values take priority over whatever
        // the caller/Suite forwarded in, which only fills the gaps.
        let mut user_vars = inherited_vars.clone();
        for (k, v) in &test.variables {
            user_vars.insert(k.clone(), v.clone());
        }
        let sources = collect_substitution_sources(test);
        let source_refs: Vec<&str> = sources.iter().map(|s| s.as_str()).collect();
        let resolved = vars::resolve_all(&source_refs, &user_vars, now);
        let int_vars: IntVarMap = vars::int_vars_from(&resolved);

        // 2. Substitute into a fresh copy; the original Test is never mutated.
        let mut test = test.clone();
        test.request.substitute(&resolved);
        for check in test.checks.iter_mut() {
            check.substitute(&resolved, &int_vars);
        }
        for extractor in test.data_extraction.values_mut() {
            extractor.substitute(&resolved);
        }

        // 3. Prepare; the first failure makes the whole Test Bogus.
        for check in test.checks.iter_mut() {
            if let Err(e) = check.prepare() {
                return TestResult::terminal(&test.name, Status::Bogus, e.to_string(), overall_start.elapsed());
            }
        }
        for extractor in test.data_extraction.values_mut() {
            if let Err(e) = extractor.prepare() {
                return TestResult::terminal(&test.name, Status::Bogus, e.to_string(), overall_start.elapsed());
            }
        }

        let attempts = match test.poll.attempts() {
            Some(n) => n,
            None => return TestResult::terminal(&test.name, Status::Skipped, None, overall_start.elapsed()),
        };

        // 4. PreSleep.
        if let Some(d) = test.pre_sleep {
            tokio::time::sleep(d).await;
        }

        let mut response = Response::default();
        let mut check_results: Vec<CheckResult> = Vec::new();
        let mut status = Status::NotRun;

        // 5. Attempt loop: retry until Pass or attempts exhausted.
        for attempt in 1..=attempts {
            let (attempt_response, attempt_checks) = self.run_attempt(&test).await;
            response = attempt_response;
            check_results = attempt_checks;

            // 6. Classify: a transport failure is Error; otherwise run Checks.
            let exec_status = if response.transport_error.is_some() { Status::Error } else { Status::Pass };
            let checks_status = check_results.iter().map(|c| c.status).max().unwrap_or(Status::Pass);
            status = exec_status.max(checks_status);

            if status == Status::Pass || attempt == attempts {
                break;
            }
            if let Some(d) = test.inter_sleep {
                tokio::time::sleep(d).await;
            }
        }
        let exec_error = response.transport_error.clone();

        // 7. Run Extractors only when the Test passed, or the Suite omits Checks.
        let mut extracted = HashMap::new();
        if status == Status::Pass || omit_checks {
            let ctx = ExtractContext {
                request: &test.request,
                response: &response,
                now,
            };
            for (name, extractor) in &test.data_extraction {
                let result = extractor.extract(&ctx).map_err(|e: ExtractError| e.to_string());
                extracted.insert(name.clone(), result);
            }
        }

        // 8. PostSleep.
        if let Some(d) = test.post_sleep {
            tokio::time::sleep(d).await;
        }

        // 9. Overall Status = max(execution outcome, all Check statuses).
        TestResult {
            name: test.name.clone(),
            status,
            checks: check_results,
            extracted,
            error: exec_error,
            duration: overall_start.elapsed(),
        }
    }

    /// One request dispatch plus its Check results, with no polling,
    /// sleeps, or Extractor pass. Shared by the attempt loop and the
    /// Latency sampler (`latency::run`), which needs exactly this slice
    /// of the pipeline repeated many times concurrently.
    pub(crate) async fn run_attempt(&self, test: &Test) -> (Response, Vec<CheckResult>) {
        let (response, _transport_error) = self.dispatch(&test.request).await;
        let checks = self.run_checks(test, &response).await;
        (response, checks)
    }

    /// Dispatch one HTTP attempt (pseudo-URL or real), never following
    /// more than `MAX_REDIRECT_HOPS` hops.
    async fn dispatch(&self, request: &Request) -> (Response, Option<String>) {
        if pseudo::is_pseudo_url(&request.url) {
            let response = pseudo::dispatch(request).await;
            let err = response.transport_error.clone();
            return (response, err);
        }
        match self.dispatch_http(request).await {
            Ok(response) => {
                let err = response.transport_error.clone();
                (response, err)
            }
            Err(e) => {
                let response = Response {
                    transport_error: Some(e.to_string()),
                    ..Default::default()
                };
                (response, Some(e.to_string()))
            }
        }
    }

    /// Run every non-`Latency` Check, plus any `Latency` Check (via the
    /// concurrent sampler) against an already-dispatched Response.
    async fn run_checks(&self, test: &Test, response: &Response) -> Vec<CheckResult> {
        let revalidated = if response.is_ok() && test.checks.iter().any(|c| matches!(c, Check::ETag {})) {
            self.revalidate_etag(response).await
        } else {
            None
        };
        let revalidate_fn = move |_tag: &str| -> std::result::Result<Response, Error> {
            revalidated
                .clone()
                .ok_or_else(|| Error::Other("ETag revalidation unavailable".to_string()))
        };

        let mut results = Vec::with_capacity(test.checks.len());
        for check in &test.checks {
            if let Check::Latency(params) = check {
                results.push(crate::latency::run(self.clone(), test, params).await);
                continue;
            }
            let ctx = CheckContext {
                request: &test.request,
                response,
                revalidate: Some(&revalidate_fn),
            };
            let name = check.variant_name();
            match check.execute(&ctx) {
                Ok(()) => results.push(CheckResult::pass(name)),
                Err(e) => results.push(CheckResult::fail(name, format_check_error(&e))),
            }
        }
        results
    }

    /// Issue the conditional GET an `ETag` check needs (spec §8 scenario 3).
    async fn revalidate_etag(&self, response: &Response) -> Option<Response> {
        let tag = response.header_first("ETag")?;
        let url = &response.final_url;
        if url.is_empty() {
            return None;
        }
        match self.client.get(url).header("If-None-Match", tag).send().await {
            Ok(resp) => Some(Response {
                status: resp.status().as_u16(),
                ..Default::default()
            }),
            Err(_) => None,
        }
    }

    /// Dispatch a real HTTP request, following redirects manually when
    /// `FollowRedirects` is set (spec §4.8 step 5b).
    async fn dispatch_http(&self, request: &Request) -> Result<Response> {
        let start = Instant::now();
        let mut method = request.method.clone();
        let mut url = request.url.clone();
        let mut send_body = true;
        let mut redirects = Vec::new();

        loop {
            let (status, headers, body_bytes, protocol) =
                self.send_one(request, &method, &url, send_body).await?;

            if request.follow_redirects && (300..400).contains(&status) && redirects.len() < MAX_REDIRECT_HOPS {
                let location = headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("Location")).map(|(_, v)| v.clone());
                if let Some(location) = location {
                    let next_url = resolve_redirect_url(&url, &location)?;
                    redirects.push(RedirectHop { url: url.clone(), status });
                    if status == 303 || ((status == 301 || status == 302) && method.eq_ignore_ascii_case("POST")) {
                        method = "GET".to_string();
                        send_body = false;
                    }
                    url = next_url;
                    continue;
                }
            }

            let body_text = String::from_utf8(body_bytes.clone()).ok();
            return Ok(Response {
                status,
                headers,
                body_bytes,
                body_text,
                redirects,
                final_url: url,
                duration: start.elapsed(),
                protocol,
                transport_error: None,
            });
        }
    }

    /// Send exactly one HTTP request (no redirect following); returns
    /// `(status, headers, body_bytes, protocol)`.
    async fn send_one(
        &self,
        request: &Request,
        method: &str,
        url: &str,
        send_body: bool,
    ) -> Result<(u16, Vec<(String, String)>, Vec<u8>, String)> {
        let reqwest_method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| Error::Load(format!("bad method {:?}", method)))?;
        let mut builder = self.client.request(reqwest_method, url);
        builder = apply_headers(builder, &request.header);
        builder = apply_cookies(builder, &request.cookies);
        if let Some(auth) = &request.basic_auth {
            builder = apply_basic_auth(builder, auth);
        }
        let timeout = request.timeout.unwrap_or_else(|| self.config.defaults.timeout());
        builder = builder.timeout(timeout);

        if send_body {
            builder = apply_body(builder, request)?;
        }

        let resp = builder.send().await.map_err(Error::Http)?;
        let status = resp.status().as_u16();
        let protocol = format!("{:?}", resp.version());
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body_bytes = resp.bytes().await.map_err(Error::Http)?.to_vec();
        Ok((status, headers, body_bytes, protocol))
    }
}

fn format_check_error(e: &CheckError) -> String {
    e.to_string()
}

fn resolve_redirect_url(base: &str, location: &str) -> Result<String> {
    let base_url = url::Url::parse(base).map_err(Error::UrlParse)?;
    let joined = base_url.join(location).map_err(Error::UrlParse)?;
    Ok(joined.to_string())
}

fn apply_headers(mut builder: reqwest::RequestBuilder, headers: &OrderedMultiMap) -> reqwest::RequestBuilder {
    for (name, values) in headers.iter() {
        for value in values {
            builder = builder.header(name, value);
        }
    }
    builder
}

fn apply_cookies(builder: reqwest::RequestBuilder, cookies: &[Cookie]) -> reqwest::RequestBuilder {
    if cookies.is_empty() {
        return builder;
    }
    let joined = cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ");
    builder.header("Cookie", joined)
}

fn apply_basic_auth(builder: reqwest::RequestBuilder, auth: &BasicAuth) -> reqwest::RequestBuilder {
    builder.basic_auth(&auth.username, Some(&auth.password))
}

/// Flatten `Params` into `(name, value)` pairs in declaration order —
/// the order `OrderedMultiMap` preserves across keys and per-key
/// values (spec §3 "ordered map from name to ordered-list-of-values").
fn flatten_params(params: &OrderedMultiMap) -> Vec<(String, String)> {
    params
        .iter()
        .flat_map(|(k, values)| values.iter().map(move |v| (k.to_string(), v.clone())))
        .collect()
}

fn apply_body(mut builder: reqwest::RequestBuilder, request: &Request) -> Result<reqwest::RequestBuilder> {
    match request.params_as {
        ParamsAs::Query => {
            builder = builder.query(&flatten_params(&request.params));
            Ok(builder)
        }
        ParamsAs::FormUrlEncoded => Ok(builder.form(&flatten_params(&request.params))),
        ParamsAs::Multipart => {
            let mut form = reqwest::multipart::Form::new();
            for (name, value) in flatten_params(&request.params) {
                form = form.part(name, build_multipart_part(&value)?);
            }
            Ok(builder.multipart(form))
        }
        ParamsAs::Body => apply_literal_body(builder, &request.body),
    }
}

fn apply_literal_body(builder: reqwest::RequestBuilder, raw: &str) -> Result<reqwest::RequestBuilder> {
    match BodySource::parse(raw) {
        BodySource::Literal(text) => Ok(builder.body(text)),
        BodySource::File(path) => {
            let bytes = std::fs::read(&path)?;
            Ok(builder.body(bytes))
        }
        BodySource::VarFile(path) => {
            let text = std::fs::read_to_string(&path)?;
            Ok(builder.body(text))
        }
    }
}

fn build_multipart_part(value: &str) -> Result<reqwest::multipart::Part> {
    if let Some(over) = MultipartOverride::parse(value) {
        let bytes = std::fs::read(&over.path)?;
        let file_name = std::path::Path::new(&over.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(&over.mime_type)
            .map_err(Error::Http);
    }
    match BodySource::parse(value) {
        BodySource::Literal(text) => Ok(reqwest::multipart::Part::text(text)),
        BodySource::File(path) | BodySource::VarFile(path) => {
            let bytes = std::fs::read(&path)?;
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            let file_name = std::path::Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            reqwest::multipart::Part::bytes(bytes)
                .file_name(file_name)
                .mime_str(mime.essence_str())
                .map_err(Error::Http)
        }
    }
}

/// Every string field special-variable resolution should scan (spec
/// §4.5): the Test's own string fields plus every Check/Extractor
/// string, so a `{{NOW}}` used only inside a Check still resolves.
fn collect_substitution_sources(test: &Test) -> Vec<String> {
    let mut sources = vec![test.request.url.clone(), test.request.body.clone()];
    for (_, values) in test.request.params.iter() {
        sources.extend(values.iter().cloned());
    }
    for (_, values) in test.request.header.iter() {
        sources.extend(values.iter().cloned());
    }
    for cookie in &test.request.cookies {
        sources.push(cookie.value.clone());
    }
    if let Some(auth) = &test.request.basic_auth {
        sources.push(auth.username.clone());
        sources.push(auth.password.clone());
    }
    for check in &test.checks {
        sources.extend(check_string_fields(check));
    }
    sources
}

/// Every raw string field a `Check` might carry a `{{…}}` token in,
/// gathered for special-variable discovery (§4.5).
fn check_string_fields(check: &Check) -> Vec<String> {
    match check {
        Check::Header(h) => {
            let mut v = vec![h.name.clone()];
            v.extend(condition_string_fields(&h.condition));
            v
        }
        Check::Body(c) | Check::FinalUrl(c) => condition_string_fields(c),
        Check::Sorted(s) => s.text.clone(),
        Check::HtmlTag { selector, .. } => vec![selector.clone()],
        Check::HtmlContains { selector, condition, .. } => {
            let mut v = vec![selector.clone()];
            v.extend(condition_string_fields(condition));
            v
        }
        Check::Identity(i) => vec![i.sha1.clone()],
        Check::Image(img) => [img.format.clone(), img.fingerprint.clone()].into_iter().flatten().collect(),
        Check::Json(j) => {
            let mut v = vec![j.element.clone()];
            v.extend(condition_string_fields(&j.condition));
            if let Some(embedded) = &j.embedded {
                v.extend(check_string_fields(embedded));
            }
            v
        }
        Check::JSONExpr(e) => vec![e.expression.clone()],
        Check::Redirect(r) => r.to_url.as_ref().map(condition_string_fields).unwrap_or_default(),
        Check::RedirectChain(r) => r.chain.clone(),
        Check::ContentType(c) => vec![c.is.clone()],
        Check::Cache(_) | Check::ETag {} | Check::UTF8Encoded {} | Check::ResponseTime(_) => Vec::new(),
        Check::AnyOne { of } | Check::None { of } => of.iter().flat_map(check_string_fields).collect(),
        Check::Latency(l) => vec![l.limits.clone()],
        Check::StatusCode { .. } => Vec::new(),
    }
}

fn condition_string_fields(c: &crate::condition::Condition) -> Vec<String> {
    [
        c.equals.clone(),
        c.prefix.clone(),
        c.suffix.clone(),
        c.contains.clone(),
        c.regexp.clone(),
        c.is.clone(),
        c.time.clone(),
    ]
    .into_iter()
    .flatten()
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_params_preserves_declaration_order() {
        let mut params = OrderedMultiMap::new();
        params.insert("b", "2");
        params.insert("a", "1");
        params.insert("a", "1b");
        let pairs = flatten_params(&params);
        assert_eq!(
            pairs,
            vec![
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
                ("a".to_string(), "1b".to_string()),
            ]
        );
    }

    #[test]
    fn redirect_url_resolves_relative_location() {
        let resolved = resolve_redirect_url("https://example.com/a/b", "/c").unwrap();
        assert_eq!(resolved, "https://example.com/c");
    }

    #[test]
    fn collect_sources_includes_latency_limits() {
        let mut test = Test::default();
        test.checks.push(Check::Latency(crate::checks::LatencyCheck {
            limits: "{{PCT}}% \u{2264} 1s".to_string(),
            ..Default::default()
        }));
        let sources = collect_substitution_sources(&test);
        assert!(sources.iter().any(|s| s.contains("{{PCT}}")));
    }

    #[tokio::test]
    async fn skipped_test_never_dispatches() {
        let executor = Executor::new(VigilConfig::default()).unwrap();
        let mut test = Test::default();
        test.poll.max = -1;
        let result = executor.execute(&test, &VarMap::new()).await;
        assert_eq!(result.status, Status::Skipped);
    }

    #[tokio::test]
    async fn bogus_check_short_circuits_before_any_request() {
        let executor = Executor::new(VigilConfig::default()).unwrap();
        let mut test = Test::default();
        test.request.url = "file:///dev/null".to_string();
        test.checks.push(Check::Sorted(crate::checks::SortedCheck {
            text: vec!["only-one".to_string()],
            allow_missing: false,
        }));
        let result = executor.execute(&test, &VarMap::new()).await;
        assert_eq!(result.status, Status::Bogus);
    }

    #[tokio::test]
    async fn file_pseudo_url_roundtrips_through_status_code_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.txt");
        std::fs::write(&path, "hello").unwrap();

        let executor = Executor::new(VigilConfig::default()).unwrap();
        let mut test = Test::default();
        test.request.url = format!("file://{}", path.display());
        test.checks.push(Check::StatusCode { expect: 200 });
        test.checks.push(Check::Body(crate::condition::Condition {
            equals: Some("hello".to_string()),
            ..Default::default()
        }));
        let result = executor.execute(&test, &VarMap::new()).await;
        assert_eq!(result.status, Status::Pass);
    }
}
