//! Check variants (spec §4.3) — polymorphic assertions over a `Response`.
//!
//! Modeled as a single tagged enum (the teacher's `Rule`/`WhenClause`
//! shape in `spec.rs`) rather than trait objects, since the variant set
//! is closed and spec-defined. Every variant exposes `prepare`
//! (validate/compile — run once, before any request is sent) and
//! `execute` (apply to a completed exchange). A `Check` whose `prepare`
//! fails is reported `Bogus`; a `Check` whose `execute` fails is
//! `Fail`.

use crate::condition::{Condition, ConditionError};
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::time::Duration;

/// Test/Suite outcome ordering (spec §3): `NotRun < Skipped < Pass <
/// Fail < Error < Bogus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Status {
    NotRun,
    Skipped,
    Pass,
    Fail,
    Error,
    Bogus,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A Check `execute` failure (always maps to `Status::Fail` — a
/// malformed Check is caught at `prepare` time and never reaches
/// `execute`, per spec §7).
#[derive(Debug, Clone, PartialEq)]
pub enum CheckError {
    Condition(ConditionError),
    /// The response body could not be read/decoded.
    BadBody,
    /// The check could not be meaningfully evaluated against this
    /// response (e.g. non-JSON body for a JSON check).
    CantCheck(String),
    Custom(String),
}

impl std::fmt::Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckError::Condition(e) => write!(f, "{}", e),
            CheckError::BadBody => write!(f, "body could not be read"),
            CheckError::CantCheck(msg) => write!(f, "can't check: {}", msg),
            CheckError::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<ConditionError> for CheckError {
    fn from(e: ConditionError) -> Self {
        CheckError::Condition(e)
    }
}

/// Everything a Check's `execute` needs about one completed attempt.
pub struct CheckContext<'a> {
    pub request: &'a Request,
    pub response: &'a Response,
    /// Issue a conditional GET against the same URL with the given
    /// `If-None-Match` value; used only by `ETag`'s revalidation step.
    /// `None` in contexts (e.g. unit tests) that don't wire up a client.
    pub revalidate: Option<&'a dyn Fn(&str) -> Result<Response, Error>>,
}

/// Header presence/absence check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderCheck {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(default, rename = "Absent")]
    pub absent: bool,
    #[serde(default, flatten)]
    pub condition: Condition,
}

/// Locate strings successively, consuming the body (spec §4.3 `Sorted`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SortedCheck {
    #[serde(rename = "Text")]
    pub text: Vec<String>,
    #[serde(default, rename = "AllowMissing")]
    pub allow_missing: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityCheck {
    #[serde(rename = "SHA1")]
    pub sha1: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageCheck {
    #[serde(default, rename = "Format")]
    pub format: Option<String>,
    #[serde(default, rename = "Width")]
    pub width: Option<u32>,
    #[serde(default, rename = "Height")]
    pub height: Option<u32>,
    #[serde(default, rename = "Fingerprint")]
    pub fingerprint: Option<String>,
    #[serde(default, rename = "Threshold")]
    pub threshold: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonCheck {
    #[serde(default, rename = "Element")]
    pub element: String,
    #[serde(default, flatten)]
    pub condition: Condition,
    #[serde(default, rename = "Embedded")]
    pub embedded: Option<Box<Check>>,
    #[serde(default = "default_sep", rename = "Sep")]
    pub sep: String,
}

fn default_sep() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonExprCheck {
    #[serde(rename = "Expression")]
    pub expression: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedirectCheck {
    #[serde(default, rename = "ViaStatus")]
    pub via_status: Option<u16>,
    #[serde(default, rename = "ToURL")]
    pub to_url: Option<Condition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedirectChainCheck {
    #[serde(rename = "Chain")]
    pub chain: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentTypeCheck {
    #[serde(rename = "Is")]
    pub is: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheCheck {
    #[serde(default, rename = "NoStore")]
    pub no_store: bool,
    #[serde(default, rename = "NoCache")]
    pub no_cache: bool,
    #[serde(default, rename = "Private")]
    pub private: bool,
    #[serde(default, with = "duration_secs_opt", rename = "AtLeast")]
    pub at_least: Option<Duration>,
    #[serde(default, with = "duration_secs_opt", rename = "AtMost")]
    pub at_most: Option<Duration>,
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<u64> = Option::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseTimeCheck {
    #[serde(with = "duration_ms", rename = "Lower")]
    pub lower: Duration,
    #[serde(with = "duration_ms", rename = "Higher")]
    pub higher: Duration,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(v.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Percentile limit parsed from `"50% <= 150ms"` syntax (spec §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileLimit {
    pub quantile: f64,
    #[serde(with = "duration_ms")]
    pub max: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyCheck {
    #[serde(default = "default_samples", rename = "N")]
    pub n: usize,
    #[serde(default = "default_concurrent", rename = "Concurrent")]
    pub concurrent: usize,
    #[serde(rename = "Limits")]
    pub limits: String,
    #[serde(default, rename = "IndividualSessions")]
    pub individual_sessions: bool,
    #[serde(default, rename = "SkipChecks")]
    pub skip_checks: bool,
    #[serde(default, rename = "DumpTo")]
    pub dump_to: Option<String>,
}

fn default_samples() -> usize {
    50
}
fn default_concurrent() -> usize {
    2
}

/// The full Check enum (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Check")]
pub enum Check {
    StatusCode {
        #[serde(default, rename = "Expect")]
        expect: u16,
    },
    Header(HeaderCheck),
    Body(#[serde(flatten)] Condition),
    Sorted(SortedCheck),
    #[serde(rename = "HTMLTag")]
    HtmlTag {
        #[serde(rename = "Selector")]
        selector: String,
        #[serde(default, rename = "Count")]
        count: Option<i64>,
        #[serde(skip, default)]
        compiled: Option<CompiledSelector>,
    },
    #[serde(rename = "HTMLContains")]
    HtmlContains {
        #[serde(rename = "Selector")]
        selector: String,
        #[serde(flatten)]
        condition: Condition,
        #[serde(skip, default)]
        compiled: Option<CompiledSelector>,
    },
    Identity(IdentityCheck),
    Image(ImageCheck),
    #[serde(rename = "JSON")]
    Json(JsonCheck),
    JSONExpr(JsonExprCheck),
    Redirect(RedirectCheck),
    RedirectChain(RedirectChainCheck),
    #[serde(rename = "FinalURL")]
    FinalUrl(#[serde(flatten)] Condition),
    ContentType(ContentTypeCheck),
    Cache(CacheCheck),
    ETag {},
    UTF8Encoded {},
    ResponseTime(ResponseTimeCheck),
    AnyOne {
        #[serde(rename = "Of")]
        of: Vec<Check>,
    },
    None {
        #[serde(rename = "Of")]
        of: Vec<Check>,
    },
    Latency(LatencyCheck),
}

/// A compiled CSS selector, kept out of (de)serialization and rebuilt
/// by `prepare`.
#[derive(Debug, Clone)]
pub struct CompiledSelector(pub scraper::Selector);

impl Check {
    /// Validate/compile. Must succeed before `execute` may run (spec §3 invariant).
    pub fn prepare(&mut self) -> Result<(), Error> {
        match self {
            Check::Header(h) => {
                h.condition.compile().map_err(|e| Error::MalformedCheck(e.to_string()))?;
            }
            Check::Body(c) => {
                c.compile().map_err(|e| Error::MalformedCheck(e.to_string()))?;
            }
            Check::FinalUrl(c) => {
                c.compile().map_err(|e| Error::MalformedCheck(e.to_string()))?;
            }
            Check::Sorted(s) => {
                if s.text.len() < 2 {
                    return Err(Error::MalformedCheck(
                        "Sorted requires at least two Text items".to_string(),
                    ));
                }
            }
            Check::HtmlTag { selector, compiled, .. } => {
                let sel = scraper::Selector::parse(selector)
                    .map_err(|e| Error::MalformedCheck(format!("bad selector {:?}: {:?}", selector, e)))?;
                *compiled = Some(CompiledSelector(sel));
            }
            Check::HtmlContains { selector, condition, compiled, .. } => {
                let sel = scraper::Selector::parse(selector)
                    .map_err(|e| Error::MalformedCheck(format!("bad selector {:?}: {:?}", selector, e)))?;
                *compiled = Some(CompiledSelector(sel));
                condition.compile().map_err(|e| Error::MalformedCheck(e.to_string()))?;
            }
            Check::Identity(i) => {
                if i.sha1.is_empty() {
                    return Err(Error::MalformedCheck("Identity requires SHA1".to_string()));
                }
            }
            Check::Json(j) => {
                j.condition.compile().map_err(|e| Error::MalformedCheck(e.to_string()))?;
                if let Some(embedded) = &mut j.embedded {
                    embedded.prepare()?;
                }
            }
            Check::JSONExpr(expr) => {
                if crate::cel::compile_bool_expr(&expr.expression).is_err() {
                    return Err(Error::MalformedCheck(format!(
                        "bad JSONExpr expression: {}",
                        expr.expression
                    )));
                }
            }
            Check::Cache(c) => {
                if let (Some(lo), Some(hi)) = (c.at_least, c.at_most) {
                    if lo > hi {
                        return Err(Error::MalformedCheck("Cache AtLeast must be <= AtMost".to_string()));
                    }
                }
            }
            Check::ResponseTime(r) => {
                if r.higher < r.lower {
                    return Err(Error::MalformedCheck(
                        "ResponseTime Higher must be >= Lower".to_string(),
                    ));
                }
            }
            Check::AnyOne { of } | Check::None { of } => {
                for c in of.iter_mut() {
                    c.prepare()?;
                }
            }
            Check::Latency(l) => {
                parse_percentile_limits(&l.limits)
                    .map_err(|e| Error::MalformedCheck(format!("bad Limits: {}", e)))?;
                if l.concurrent == 0 || l.concurrent > 64 {
                    return Err(Error::MalformedCheck("Latency Concurrent must be in 1..=64".to_string()));
                }
            }
            Check::StatusCode { .. }
            | Check::Redirect(_)
            | Check::RedirectChain(_)
            | Check::ContentType(_)
            | Check::ETag {}
            | Check::UTF8Encoded {} => {}
        }
        Ok(())
    }

    /// Apply the check to a completed response.
    pub fn execute(&self, ctx: &CheckContext) -> Result<(), CheckError> {
        let r = ctx.response;
        if !r.is_ok()
            && !matches!(self, Check::StatusCode { .. } | Check::AnyOne { .. } | Check::None { .. })
        {
            return Err(CheckError::BadBody);
        }
        match self {
            Check::StatusCode { expect } => {
                let want = if *expect == 0 { 200 } else { *expect };
                if r.status != want {
                    Err(CheckError::Custom(format!("status {} != expected {}", r.status, want)))
                } else {
                    Ok(())
                }
            }
            Check::Header(h) => {
                let present = r.header_first(&h.name);
                match (present, h.absent) {
                    (None, true) => Ok(()),
                    (None, false) => Err(CheckError::Custom(format!("header {} absent", h.name))),
                    (Some(_), true) => Err(CheckError::Custom(format!("header {} present", h.name))),
                    (Some(_), false) => {
                        let value = r.header_joined(&h.name).unwrap_or_default();
                        h.condition.check(&value).map_err(CheckError::from)
                    }
                }
            }
            Check::Body(c) => {
                let body = r.body_str().map_err(|_| CheckError::BadBody)?;
                c.check(body).map_err(CheckError::from)
            }
            Check::Sorted(s) => execute_sorted(s, r),
            Check::HtmlTag { count, compiled, .. } => {
                let sel = &compiled.as_ref().expect("prepared").0;
                let body = r.body_str().map_err(|_| CheckError::BadBody)?;
                let doc = scraper::Html::parse_document(body);
                let got = doc.select(sel).count();
                let want = count.unwrap_or(1);
                check_html_count(got, want)
            }
            Check::HtmlContains { condition, compiled, .. } => {
                let sel = &compiled.as_ref().expect("prepared").0;
                let body = r.body_str().map_err(|_| CheckError::BadBody)?;
                let doc = scraper::Html::parse_document(body);
                let text: String = doc
                    .select(sel)
                    .flat_map(|e| e.text())
                    .collect::<Vec<_>>()
                    .join(" ");
                condition.check(&text).map_err(CheckError::from)
            }
            Check::Identity(i) => {
                let mut hasher = Sha1::new();
                hasher.update(&r.body_bytes);
                let digest = hex::encode(hasher.finalize());
                if digest.eq_ignore_ascii_case(&i.sha1) {
                    Ok(())
                } else {
                    Err(CheckError::Custom(format!("sha1 mismatch: got {}, want {}", digest, i.sha1)))
                }
            }
            Check::Image(spec) => execute_image(spec, r),
            Check::Json(j) => execute_json(j, r),
            Check::JSONExpr(expr) => execute_json_expr(expr, r),
            Check::Redirect(rc) => execute_redirect(rc, r),
            Check::RedirectChain(rc) => execute_redirect_chain(rc, r),
            Check::FinalUrl(c) => c.check(&r.final_url).map_err(CheckError::from),
            Check::ContentType(ct) => {
                let want = match ct.is.as_str() {
                    "html" => "text/html",
                    "json" => "application/json",
                    "xml" => "application/xml",
                    "text" => "text/plain",
                    other => other,
                };
                let got = r.header_first("Content-Type").unwrap_or("");
                if got.split(';').next().unwrap_or("").trim() == want {
                    Ok(())
                } else {
                    Err(CheckError::Custom(format!("content-type {:?} != {:?}", got, want)))
                }
            }
            Check::Cache(c) => execute_cache(c, r),
            Check::ETag {} => execute_etag(ctx),
            Check::UTF8Encoded {} => {
                if std::str::from_utf8(&r.body_bytes).is_err() {
                    Err(CheckError::Custom("invalid UTF-8".to_string()))
                } else if r.body_bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
                    Err(CheckError::Custom("unexpected UTF-8 BOM".to_string()))
                } else {
                    Ok(())
                }
            }
            Check::ResponseTime(rt) => {
                if r.duration < rt.lower {
                    Err(CheckError::Custom(format!("{:?} < lower bound {:?}", r.duration, rt.lower)))
                } else if r.duration > rt.higher {
                    Err(CheckError::Custom(format!("{:?} > higher bound {:?}", r.duration, rt.higher)))
                } else {
                    Ok(())
                }
            }
            Check::AnyOne { of } => {
                if of.iter().any(|c| c.execute(ctx).is_ok()) {
                    Ok(())
                } else {
                    Err(CheckError::Custom("no sub-check in AnyOne passed".to_string()))
                }
            }
            Check::None { of } => {
                if of.iter().any(|c| c.execute(ctx).is_ok()) {
                    Err(CheckError::Custom("a forbidden sub-check in None passed".to_string()))
                } else {
                    Ok(())
                }
            }
            Check::Latency(_) => Err(CheckError::CantCheck(
                "Latency is executed by the test executor, not via Check::execute".to_string(),
            )),
        }
    }

    /// True for `Latency`, which the executor special-cases (spec §4.7).
    pub fn is_latency(&self) -> bool {
        matches!(self, Check::Latency(_))
    }

    /// The registry name of this variant, for diagnostics (spec §7 "the
    /// executor records it with the Check's name").
    pub fn variant_name(&self) -> &'static str {
        match self {
            Check::StatusCode { .. } => "StatusCode",
            Check::Header(_) => "Header",
            Check::Body(_) => "Body",
            Check::Sorted(_) => "Sorted",
            Check::HtmlTag { .. } => "HTMLTag",
            Check::HtmlContains { .. } => "HTMLContains",
            Check::Identity(_) => "Identity",
            Check::Image(_) => "Image",
            Check::Json(_) => "JSON",
            Check::JSONExpr(_) => "JSONExpr",
            Check::Redirect(_) => "Redirect",
            Check::RedirectChain(_) => "RedirectChain",
            Check::FinalUrl(_) => "FinalURL",
            Check::ContentType(_) => "ContentType",
            Check::Cache(_) => "Cache",
            Check::ETag {} => "ETag",
            Check::UTF8Encoded {} => "UTF8Encoded",
            Check::ResponseTime(_) => "ResponseTime",
            Check::AnyOne { .. } => "AnyOne",
            Check::None { .. } => "None",
            Check::Latency(_) => "Latency",
        }
    }
}

fn check_html_count(got: usize, want: i64) -> Result<(), CheckError> {
    match want {
        0 => {
            if got == 0 {
                Err(CheckError::Condition(ConditionError::NotFound))
            } else {
                Ok(())
            }
        }
        n if n < 0 => {
            if got > 0 {
                Err(CheckError::Condition(ConditionError::FoundForbidden))
            } else {
                Ok(())
            }
        }
        n => {
            if got as i64 != n {
                Err(CheckError::Condition(ConditionError::WrongCount { got, want: n }))
            } else {
                Ok(())
            }
        }
    }
}

fn execute_sorted(s: &SortedCheck, r: &Response) -> Result<(), CheckError> {
    let body = r.body_str().map_err(|_| CheckError::BadBody)?;
    let normalized;
    let haystack: &str = if r
        .header_first("Content-Type")
        .map(|ct| ct.contains("text/html"))
        .unwrap_or(false)
    {
        let doc = scraper::Html::parse_document(body);
        normalized = doc.root_element().text().collect::<Vec<_>>().join(" ");
        &normalized
    } else {
        body
    };

    let mut cursor = 0usize;
    let mut found = 0usize;
    for needle in &s.text {
        match haystack[cursor..].find(needle.as_str()) {
            Some(pos) => {
                cursor += pos + needle.len();
                found += 1;
            }
            None => {
                if !s.allow_missing {
                    return Err(CheckError::Custom(format!("{:?} not found in order", needle)));
                }
            }
        }
    }
    if found < 2 {
        return Err(CheckError::CantCheck("fewer than two Sorted items matched".to_string()));
    }
    Ok(())
}

fn execute_image(spec: &ImageCheck, r: &Response) -> Result<(), CheckError> {
    let img = image::load_from_memory(&r.body_bytes)
        .map_err(|e| CheckError::CantCheck(format!("not a decodable image: {}", e)))?;
    if let Some(fmt) = &spec.format {
        let got = image::guess_format(&r.body_bytes)
            .map(|f| format!("{:?}", f).to_lowercase())
            .unwrap_or_default();
        if !got.contains(&fmt.to_lowercase()) {
            return Err(CheckError::Custom(format!("image format {} != {}", got, fmt)));
        }
    }
    use image::GenericImageView;
    let (w, h) = img.dimensions();
    if let Some(want) = spec.width {
        if w != want {
            return Err(CheckError::Custom(format!("width {} != {}", w, want)));
        }
    }
    if let Some(want) = spec.height {
        if h != want {
            return Err(CheckError::Custom(format!("height {} != {}", h, want)));
        }
    }
    if let Some(want_fp) = &spec.fingerprint {
        let got_fp = average_hash(&img);
        let want_bits = u64::from_str_radix(want_fp, 16)
            .map_err(|_| CheckError::CantCheck(format!("bad fingerprint literal: {}", want_fp)))?;
        let distance = (got_fp ^ want_bits).count_ones();
        if distance > spec.threshold {
            return Err(CheckError::Custom(format!(
                "fingerprint distance {} > threshold {}",
                distance, spec.threshold
            )));
        }
    }
    Ok(())
}

/// 8x8 average-hash perceptual fingerprint.
fn average_hash(img: &image::DynamicImage) -> u64 {
    let small = img
        .resize_exact(8, 8, image::imageops::FilterType::Triangle)
        .to_luma8();
    let sum: u32 = small.pixels().map(|p| p.0[0] as u32).sum();
    let avg = sum / 64;
    let mut hash = 0u64;
    for (i, p) in small.pixels().enumerate() {
        if p.0[0] as u32 >= avg {
            hash |= 1 << i;
        }
    }
    hash
}

/// Navigate a JSON document by a `Sep`-delimited path; numeric
/// components index arrays (spec §4.3 `JSON`, §4.4 `JSONExtractor`).
pub fn json_navigate<'v>(
    root: &'v serde_json::Value,
    element: &str,
    sep: &str,
) -> Option<&'v serde_json::Value> {
    if element.is_empty() {
        return Some(root);
    }
    let mut cur = root;
    for part in element.split(sep) {
        cur = if let Ok(idx) = part.parse::<usize>() {
            cur.as_array()?.get(idx)?
        } else {
            cur.as_object()?.get(part)?
        };
    }
    Some(cur)
}

/// Render a JSON value as the raw substring a Condition should see:
/// strings are unquoted, everything else is the compact JSON rendering.
pub fn json_value_as_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn execute_json(j: &JsonCheck, r: &Response) -> Result<(), CheckError> {
    let body = r.body_str().map_err(|_| CheckError::BadBody)?;
    let root: serde_json::Value =
        serde_json::from_str(body).map_err(|e| CheckError::CantCheck(format!("invalid JSON: {}", e)))?;
    let node = json_navigate(&root, &j.element, &j.sep)
        .ok_or_else(|| CheckError::CantCheck(format!("no such JSON element: {}", j.element)))?;
    let text = json_value_as_text(node);
    if !j.condition.is_empty() {
        j.condition.check(&text)?;
    }
    if let Some(embedded) = &j.embedded {
        let synthetic = Response {
            body_bytes: text.as_bytes().to_vec(),
            body_text: Some(text),
            ..r.clone()
        };
        let ctx = CheckContext {
            request: &Request::default(),
            response: &synthetic,
            revalidate: None,
        };
        embedded.execute(&ctx)?;
    }
    Ok(())
}

fn execute_json_expr(expr: &JsonExprCheck, r: &Response) -> Result<(), CheckError> {
    let body = r.body_str().map_err(|_| CheckError::BadBody)?;
    let root: serde_json::Value =
        serde_json::from_str(body).map_err(|e| CheckError::CantCheck(format!("invalid JSON: {}", e)))?;
    crate::cel::eval_bool_expr(&expr.expression, &root)
        .map_err(|e| CheckError::CantCheck(e.to_string()))
        .and_then(|ok| {
            if ok {
                Ok(())
            } else {
                Err(CheckError::Custom(format!("expression false: {}", expr.expression)))
            }
        })
}

fn execute_redirect(rc: &RedirectCheck, r: &Response) -> Result<(), CheckError> {
    if r.redirects.is_empty() {
        return Err(CheckError::Custom("no redirect occurred".to_string()));
    }
    if let Some(via) = rc.via_status {
        if !r.redirects.iter().any(|h| h.status == via) {
            return Err(CheckError::Custom(format!("no hop with status {}", via)));
        }
    }
    if let Some(cond) = &rc.to_url {
        cond.check(&r.final_url)?;
    }
    Ok(())
}

fn execute_redirect_chain(rc: &RedirectChainCheck, r: &Response) -> Result<(), CheckError> {
    let got: Vec<&str> = r.redirects.iter().map(|h| h.url.as_str()).collect();
    if got.len() != rc.chain.len() || got.iter().zip(&rc.chain).any(|(g, w)| *g != w) {
        return Err(CheckError::Custom(format!(
            "redirect chain {:?} != expected {:?}",
            got, rc.chain
        )));
    }
    Ok(())
}

fn execute_cache(c: &CacheCheck, r: &Response) -> Result<(), CheckError> {
    let header = r
        .header_first("Cache-Control")
        .ok_or_else(|| CheckError::Custom("missing Cache-Control header".to_string()))?;
    let directives: Vec<&str> = header.split(',').map(|d| d.trim()).collect();
    let has = |name: &str| directives.iter().any(|d| d.eq_ignore_ascii_case(name));
    let max_age = directives.iter().find_map(|d| {
        let (k, v) = d.split_once('=')?;
        if k.trim().eq_ignore_ascii_case("max-age") {
            v.trim().parse::<u64>().ok()
        } else {
            None
        }
    });

    if c.no_store && !has("no-store") {
        return Err(CheckError::Custom("expected no-store".to_string()));
    }
    if c.no_cache && !has("no-cache") {
        return Err(CheckError::Custom("expected no-cache".to_string()));
    }
    if c.private && !has("private") {
        return Err(CheckError::Custom("expected private".to_string()));
    }
    if c.at_least.is_some() || c.at_most.is_some() {
        let age = max_age.ok_or_else(|| CheckError::Custom("no max-age directive present".to_string()))?;
        let age = Duration::from_secs(age);
        if let Some(lo) = c.at_least {
            if age < lo {
                return Err(CheckError::Custom(format!("max-age {:?} < {:?}", age, lo)));
            }
        }
        if let Some(hi) = c.at_most {
            if age > hi {
                return Err(CheckError::Custom(format!("max-age {:?} > {:?}", age, hi)));
            }
        }
    }
    if !c.no_store && !c.no_cache && !c.private && c.at_least.is_none() && c.at_most.is_none() && has("no-store") && has("no-cache")
    {
        return Err(CheckError::Custom("errIllegalCacheControl".to_string()));
    }
    Ok(())
}

fn execute_etag(ctx: &CheckContext) -> Result<(), CheckError> {
    let r = ctx.response;
    let values = r.header_all("ETag");
    if values.is_empty() {
        return Err(CheckError::Custom("errNoETag".to_string()));
    }
    if values.len() > 1 {
        return Err(CheckError::Custom("multiple ETag headers".to_string()));
    }
    let tag = values[0];
    if tag.is_empty() {
        return Err(CheckError::Custom("empty ETag".to_string()));
    }
    if !(tag.starts_with('"') || tag.starts_with("W/\"")) || !tag.ends_with('"') {
        return Err(CheckError::Custom("ETag is not quoted".to_string()));
    }
    if let Some(revalidate) = ctx.revalidate {
        let revalidated = revalidate(tag).map_err(|e| CheckError::CantCheck(e.to_string()))?;
        if revalidated.status != 304 {
            return Err(CheckError::Custom("errETagIgnored".to_string()));
        }
    }
    Ok(())
}

/// Parse `"50% <= 150ms; 95% <= 250ms"` (U+2264 separator, spec §6).
pub fn parse_percentile_limits(spec: &str) -> Result<Vec<PercentileLimit>, String> {
    spec.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|clause| {
            let (pct, dur) = clause
                .split_once('\u{2264}')
                .ok_or_else(|| format!("missing U+2264 separator in {:?}", clause))?;
            let pct = pct.trim().trim_end_matches('%');
            let quantile: f64 = pct
                .parse()
                .map_err(|_| format!("bad percentile {:?}", pct))?;
            let max = parse_duration(dur.trim())?;
            Ok(PercentileLimit { quantile, max })
        })
        .collect()
}

/// Parse a compound duration like `"1.5s"` or `"250ms"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (num_part, unit) = if let Some(n) = s.strip_suffix("ms") {
        (n, "ms")
    } else if let Some(n) = s.strip_suffix('s') {
        (n, "s")
    } else if let Some(n) = s.strip_suffix('m') {
        (n, "m")
    } else if let Some(n) = s.strip_suffix('h') {
        (n, "h")
    } else {
        return Err(format!("no unit on duration {:?}", s));
    };
    let value: f64 = num_part.trim().parse().map_err(|_| format!("bad duration {:?}", s))?;
    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => unreachable!(),
    };
    Ok(Duration::from_millis(millis.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(response: &'a Response, request: &'a Request) -> CheckContext<'a> {
        CheckContext {
            request,
            response,
            revalidate: None,
        }
    }

    #[test]
    fn status_code_defaults_to_200() {
        let check = Check::StatusCode { expect: 0 };
        let response = Response {
            status: 200,
            ..Default::default()
        };
        let request = Request::default();
        assert!(check.execute(&ctx(&response, &request)).is_ok());
    }

    #[test]
    fn json_path_navigates_arrays_and_objects() {
        let root: serde_json::Value =
            serde_json::from_str(r#"{"a":"foo","b":"bar","c":[1,2,3]}"#).unwrap();
        assert_eq!(
            json_value_as_text(json_navigate(&root, "c.2", ".").unwrap()),
            "3"
        );
        assert_eq!(json_value_as_text(json_navigate(&root, "a", ".").unwrap()), "foo");
    }

    #[test]
    fn cache_control_at_least_with_no_cache_passes() {
        let c = CacheCheck {
            no_cache: true,
            at_least: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let response = Response {
            headers: vec![("Cache-Control".to_string(), "no-cache, max-age=90".to_string())],
            ..Default::default()
        };
        assert!(execute_cache(&c, &response).is_ok());
    }

    #[test]
    fn cache_control_no_store_and_no_cache_alone_is_illegal() {
        let c = CacheCheck::default();
        let response = Response {
            headers: vec![("Cache-Control".to_string(), "no-cache, no-store".to_string())],
            ..Default::default()
        };
        assert_eq!(
            execute_cache(&c, &response).unwrap_err().to_string(),
            "errIllegalCacheControl"
        );
    }

    #[test]
    fn etag_requires_quoted_value() {
        let response = Response {
            headers: vec![("ETag".to_string(), "unquoted".to_string())],
            ..Default::default()
        };
        let request = Request::default();
        let err = execute_etag(&ctx(&response, &request)).unwrap_err();
        assert_eq!(err.to_string(), "ETag is not quoted");
    }

    #[test]
    fn etag_missing_reports_errnoetag() {
        let response = Response::default();
        let request = Request::default();
        assert_eq!(execute_etag(&ctx(&response, &request)).unwrap_err().to_string(), "errNoETag");
    }

    #[test]
    fn etag_revalidation_checks_304() {
        let response = Response {
            headers: vec![("ETag".to_string(), "\"halleluja-12345\"".to_string())],
            ..Default::default()
        };
        let request = Request::default();
        let always_ok = |_tag: &str| {
            Ok(Response {
                status: 304,
                ..Default::default()
            })
        };
        let c = CheckContext {
            request: &request,
            response: &response,
            revalidate: Some(&always_ok),
        };
        assert!(execute_etag(&c).is_ok());

        let always_ignored = |_tag: &str| {
            Ok(Response {
                status: 200,
                ..Default::default()
            })
        };
        let c2 = CheckContext {
            request: &request,
            response: &response,
            revalidate: Some(&always_ignored),
        };
        assert_eq!(execute_etag(&c2).unwrap_err().to_string(), "errETagIgnored");
    }

    #[test]
    fn percentile_limits_parse() {
        let limits = parse_percentile_limits("50% \u{2264} 150ms; 95% \u{2264} 1.5s").unwrap();
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[0].quantile, 50.0);
        assert_eq!(limits[0].max, Duration::from_millis(150));
        assert_eq!(limits[1].max, Duration::from_millis(1500));
    }

    #[test]
    fn sorted_requires_at_least_two_items() {
        let mut check = Check::Sorted(SortedCheck {
            text: vec!["only-one".to_string()],
            allow_missing: false,
        });
        assert!(check.prepare().is_err());
    }

    #[test]
    fn any_one_passes_if_one_sub_check_passes() {
        let check = Check::AnyOne {
            of: vec![
                Check::StatusCode { expect: 404 },
                Check::StatusCode { expect: 200 },
            ],
        };
        let response = Response {
            status: 200,
            ..Default::default()
        };
        let request = Request::default();
        assert!(check.execute(&ctx(&response, &request)).is_ok());
    }

    #[test]
    fn none_fails_if_any_sub_check_passes() {
        let check = Check::None {
            of: vec![Check::StatusCode { expect: 200 }],
        };
        let response = Response {
            status: 200,
            ..Default::default()
        };
        let request = Request::default();
        assert!(check.execute(&ctx(&response, &request)).is_err());
    }

    #[test]
    fn utf8_check_rejects_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"hello");
        let response = Response {
            body_bytes: bytes,
            body_text: Some("hello".to_string()),
            ..Default::default()
        };
        let request = Request::default();
        let check = Check::UTF8Encoded {};
        assert!(check.execute(&ctx(&response, &request)).is_err());
    }
}
