//! Extractor variants (spec §4.4) — pull a string value out of a
//! completed exchange, to seed variables for subsequent Tests.

use crate::checks::{json_navigate, json_value_as_text, parse_duration};
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use chrono::{DateTime, Months, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractError {
    NotFound,
    Custom(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::NotFound => write!(f, "not found"),
            ExtractError::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

/// Everything an Extractor needs about one completed attempt.
pub struct ExtractContext<'a> {
    pub request: &'a Request,
    pub response: &'a Response,
    /// The same `now()` the Test's special variables were resolved
    /// against, so `SetTimestamp` stays consistent with `{{NOW}}`.
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HtmlExtractorParams {
    #[serde(rename = "Selector")]
    pub selector: String,
    #[serde(default = "default_attribute", rename = "Attribute")]
    pub attribute: String,
}

fn default_attribute() -> String {
    "~text~".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BodyExtractorParams {
    #[serde(rename = "Regexp")]
    pub regexp: String,
    #[serde(default, rename = "Submatch")]
    pub submatch: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonExtractorParams {
    #[serde(default, rename = "Element")]
    pub element: String,
    #[serde(default = "default_sep", rename = "Sep")]
    pub sep: String,
    #[serde(default, rename = "Embedded")]
    pub embedded: Option<Box<Extractor>>,
}

fn default_sep() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CookieExtractorParams {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsExtractorParams {
    #[serde(rename = "Script")]
    pub script: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetVariableParams {
    #[serde(default, rename = "To")]
    pub to: Option<String>,
    #[serde(default, rename = "Eval")]
    pub eval: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetTimestampParams {
    #[serde(default, rename = "DeltaT")]
    pub delta_t: Option<String>,
    #[serde(default, rename = "DeltaYear")]
    pub delta_year: i32,
    #[serde(default, rename = "DeltaMonth")]
    pub delta_month: i32,
    #[serde(default, rename = "DeltaDay")]
    pub delta_day: i64,
    #[serde(default = "default_format", rename = "Format")]
    pub format: String,
}

fn default_format() -> String {
    "%+".to_string()
}

/// The full Extractor enum (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Extractor")]
pub enum Extractor {
    #[serde(rename = "HTMLExtractor")]
    HtmlExtractor {
        #[serde(flatten)]
        params: HtmlExtractorParams,
        #[serde(skip)]
        compiled: Option<crate::checks::CompiledSelector>,
    },
    BodyExtractor {
        #[serde(flatten)]
        params: BodyExtractorParams,
        #[serde(skip)]
        compiled: Option<Regex>,
    },
    #[serde(rename = "JSONExtractor")]
    JsonExtractor(JsonExtractorParams),
    CookieExtractor(CookieExtractorParams),
    JSExtractor(JsExtractorParams),
    SetVariable(SetVariableParams),
    SetTimestamp(SetTimestampParams),
}

impl Extractor {
    /// The registry name of this variant, for diagnostics.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Extractor::HtmlExtractor { .. } => "HTMLExtractor",
            Extractor::BodyExtractor { .. } => "BodyExtractor",
            Extractor::JsonExtractor(_) => "JSONExtractor",
            Extractor::CookieExtractor(_) => "CookieExtractor",
            Extractor::JSExtractor(_) => "JSExtractor",
            Extractor::SetVariable(_) => "SetVariable",
            Extractor::SetTimestamp(_) => "SetTimestamp",
        }
    }

    pub fn prepare(&mut self) -> Result<(), Error> {
        match self {
            Extractor::HtmlExtractor { params, compiled } => {
                let sel = scraper::Selector::parse(&params.selector)
                    .map_err(|e| Error::MalformedCheck(format!("bad selector {:?}: {:?}", params.selector, e)))?;
                *compiled = Some(crate::checks::CompiledSelector(sel));
            }
            Extractor::BodyExtractor { params, compiled } => {
                let re = Regex::new(&params.regexp)
                    .map_err(|e| Error::MalformedCheck(format!("bad regexp {:?}: {}", params.regexp, e)))?;
                *compiled = Some(re);
            }
            Extractor::JsonExtractor(p) => {
                if let Some(embedded) = &mut p.embedded {
                    embedded.prepare()?;
                }
            }
            Extractor::JSExtractor(p) => {
                rhai_engine()
                    .compile(&p.script)
                    .map_err(|e| Error::MalformedCheck(format!("bad script: {}", e)))?;
            }
            Extractor::SetVariable(p) => {
                if p.to.is_none() && p.eval.is_none() {
                    return Err(Error::MalformedCheck("SetVariable requires To or Eval".to_string()));
                }
                if let Some(expr) = &p.eval {
                    rhai_engine()
                        .compile_expression(expr)
                        .map_err(|e| Error::MalformedCheck(format!("bad Eval expression: {}", e)))?;
                }
            }
            Extractor::CookieExtractor(_) | Extractor::SetTimestamp(_) => {}
        }
        Ok(())
    }

    pub fn extract(&self, ctx: &ExtractContext) -> Result<String, ExtractError> {
        match self {
            Extractor::HtmlExtractor { params, compiled } => {
                let sel = &compiled.as_ref().expect("prepared").0;
                let body = ctx
                    .response
                    .body_str()
                    .map_err(|_| ExtractError::Custom("body could not be read".to_string()))?;
                let doc = scraper::Html::parse_document(body);
                let el = doc.select(sel).next().ok_or(ExtractError::NotFound)?;
                match params.attribute.as_str() {
                    "~text~" => Ok(el
                        .text()
                        .collect::<Vec<_>>()
                        .join(" ")
                        .split_whitespace()
                        .collect::<Vec<_>>()
                        .join(" ")),
                    "~rawtext~" => Ok(el.text().collect::<Vec<_>>().join("")),
                    attr => el
                        .value()
                        .attr(attr)
                        .map(|s| s.to_string())
                        .ok_or(ExtractError::NotFound),
                }
            }
            Extractor::BodyExtractor { params, compiled } => {
                let re = compiled.as_ref().expect("prepared");
                let body = ctx
                    .response
                    .body_str()
                    .map_err(|_| ExtractError::Custom("body could not be read".to_string()))?;
                let caps = re.captures(body).ok_or(ExtractError::NotFound)?;
                let group = if params.submatch.is_empty() {
                    caps.get(if caps.len() > 1 { 1 } else { 0 })
                } else if let Ok(idx) = params.submatch.parse::<usize>() {
                    caps.get(idx)
                } else {
                    caps.name(&params.submatch)
                };
                group.map(|m| m.as_str().to_string()).ok_or(ExtractError::NotFound)
            }
            Extractor::JsonExtractor(p) => {
                let body = ctx
                    .response
                    .body_str()
                    .map_err(|_| ExtractError::Custom("body could not be read".to_string()))?;
                let root: serde_json::Value = serde_json::from_str(body)
                    .map_err(|e| ExtractError::Custom(format!("invalid JSON: {}", e)))?;
                let node = json_navigate(&root, &p.element, &p.sep).ok_or(ExtractError::NotFound)?;
                let text = json_value_as_text(node);
                if let Some(embedded) = &p.embedded {
                    let synthetic = Response {
                        body_bytes: text.as_bytes().to_vec(),
                        body_text: Some(text),
                        ..ctx.response.clone()
                    };
                    let sub_ctx = ExtractContext {
                        request: ctx.request,
                        response: &synthetic,
                        now: ctx.now,
                    };
                    embedded.extract(&sub_ctx)
                } else {
                    Ok(text)
                }
            }
            Extractor::CookieExtractor(p) => ctx
                .response
                .header_all("Set-Cookie")
                .iter()
                .find_map(|raw| {
                    let (name, value) = raw.split_once('=')?;
                    if name.trim() == p.name {
                        Some(value.split(';').next().unwrap_or("").trim().to_string())
                    } else {
                        None
                    }
                })
                .ok_or(ExtractError::NotFound),
            Extractor::JSExtractor(p) => extract_js(p, ctx),
            Extractor::SetVariable(p) => extract_set_variable(p),
            Extractor::SetTimestamp(p) => extract_set_timestamp(p, ctx.now),
        }
    }
}

/// A `rhai::Engine` pre-registered with the helper functions
/// `SetVariable.Eval` and `JSExtractor.Script` both draw on (spec §4.4).
fn rhai_engine() -> rhai::Engine {
    let mut engine = rhai::Engine::new();
    engine.register_fn("strlen", |s: &str| s.chars().count() as i64);
    engine.register_fn("substring", |s: &str, start: i64, end: i64| -> String {
        let chars: Vec<char> = s.chars().collect();
        let start = start.max(0) as usize;
        let end = (end.max(0) as usize).min(chars.len());
        if start >= end {
            String::new()
        } else {
            chars[start..end].iter().collect()
        }
    });
    engine.register_fn("replace", |s: &str, from: &str, to: &str| -> String { s.replace(from, to) });
    engine.register_fn("strindex", |s: &str, needle: &str| -> i64 {
        s.find(needle).map(|b| s[..b].chars().count() as i64).unwrap_or(-1)
    });
    engine.register_fn("seconds", |s: &str| -> i64 {
        parse_duration(s).map(|d| d.as_secs() as i64).unwrap_or(0)
    });
    engine
}

fn extract_set_variable(p: &SetVariableParams) -> Result<String, ExtractError> {
    if let Some(expr) = &p.eval {
        let engine = rhai_engine();
        let result: rhai::Dynamic = engine
            .eval_expression(expr)
            .map_err(|e| ExtractError::Custom(format!("eval failed: {}", e)))?;
        Ok(dynamic_to_string(&result))
    } else {
        Ok(p.to.clone().unwrap_or_default())
    }
}

fn extract_set_timestamp(p: &SetTimestampParams, now: DateTime<Utc>) -> Result<String, ExtractError> {
    let mut t = now;
    if let Some(dt) = &p.delta_t {
        let (sign, rest) = if let Some(r) = dt.strip_prefix('-') {
            (-1i64, r)
        } else {
            (1i64, dt.strip_prefix('+').unwrap_or(dt))
        };
        let dur = parse_duration(rest).map_err(ExtractError::Custom)?;
        let chrono_dur = chrono::Duration::from_std(dur).unwrap_or_default();
        t = if sign < 0 { t - chrono_dur } else { t + chrono_dur };
    }
    if p.delta_year != 0 {
        t = apply_months(t, p.delta_year * 12);
    }
    if p.delta_month != 0 {
        t = apply_months(t, p.delta_month);
    }
    if p.delta_day != 0 {
        t += chrono::Duration::days(p.delta_day);
    }
    if p.format == "%+" {
        Ok(t.to_rfc3339())
    } else {
        Ok(t.format(&p.format).to_string())
    }
}

fn apply_months(t: DateTime<Utc>, months: i32) -> DateTime<Utc> {
    if months >= 0 {
        t.checked_add_months(Months::new(months as u32)).unwrap_or(t)
    } else {
        t.checked_sub_months(Months::new((-months) as u32)).unwrap_or(t)
    }
}

fn extract_js(p: &JsExtractorParams, ctx: &ExtractContext) -> Result<String, ExtractError> {
    let engine = rhai_engine();
    let mut scope = rhai::Scope::new();
    scope.push("status", ctx.response.status as i64);
    let body = ctx.response.body_str().unwrap_or("").to_string();
    scope.push("body", body.clone());
    let headers: rhai::Map = ctx
        .response
        .headers
        .iter()
        .map(|(k, v)| (k.clone().into(), rhai::Dynamic::from(v.clone())))
        .collect();
    scope.push("headers", headers);
    let json: rhai::Dynamic = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| serde_json::from_value::<rhai::Dynamic>(v).ok())
        .unwrap_or(rhai::Dynamic::UNIT);
    scope.push("json", json);

    let result: rhai::Dynamic = engine
        .eval_with_scope(&mut scope, &p.script)
        .map_err(|e| ExtractError::Custom(format!("script error: {}", e)))?;
    interpret_js_result(result)
}

/// Interpret a script's final value per spec §4.4: an Object with an
/// `errmsg` field is an error; an Array uses its first element; unit
/// or null is an error; anything else is stringified.
fn interpret_js_result(v: rhai::Dynamic) -> Result<String, ExtractError> {
    if v.is_unit() {
        return Err(ExtractError::Custom("script returned no value".to_string()));
    }
    if let Some(map) = v.clone().try_cast::<rhai::Map>() {
        if let Some(errmsg) = map.get("errmsg") {
            return Err(ExtractError::Custom(errmsg.to_string()));
        }
        return Err(ExtractError::Custom("script returned an object without errmsg".to_string()));
    }
    if let Some(arr) = v.clone().try_cast::<rhai::Array>() {
        return match arr.into_iter().next() {
            Some(first) => interpret_js_result(first),
            None => Err(ExtractError::Custom("script returned an empty array".to_string())),
        };
    }
    Ok(dynamic_to_string(&v))
}

fn dynamic_to_string(v: &rhai::Dynamic) -> String {
    if let Some(s) = v.clone().try_cast::<String>() {
        s
    } else if let Some(i) = v.clone().try_cast::<i64>() {
        i.to_string()
    } else if let Some(f) = v.clone().try_cast::<f64>() {
        f.to_string()
    } else if let Some(b) = v.clone().try_cast::<bool>() {
        b.to_string()
    } else {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(response: &Response, request: &Request) -> ExtractContext<'static> {
        let response: &'static Response = Box::leak(Box::new(response.clone()));
        let request: &'static Request = Box::leak(Box::new(request.clone()));
        ExtractContext {
            request,
            response,
            now: Utc::now(),
        }
    }

    #[test]
    fn json_extractor_navigates_arrays() {
        let response = Response {
            body_bytes: br#"{"a":"foo","b":"bar","c":[1,2,3]}"#.to_vec(),
            body_text: Some(r#"{"a":"foo","b":"bar","c":[1,2,3]}"#.to_string()),
            ..Default::default()
        };
        let request = Request::default();
        let e = Extractor::JsonExtractor(JsonExtractorParams {
            element: "c.2".to_string(),
            sep: ".".to_string(),
            embedded: None,
        });
        assert_eq!(e.extract(&ctx(&response, &request)).unwrap(), "3");
    }

    #[test]
    fn cookie_extractor_finds_named_cookie() {
        let response = Response {
            headers: vec![
                ("Set-Cookie".to_string(), "session=abc123; Path=/".to_string()),
                ("Set-Cookie".to_string(), "other=zzz; Path=/".to_string()),
            ],
            ..Default::default()
        };
        let request = Request::default();
        let e = Extractor::CookieExtractor(CookieExtractorParams {
            name: "session".to_string(),
        });
        assert_eq!(e.extract(&ctx(&response, &request)).unwrap(), "abc123");
    }

    #[test]
    fn set_variable_constant() {
        let e = Extractor::SetVariable(SetVariableParams {
            to: Some("literal".to_string()),
            eval: None,
        });
        let response = Response::default();
        let request = Request::default();
        assert_eq!(e.extract(&ctx(&response, &request)).unwrap(), "literal");
    }

    #[test]
    fn set_variable_eval_uses_helper_functions() {
        let e = Extractor::SetVariable(SetVariableParams {
            to: None,
            eval: Some("strlen(\"hello\")".to_string()),
        });
        let response = Response::default();
        let request = Request::default();
        assert_eq!(e.extract(&ctx(&response, &request)).unwrap(), "5");
    }

    #[test]
    fn body_extractor_picks_submatch() {
        let response = Response {
            body_bytes: b"order #4711 confirmed".to_vec(),
            body_text: Some("order #4711 confirmed".to_string()),
            ..Default::default()
        };
        let request = Request::default();
        let mut e = Extractor::BodyExtractor {
            params: BodyExtractorParams {
                regexp: r"order #(\d+)".to_string(),
                submatch: "1".to_string(),
            },
            compiled: None,
        };
        e.prepare().unwrap();
        assert_eq!(e.extract(&ctx(&response, &request)).unwrap(), "4711");
    }

    #[test]
    fn set_timestamp_applies_day_offset() {
        let e = Extractor::SetTimestamp(SetTimestampParams {
            delta_t: None,
            delta_year: 0,
            delta_month: 0,
            delta_day: 1,
            format: "%Y-%m-%d".to_string(),
        });
        let response = Response::default();
        let request = Request::default();
        let now = Utc::now();
        let c = ExtractContext {
            request: &request,
            response: &response,
            now,
        };
        let expected = (now + chrono::Duration::days(1)).format("%Y-%m-%d").to_string();
        assert_eq!(e.extract(&c).unwrap(), expected);
    }
}
