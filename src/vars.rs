//! Variable substitution & templating (spec §4.5).
//!
//! Three independent pieces: (1) special-variable discovery/resolution
//! (`{{NOW …}}`, `{{RANDOM …}}`), resolved once per top-level
//! execution and folded into the ordinary variable map; (2) a single,
//! simultaneous substitution pass over every string field in a
//! Test/Request/Check/Extractor graph — never recursive re-expansion
//! of substituted content; (3) the `Repeat`/unroll LCM procedure.

use crate::checks::{Check, LatencyCheck};
use crate::condition::Condition;
use crate::extract::Extractor;
use crate::request::Request;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// A plain user/extracted variable table.
pub type VarMap = HashMap<String, String>;

/// Integer-substitution table: sentinel int → real value (spec §4.5's
/// "`{{NAME}}` where `NAME` matches `#<signed-int>`").
pub type IntVarMap = HashMap<i64, i64>;

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]+)\}\}").unwrap())
}

/// The process-wide PRNG, guarded for concurrent access (spec §4.5,
/// §5 "Random source sharing").
fn shared_rng() -> &'static Mutex<rand::rngs::StdRng> {
    static RNG: OnceLock<Mutex<rand::rngs::StdRng>> = OnceLock::new();
    RNG.get_or_init(|| Mutex::new(rand::SeedableRng::from_entropy()))
}

const DEFAULT_TEXT_CORPUS_FR: &[&str] = &[
    "le", "de", "un", "être", "et", "à", "il", "avoir", "ne", "je", "son", "que", "se", "qui",
    "ce", "dans", "en", "du", "elle", "au", "nous", "vous", "ils", "mais", "comme", "tout",
];

/// Find every `{{…}}` token in a string; return the raw inner text (no braces).
pub fn find_tokens(s: &str) -> Vec<String> {
    token_re().captures_iter(s).map(|c| c[1].to_string()).collect()
}

/// Resolve a single special-variable token body (without braces). `None`
/// if `token` does not look like a special variable at all (ordinary
/// user variable, handled by the caller's plain lookup instead).
pub fn resolve_special(token: &str, now: DateTime<Utc>) -> Option<String> {
    let token = token.trim();
    if let Some(rest) = token.strip_prefix("NOW") {
        return Some(resolve_now(rest.trim(), now));
    }
    if let Some(rest) = token.strip_prefix("RANDOM") {
        return Some(resolve_random(rest.trim()));
    }
    None
}

fn resolve_now(rest: &str, now: DateTime<Utc>) -> String {
    let (offset_part, layout) = match rest.split_once('|') {
        Some((o, l)) => (o.trim(), Some(l.trim().trim_matches('"'))),
        None => (rest, None),
    };

    let mut t = now;
    if !offset_part.is_empty() {
        let (sign, spec) = if let Some(s) = offset_part.strip_prefix('-') {
            (-1i64, s.trim())
        } else if let Some(s) = offset_part.strip_prefix('+') {
            (1i64, s.trim())
        } else {
            (1i64, offset_part)
        };
        if let Some(delta) = parse_offset(spec) {
            t = if sign < 0 { t - delta } else { t + delta };
        }
    }

    match layout {
        Some(fmt) => t.format(fmt).to_string(),
        // RFC1123 default (spec §4.5).
        None => t.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
    }
}

fn parse_offset(spec: &str) -> Option<ChronoDuration> {
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }
    let (num, unit) = spec.split_at(spec.len() - 1);
    let n: i64 = num.trim().parse().ok()?;
    Some(match unit {
        "s" => ChronoDuration::seconds(n),
        "m" => ChronoDuration::minutes(n),
        "h" => ChronoDuration::hours(n),
        "d" => ChronoDuration::days(n),
        _ => return None,
    })
}

fn resolve_random(rest: &str) -> String {
    let mut parts = rest.split_whitespace();
    match parts.next() {
        Some("NUMBER") => {
            let remaining: Vec<&str> = parts.collect();
            random_number(&remaining)
        }
        Some("TEXT") => {
            let remaining: Vec<&str> = parts.collect();
            random_text(&remaining)
        }
        Some("EMAIL") => {
            let domain = parts.next().unwrap_or("example.com");
            random_email(domain)
        }
        _ => String::new(),
    }
}

fn parse_range(token: Option<&str>, default_lo: i64) -> (i64, i64) {
    match token {
        Some(spec) if spec.contains('-') => {
            let mut it = spec.splitn(2, '-');
            let lo: i64 = it.next().unwrap().parse().unwrap_or(default_lo);
            let hi: i64 = it.next().unwrap().parse().unwrap_or(lo);
            (lo, hi)
        }
        Some(spec) => (default_lo, spec.parse().unwrap_or(default_lo)),
        None => (default_lo, default_lo),
    }
}

fn random_number(args: &[&str]) -> String {
    let (lo, hi) = parse_range(args.first().copied(), 1);
    let fmt = args.get(1).copied().unwrap_or("%d");
    let value = {
        let mut rng = shared_rng().lock().unwrap();
        if hi <= lo {
            lo
        } else {
            rng.gen_range(lo..=hi)
        }
    };
    if fmt == "%d" {
        value.to_string()
    } else {
        fmt.replace("%d", &value.to_string())
    }
}

fn random_text(args: &[&str]) -> String {
    // First token is an optional language code (default "fr"); anything
    // that parses as a bound instead is the `[lo-]hi` word count.
    let rest: &[&str] = match args.first() {
        Some(s) if s.parse::<i64>().is_err() && !s.contains('-') => &args[1..],
        _ => args,
    };
    let (lo, hi) = parse_range(rest.first().copied(), 4);
    let corpus = DEFAULT_TEXT_CORPUS_FR;
    let mut rng = shared_rng().lock().unwrap();
    let n = if hi <= lo { lo } else { rng.gen_range(lo..=hi) } as usize;
    (0..n)
        .map(|_| corpus[rng.gen_range(0..corpus.len())])
        .collect::<Vec<_>>()
        .join(" ")
}

fn random_email(domain: &str) -> String {
    const FIRST: &[&str] = &["alice", "bob", "claire", "daniel", "elise", "farid"];
    const LAST: &[&str] = &["martin", "bernard", "dubois", "thomas", "robert"];
    let (first, last, n) = {
        let mut rng = shared_rng().lock().unwrap();
        (
            FIRST[rng.gen_range(0..FIRST.len())],
            LAST[rng.gen_range(0..LAST.len())],
            rng.gen_range(1..1000),
        )
    };
    format!("{}.{}{}@{}", first, last, n, domain)
}

/// Build the integer-substitution table from a resolved variable map:
/// entries whose key looks like `#<signed-int>` and whose value parses
/// as an integer become `sentinel -> value` pairs (spec §4.5 "integer
/// fields whose current value is a registered integer-substitution
/// key"). Everything else is ignored.
pub fn int_vars_from(vars: &VarMap) -> IntVarMap {
    vars.iter()
        .filter_map(|(k, v)| {
            let sentinel: i64 = k.strip_prefix('#')?.parse().ok()?;
            let value: i64 = v.parse().ok()?;
            Some((sentinel, value))
        })
        .collect()
}

/// Build the full substitution map for one top-level execution: user
/// variables plus every special-variable token discovered in `sources`,
/// each resolved exactly once.
pub fn resolve_all(sources: &[&str], user_vars: &VarMap, now: DateTime<Utc>) -> VarMap {
    let mut resolved = user_vars.clone();
    let mut specials: Vec<String> = sources.iter().flat_map(|s| find_tokens(s)).collect();
    specials.sort();
    specials.dedup();
    for token in specials {
        if resolved.contains_key(&token) {
            continue;
        }
        if let Some(value) = resolve_special(&token, now) {
            resolved.insert(token, value);
        }
    }
    resolved
}

/// Replace every `{{NAME}}` occurrence in `s` simultaneously using `vars`.
/// Unknown tokens are left untouched.
pub fn substitute_str(s: &str, vars: &VarMap) -> String {
    token_re()
        .replace_all(s, |caps: &regex::Captures| {
            let key = caps[1].trim();
            vars.get(key).cloned().unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn sub_opt(v: &mut Option<String>, vars: &VarMap) {
    if let Some(s) = v {
        *s = substitute_str(s, vars);
    }
}

fn sub_int_opt(v: &mut Option<i64>, int_vars: &IntVarMap) {
    if let Some(n) = v {
        if let Some(mapped) = int_vars.get(n) {
            *n = *mapped;
        }
    }
}

impl Condition {
    /// Apply string/int substitution to every predicate field (spec §4.5).
    pub fn substitute(&mut self, vars: &VarMap, int_vars: &IntVarMap) {
        sub_opt(&mut self.equals, vars);
        sub_opt(&mut self.prefix, vars);
        sub_opt(&mut self.suffix, vars);
        sub_opt(&mut self.contains, vars);
        sub_opt(&mut self.regexp, vars);
        sub_opt(&mut self.is, vars);
        sub_opt(&mut self.time, vars);
        sub_int_opt(&mut self.count, int_vars);
    }
}

/// Resolve the top-level `Body` special form (spec §6): `@file:PATH`
/// is left untouched here (its content is read verbatim at dispatch
/// time, no substitution); `@vfile:PATH` is read and substituted
/// eagerly so the file's own `{{…}}` tokens see this attempt's
/// variables, then stored back as literal content (the dispatch layer
/// sees a plain string, never re-reads the file). A missing `@vfile:`
/// target is left as-is; the dispatch layer's own file read then
/// surfaces the IO error as a transport failure.
fn substitute_body(raw: &str, vars: &VarMap) -> String {
    match raw.strip_prefix("@vfile:") {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(contents) => substitute_str(&contents, vars),
            Err(_) => raw.to_string(),
        },
        None => substitute_str(raw, vars),
    }
}

impl Request {
    /// Apply substitution to the URL, headers, params, cookies, and body.
    pub fn substitute(&mut self, vars: &VarMap) {
        self.url = substitute_str(&self.url, vars);
        self.body = substitute_body(&self.body, vars);
        self.params = self.params.map_values(|v| substitute_str(v, vars));
        self.header = self.header.map_values(|v| substitute_str(v, vars));
        for c in self.cookies.iter_mut() {
            c.value = substitute_str(&c.value, vars);
        }
        if let Some(auth) = &mut self.basic_auth {
            auth.username = substitute_str(&auth.username, vars);
            auth.password = substitute_str(&auth.password, vars);
        }
    }
}

impl Check {
    /// Recursively apply substitution to every string/int field (spec §4.5).
    pub fn substitute(&mut self, vars: &VarMap, int_vars: &IntVarMap) {
        match self {
            Check::StatusCode { expect } => {
                if let Some(mapped) = int_vars.get(&(*expect as i64)) {
                    *expect = *mapped as u16;
                }
            }
            Check::Header(h) => {
                h.name = substitute_str(&h.name, vars);
                h.condition.substitute(vars, int_vars);
            }
            Check::Body(c) | Check::FinalUrl(c) => c.substitute(vars, int_vars),
            Check::Sorted(s) => {
                for t in s.text.iter_mut() {
                    *t = substitute_str(t, vars);
                }
            }
            Check::HtmlTag { selector, count, .. } => {
                *selector = substitute_str(selector, vars);
                sub_int_opt(count, int_vars);
            }
            Check::HtmlContains { selector, condition, .. } => {
                *selector = substitute_str(selector, vars);
                condition.substitute(vars, int_vars);
            }
            Check::Identity(i) => i.sha1 = substitute_str(&i.sha1, vars),
            Check::Image(img) => {
                if let Some(f) = &mut img.format {
                    *f = substitute_str(f, vars);
                }
                if let Some(fp) = &mut img.fingerprint {
                    *fp = substitute_str(fp, vars);
                }
            }
            Check::Json(j) => {
                j.element = substitute_str(&j.element, vars);
                j.condition.substitute(vars, int_vars);
                if let Some(embedded) = &mut j.embedded {
                    embedded.substitute(vars, int_vars);
                }
            }
            Check::JSONExpr(e) => e.expression = substitute_str(&e.expression, vars),
            Check::Redirect(r) => {
                if let Some(cond) = &mut r.to_url {
                    cond.substitute(vars, int_vars);
                }
            }
            Check::RedirectChain(r) => {
                for u in r.chain.iter_mut() {
                    *u = substitute_str(u, vars);
                }
            }
            Check::ContentType(c) => c.is = substitute_str(&c.is, vars),
            Check::Cache(_) | Check::ETag {} | Check::UTF8Encoded {} | Check::ResponseTime(_) => {}
            Check::AnyOne { of } | Check::None { of } => {
                for c in of.iter_mut() {
                    c.substitute(vars, int_vars);
                }
            }
            Check::Latency(LatencyCheck { limits, .. }) => {
                *limits = substitute_str(limits, vars);
            }
        }
    }
}

impl Extractor {
    /// Recursively apply substitution to every string field (spec §4.5).
    pub fn substitute(&mut self, vars: &VarMap) {
        match self {
            Extractor::HtmlExtractor { params, .. } => {
                params.selector = substitute_str(&params.selector, vars);
                params.attribute = substitute_str(&params.attribute, vars);
            }
            Extractor::BodyExtractor { params, .. } => {
                params.regexp = substitute_str(&params.regexp, vars);
            }
            Extractor::JsonExtractor(p) => {
                p.element = substitute_str(&p.element, vars);
                if let Some(embedded) = &mut p.embedded {
                    embedded.substitute(vars);
                }
            }
            Extractor::CookieExtractor(p) => p.name = substitute_str(&p.name, vars),
            Extractor::JSExtractor(p) => p.script = substitute_str(&p.script, vars),
            Extractor::SetVariable(p) => {
                sub_opt(&mut p.to, vars);
                sub_opt(&mut p.eval, vars);
            }
            Extractor::SetTimestamp(p) => sub_opt(&mut p.delta_t, vars),
        }
    }
}

/// `lcm(a, b)`; commutative and associative (spec §8 universal invariant).
pub fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// LCM of every list's length in `vars`; 1 if `vars` is empty.
pub fn lcm_of(vars: &HashMap<String, Vec<String>>) -> usize {
    vars.values().map(|v| v.len()).fold(1, lcm)
}

/// Produce `N = lcm_of(vars)` variable bindings, cycling each list
/// (spec §4.5 Repeat / §8 scenario 7).
pub fn repeat_bindings(vars: &HashMap<String, Vec<String>>) -> Vec<VarMap> {
    let n = lcm_of(vars);
    (0..n)
        .map(|r| {
            vars.iter()
                .map(|(k, values)| (k.clone(), values[r % values.len()].clone()))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tokens_are_discovered() {
        assert_eq!(
            find_tokens("hello {{NAME}} you are {{AGE}}"),
            vec!["NAME".to_string(), "AGE".to_string()]
        );
    }

    #[test]
    fn substitution_is_simultaneous_not_recursive() {
        let mut vars = VarMap::new();
        vars.insert("A".to_string(), "{{B}}".to_string());
        vars.insert("B".to_string(), "final".to_string());
        // {{A}} substitutes to the literal string "{{B}}", not "final".
        assert_eq!(substitute_str("{{A}}", &vars), "{{B}}");
    }

    #[test]
    fn substitution_idempotent_with_token_free_values() {
        let mut vars = VarMap::new();
        vars.insert("NAME".to_string(), "alice".to_string());
        let once = substitute_str("hi {{NAME}}", &vars);
        let twice = substitute_str(&once, &vars);
        assert_eq!(once, twice);
    }

    #[test]
    fn unknown_token_is_left_alone() {
        let vars = VarMap::new();
        assert_eq!(substitute_str("{{MISSING}}", &vars), "{{MISSING}}");
    }

    #[test]
    fn now_offset_and_layout() {
        let now: DateTime<Utc> = "2024-01-15T12:00:00Z".parse().unwrap();
        assert_eq!(resolve_now("+ 1d | \"%Y-%m-%d\"", now), "2024-01-16");
        assert_eq!(resolve_now("- 2h | \"%H\"", now), "10");
    }

    #[test]
    fn random_number_respects_range() {
        let v: i64 = resolve_random("NUMBER 5-5").parse().unwrap();
        assert_eq!(v, 5);
    }

    #[test]
    fn int_vars_extracts_sentinel_keys_only() {
        let mut vars = VarMap::new();
        vars.insert("#-7".to_string(), "404".to_string());
        vars.insert("NAME".to_string(), "alice".to_string());
        vars.insert("#3".to_string(), "not-a-number".to_string());
        let int_vars = int_vars_from(&vars);
        assert_eq!(int_vars.len(), 1);
        assert_eq!(int_vars.get(&-7), Some(&404));
    }

    #[test]
    fn lcm_is_commutative_and_associative() {
        assert_eq!(lcm(4, 6), lcm(6, 4));
        assert_eq!(lcm(lcm(2, 3), 4), lcm(2, lcm(3, 4)));
    }

    #[test]
    fn repeat_cycles_values_and_has_lcm_length() {
        let mut vars: HashMap<String, Vec<String>> = HashMap::new();
        vars.insert("query".to_string(), vec!["foo".to_string(), "bar".to_string()]);
        vars.insert(
            "count".to_string(),
            vec!["1".to_string(), "2".to_string(), "3".to_string()],
        );
        let bindings = repeat_bindings(&vars);
        assert_eq!(bindings.len(), 6);
        assert_eq!(bindings[0]["query"], "foo");
        assert_eq!(bindings[0]["count"], "1");
        assert_eq!(bindings[1]["query"], "bar");
        assert_eq!(bindings[1]["count"], "2");
        assert_eq!(bindings[2]["query"], "foo");
        assert_eq!(bindings[2]["count"], "3");
    }

    proptest! {
        /// `lcm` is commutative and associative over arbitrary small
        /// operands (spec §8 universal invariant, generalized from the
        /// fixed example above).
        #[test]
        fn lcm_commutative_prop(a in 1usize..200, b in 1usize..200) {
            prop_assert_eq!(lcm(a, b), lcm(b, a));
        }

        #[test]
        fn lcm_associative_prop(a in 1usize..50, b in 1usize..50, c in 1usize..50) {
            prop_assert_eq!(lcm(lcm(a, b), c), lcm(a, lcm(b, c)));
        }

        /// Substituting a token-free value twice is the same as once
        /// (spec §4.5 "single pass", §8 universal invariant).
        #[test]
        fn substitution_idempotent_on_arbitrary_value(
            template in "[a-zA-Z0-9 {}]{0,40}",
            value in "[a-zA-Z0-9]{0,20}",
        ) {
            let mut vars = VarMap::new();
            vars.insert("V".to_string(), value);
            let once = substitute_str(&template, &vars);
            let twice = substitute_str(&once, &vars);
            prop_assert_eq!(once, twice);
        }

        /// A token with no matching variable is always left verbatim.
        #[test]
        fn unknown_token_always_passes_through(name in "[A-Z]{1,10}") {
            let vars = VarMap::new();
            let token = format!("{{{{{}}}}}", name);
            prop_assert_eq!(substitute_str(&token, &vars), token);
        }
    }
}
