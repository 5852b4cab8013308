//! Textual Test/Suite loading, `BasedOn` mixin resolution, and Unroll
//! (spec §4.6).
//!
//! Tests and Suites are written as liberal JSON (unquoted keys, trailing
//! commas, comments, hex numbers — `json5`) and loaded through a staged
//! pipeline: disk -> raw text -> mixin-merge -> variable-substitute ->
//! executable Test (spec §9 "staged pipeline").

use crate::checks::Check;
use crate::error::{Error, Result};
use crate::extract::Extractor;
use crate::registry::{self, CHECK_NAMES, EXTRACTOR_NAMES};
use crate::request::Request;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// `{max attempts, sleep between attempts}` (spec §3). `max < 0` means
/// the Test is skipped outright; `max == 0` is treated as `1`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Poll {
    #[serde(default, rename = "Max")]
    pub max: i32,

    #[serde(default, rename = "Sleep", with = "millis_opt")]
    pub sleep: Option<std::time::Duration>,
}

impl Poll {
    /// Number of attempts to make, or `None` if the Test should be
    /// skipped (`Max < 0`).
    pub fn attempts(&self) -> Option<u32> {
        if self.max < 0 {
            None
        } else if self.max == 0 {
            Some(1)
        } else {
            Some(self.max as u32)
        }
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&d.as_millis()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms: Option<u64> = Option::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}

/// A Test — request template + assertions (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Test {
    #[serde(default, rename = "Name")]
    pub name: String,

    #[serde(default, rename = "Description")]
    pub description: String,

    #[serde(default, rename = "BasedOn")]
    pub based_on: Vec<String>,

    #[serde(default, rename = "Request")]
    pub request: Request,

    #[serde(default, rename = "Checks")]
    pub checks: Vec<Check>,

    #[serde(default, rename = "VarEx")]
    pub data_extraction: HashMap<String, Extractor>,

    #[serde(default, rename = "Variables")]
    pub variables: HashMap<String, String>,

    #[serde(default, rename = "Poll")]
    pub poll: Poll,

    #[serde(default, rename = "Verbosity")]
    pub verbosity: i32,

    #[serde(default, rename = "PreSleep", with = "millis_opt")]
    pub pre_sleep: Option<std::time::Duration>,

    #[serde(default, rename = "InterSleep", with = "millis_opt")]
    pub inter_sleep: Option<std::time::Duration>,

    #[serde(default, rename = "PostSleep", with = "millis_opt")]
    pub post_sleep: Option<std::time::Duration>,

    #[serde(default, rename = "Unroll")]
    pub unroll: HashMap<String, Vec<String>>,

    /// Populated by the loader, never present in the textual form.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// A Suite entry: a filename, a `{File, Variables}` pair, or an inline Test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SuiteEntry {
    File(String),
    FileWithVariables {
        #[serde(rename = "File")]
        file: String,
        #[serde(default, rename = "Variables")]
        variables: HashMap<String, String>,
    },
    Inline(Box<Test>),
}

/// A Suite — setup/tests/teardown sharing a cookie jar (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Suite {
    #[serde(default, rename = "Name")]
    pub name: String,

    #[serde(default, rename = "Description")]
    pub description: String,

    #[serde(default, rename = "KeepCookies")]
    pub keep_cookies: bool,

    #[serde(default, rename = "OmitChecks")]
    pub omit_checks: bool,

    #[serde(default, rename = "Setup")]
    pub setup: Vec<SuiteEntry>,

    #[serde(default, rename = "Tests")]
    pub tests: Vec<SuiteEntry>,

    #[serde(default, rename = "Teardown")]
    pub teardown: Vec<SuiteEntry>,

    #[serde(default, rename = "Variables")]
    pub variables: HashMap<String, String>,

    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// Load a Test from disk, resolving its `BasedOn` chain and unrolling it.
///
/// This is the entry point a caller (executor/suite/CLI) should use;
/// `load_test_file` alone performs no merge or unroll.
pub fn load_and_prepare_test(path: &Path) -> Result<Vec<Test>> {
    let mut test = load_test_file(path)?;
    resolve_based_on(&mut test, path)?;
    set_builtin_vars(&mut test, path);
    Ok(unroll(test))
}

/// Parse one Test file without resolving `BasedOn` or unrolling.
pub fn load_test_file(path: &Path) -> Result<Test> {
    let text = std::fs::read_to_string(path)?;
    let value: serde_json::Value =
        json5::from_str(&text).map_err(|e| Error::Load(format!("{}: {}", path.display(), e)))?;
    validate_tags(&value)?;
    let mut test: Test = serde_json::from_value(value)
        .map_err(|e| Error::Load(format!("{}: {}", path.display(), e)))?;
    test.source_path = Some(path.to_path_buf());
    Ok(test)
}

/// Parse one Suite file.
pub fn load_suite_file(path: &Path) -> Result<Suite> {
    let text = std::fs::read_to_string(path)?;
    let value: serde_json::Value =
        json5::from_str(&text).map_err(|e| Error::Load(format!("{}: {}", path.display(), e)))?;
    validate_tags(&value)?;
    let mut suite: Suite = serde_json::from_value(value)
        .map_err(|e| Error::Load(format!("{}: {}", path.display(), e)))?;
    suite.source_path = Some(path.to_path_buf());
    Ok(suite)
}

/// Walk a parsed Test/Suite document and check every `Check`/
/// `Extractor` discriminator against the registry before the strict
/// `serde` decode runs, so an unknown tag reports a Damerau–Levenshtein
/// suggestion (spec §4.2, §8.8) rather than a generic "unknown
/// variant" decode error.
fn validate_tags(value: &serde_json::Value) -> Result<()> {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(tag)) = map.get("Check") {
                check_tag("Check", tag, CHECK_NAMES)?;
            }
            if let Some(serde_json::Value::String(tag)) = map.get("Extractor") {
                check_tag("Extractor", tag, EXTRACTOR_NAMES)?;
            }
            for v in map.values() {
                validate_tags(v)?;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                validate_tags(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn check_tag(kind: &str, tag: &str, names: &[&str]) -> Result<()> {
    match registry::lookup_or_suggest(tag, names) {
        Ok(_) => Ok(()),
        Err(suggestions) => Err(Error::UnknownName(registry::suggestion_message(
            kind,
            tag,
            &suggestions,
        ))),
    }
}

/// Resolve a Suite entry into a concrete, `BasedOn`-resolved, unrolled
/// list of Tests, relative to `referencing_dir` (the directory of the
/// Suite file that owns this entry).
pub fn resolve_suite_entry(entry: &SuiteEntry, referencing_dir: &Path) -> Result<Vec<Test>> {
    match entry {
        SuiteEntry::File(name) => load_and_prepare_test(&referencing_dir.join(name)),
        SuiteEntry::FileWithVariables { file, variables } => {
            let mut tests = load_and_prepare_test(&referencing_dir.join(file))?;
            for t in &mut tests {
                for (k, v) in variables {
                    t.variables.insert(k.clone(), v.clone());
                }
            }
            Ok(tests)
        }
        SuiteEntry::Inline(test) => {
            let mut test = (**test).clone();
            resolve_based_on(&mut test, &referencing_dir.join("<inline>"))?;
            Ok(unroll(test))
        }
    }
}

/// Resolve `BasedOn` transitively. Every reference is relative to the
/// directory of the file that names it (spec §4.6 "Path resolution"):
/// if A loads B which loads C, C resolves relative to B's directory,
/// not A's.
fn resolve_based_on(test: &mut Test, referenced_from: &Path) -> Result<()> {
    if test.based_on.is_empty() {
        return Ok(());
    }

    let dir = referenced_from.parent().unwrap_or_else(|| Path::new("."));
    let mut names = Vec::new();
    let based_on = std::mem::take(&mut test.based_on);

    for rel in &based_on {
        let mixin_path = dir.join(rel);
        let mut mixin = load_test_file(&mixin_path)?;
        resolve_based_on(&mut mixin, &mixin_path)?;
        names.push(mixin.name.clone());
        merge_mixin(test, &mixin);
    }

    if !names.is_empty() {
        test.description = format!("Merge of {}: {}", names.join(", "), test.description);
    }

    Ok(())
}

/// Merge `mixin` into `base` in place, per the field rules of spec §4.6.
/// `base` is the Test being loaded (the left side, the child); `mixin`
/// is the `BasedOn`-referenced template (the right side). The base's
/// own explicit values always take priority; the mixin only fills gaps
/// the base left empty, matching the spec's "right wins only if base
/// is empty" wording (read "right" = mixin here, "base" = the test that
/// named it via `BasedOn`).
fn merge_mixin(base: &mut Test, mixin: &Test) {
    // Scalar strings: mixin wins only if base's own value is empty.
    if base.request.url.is_empty() {
        base.request.url = mixin.request.url.clone();
    }
    if base.request.method.is_empty() || base.request.method == "GET" {
        if !mixin.request.method.is_empty() {
            base.request.method = mixin.request.method.clone();
        }
    }
    if base.request.body.is_empty() {
        base.request.body = mixin.request.body.clone();
    }

    // Headers and Params: union; on key collision, append mixin's
    // values after base's.
    base.request.header = base.request.header.union_append(&mixin.request.header);
    base.request.params = base.request.params.union_append(&mixin.request.params);

    // Cookies: union by name, base wins on collision.
    for cookie in &mixin.request.cookies {
        if !base
            .request
            .cookies
            .iter()
            .any(|c| c.name == cookie.name)
        {
            base.request.cookies.push(cookie.clone());
        }
    }

    // Checks: concatenation, base first.
    base.checks.extend(mixin.checks.iter().cloned());

    // DataExtraction: union by key, base wins.
    for (k, v) in &mixin.data_extraction {
        base.data_extraction.entry(k.clone()).or_insert_with(|| v.clone());
    }

    // Variables: same shape as DataExtraction (not named separately in
    // the merge table, but must follow the same "no field left behind"
    // rule or BasedOn templates couldn't carry default variables).
    for (k, v) in &mixin.variables {
        base.variables.entry(k.clone()).or_insert_with(|| v.clone());
    }

    // Durations/numerics: base wins if nonzero, else mixin.
    if base.poll.max == 0 {
        base.poll.max = mixin.poll.max;
    }
    if base.poll.sleep.is_none() {
        base.poll.sleep = mixin.poll.sleep;
    }
    if base.pre_sleep.is_none() {
        base.pre_sleep = mixin.pre_sleep;
    }
    if base.inter_sleep.is_none() {
        base.inter_sleep = mixin.inter_sleep;
    }
    if base.post_sleep.is_none() {
        base.post_sleep = mixin.post_sleep;
    }
    if base.verbosity == 0 {
        base.verbosity = mixin.verbosity;
    }
    if base.request.basic_auth.is_none() {
        base.request.basic_auth = mixin.request.basic_auth.clone();
    }
    if base.request.timeout.is_none() {
        base.request.timeout = mixin.request.timeout;
    }
}

fn set_builtin_vars(test: &mut Test, path: &Path) {
    let abs = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let name = abs
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let dir = abs
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    test.variables
        .entry("TEST_NAME".to_string())
        .or_insert(name);
    test.variables.entry("TEST_DIR".to_string()).or_insert(dir);
    test.variables
        .entry("TEST_PATH".to_string())
        .or_insert_with(|| abs.display().to_string());
}

/// Apply the Repeat procedure (spec §4.5/§4.6): if `Unroll` is
/// non-empty, produce N copies (N = lcm of the bound lists' lengths),
/// each inheriting a distinct variable binding and a Description
/// prefixed with its binding so results are distinguishable (spec §8
/// scenario 7, e.g. `"q=foo c=1 f=fix"`).
fn unroll(test: Test) -> Vec<Test> {
    if test.unroll.is_empty() {
        return vec![test];
    }

    crate::vars::repeat_bindings(&test.unroll)
        .into_iter()
        .map(|binding| {
            let mut copy = test.clone();
            let mut pairs: Vec<_> = binding.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let suffix = pairs
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" ");
            if !suffix.is_empty() {
                copy.description = format!("{} {}", copy.description, suffix).trim().to_string();
            }
            copy.variables.extend(binding);
            copy
        })
        .collect()
}
