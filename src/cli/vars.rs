//! `--var KEY=VALUE` and `VIGIL_VAR_*` environment seeding
//! (SPEC_FULL.md §4 "Environment variable seeding").

use crate::vars::VarMap;

/// Parse repeated `--var KEY=VALUE` CLI flags into a `VarMap`.
pub fn parse_cli_vars(entries: &[String]) -> VarMap {
    entries
        .iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Collect `VIGIL_VAR_<NAME>` environment variables into a `VarMap`,
/// with `<NAME>` becoming the variable's name verbatim (no case
/// folding, since variable names are themselves case-sensitive).
pub fn env_vars() -> VarMap {
    std::env::vars()
        .filter_map(|(k, v)| k.strip_prefix("VIGIL_VAR_").map(|name| (name.to_string(), v)))
        .collect()
}

/// Merge env seeding, then CLI `--var` flags (highest priority), then
/// the loader's own `Variables`/built-ins, which a Test always wins
/// against per the loader's own precedence.
pub fn seed_vars(cli_vars: &[String]) -> VarMap {
    let mut vars = env_vars();
    vars.extend(parse_cli_vars(cli_vars));
    vars
}
