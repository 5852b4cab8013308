//! `vigil list` / `vigil check <name>` (SPEC_FULL.md §3.4):
//! registry introspection, grounded in the teacher's `cmd_schema`
//! registry-dump pattern (`cli/config.rs`).

use crate::registry::{self, CHECK_NAMES, EXTRACTOR_NAMES};
use std::process::ExitCode;

/// One line of field documentation for `vigil check <name>`. Hand
/// maintained since the Check/Extractor set is a closed, spec-defined
/// enum (spec §4.2-§4.4) rather than something reflected at runtime.
fn fields_for(name: &str) -> Option<&'static [&'static str]> {
    Some(match name {
        "StatusCode" => &["Expect: int (default 200)"],
        "Header" => &["Name: string", "Absent: bool", "Condition: Condition"],
        "Body" => &["Condition fields inline (Equals, Prefix, Suffix, Contains, Count, Regexp, Min, Max, GreaterThan, LessThan, Is, Time)"],
        "Sorted" => &["Text: [string] (>= 2)", "AllowMissing: bool"],
        "HTMLTag" => &["Selector: string (CSS)", "Count: int"],
        "HTMLContains" => &["Selector: string (CSS)", "Text: string"],
        "Identity" => &["SHA1: string (hex)"],
        "Image" => &["Format: string", "Width: int", "Height: int", "Fingerprint: string", "Threshold: int"],
        "JSON" => &["Element: string (path)", "Sep: string (default \".\")", "Condition fields inline", "Embedded: Check"],
        "JSONExpr" => &["Expression: string (CEL-style boolean expression)"],
        "Redirect" => &["To: string"],
        "RedirectChain" => &["Count: int"],
        "FinalURL" => &["Condition fields inline"],
        "ContentType" => &["Is: string (html|json|text|xml|...)"],
        "Cache" => &["NoStore: bool", "NoCache: bool", "Private: bool", "AtLeast: duration", "AtMost: duration"],
        "ETag" => &[],
        "UTF8Encoded" => &[],
        "ResponseTime" => &["Lower: duration", "Higher: duration"],
        "AnyOne" => &["Of: [Check]"],
        "None" => &["Of: [Check]"],
        "Latency" => &[
            "N: int (default 50)",
            "Concurrent: int (default 2, max 64)",
            "Limits: string (\"50% <= 150ms; 95% <= 250ms\")",
            "IndividualSessions: bool",
            "SkipChecks: bool",
            "DumpTo: string (path or stdout/stderr)",
        ],
        "HTMLExtractor" => &["Selector: string", "Attribute: string (~text~ | ~rawtext~ | attr name)"],
        "BodyExtractor" => &["Regexp: string", "Submatch: int"],
        "JSONExtractor" => &["Element: string", "Sep: string (default \".\")", "Embedded: bool"],
        "CookieExtractor" => &["Name: string"],
        "JSExtractor" => &["Script: string"],
        "SetVariable" => &["To: string", "Eval: string"],
        "SetTimestamp" => &["DeltaT/DeltaYear/DeltaMonth/DeltaDay: int", "Format: string (default RFC3339)"],
        _ => return None,
    })
}

pub fn cmd_check(name: &str) -> ExitCode {
    let is_check = CHECK_NAMES.contains(&name);
    let is_extractor = EXTRACTOR_NAMES.contains(&name);
    if !is_check && !is_extractor {
        let suggestions = registry::lookup_or_suggest(name, CHECK_NAMES)
            .err()
            .into_iter()
            .flatten()
            .chain(registry::lookup_or_suggest(name, EXTRACTOR_NAMES).err().into_iter().flatten())
            .take(3)
            .collect::<Vec<_>>();
        eprintln!("{}", registry::suggestion_message("check or extractor", name, &suggestions));
        return ExitCode::from(4);
    }

    println!("{} ({})", name, if is_check { "Check" } else { "Extractor" });
    for field in fields_for(name).unwrap_or(&[]) {
        println!("  {}", field);
    }
    ExitCode::SUCCESS
}

pub fn cmd_list() -> ExitCode {
    println!("Checks:");
    for name in CHECK_NAMES {
        println!("  {}", name);
    }
    println!("Extractors:");
    for name in EXTRACTOR_NAMES {
        println!("  {}", name);
    }
    ExitCode::SUCCESS
}
