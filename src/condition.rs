//! Condition — the shared string-predicate used by most Checks (spec §4.1).
//!
//! A `Condition` bundles a set of optional predicates, combined
//! conjunctively; `Equals`, when set, short-circuits everything else.
//! `Compile` validates/compiles the regex (if any); `check` evaluates
//! the bundle against a candidate string.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A bundle of optional string predicates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,

    /// Shared by `Contains` and `Regexp`: 0 = any positive count, <0 =
    /// forbidden, >0 = exact count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "GreaterThan")]
    pub greater_than: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "LessThan")]
    pub less_than: Option<f64>,

    /// Space-separated list of type tags; `OR` is a no-op.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "Is")]
    pub is: Option<String>,

    /// A `chrono` strftime-style layout.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "Time")]
    pub time: Option<String>,

    #[serde(skip)]
    compiled_regexp: Option<Regex>,
}

/// A single predicate failure, typed so callers can distinguish Fail
/// subclasses from `MalformedCheck` (spec §7).
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionError {
    Unequal(String),
    BadPrefix(String),
    BadSuffix(String),
    NotFound,
    FoundForbidden,
    WrongCount { got: usize, want: i64 },
    TooShort { len: usize, min: usize },
    TooLong { len: usize, max: usize },
    NotANumber(String),
    TooSmall { got: f64, min: f64 },
    TooLarge { got: f64, max: f64 },
    UnknownTag(String),
    NotOfType(String),
    BadTime { layout: String, value: String },
    MalformedCheck(String),
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionError::Unequal(msg) => write!(f, "Unequal, was {}", msg),
            ConditionError::BadPrefix(ctx) => write!(f, "bad prefix, was {}", ctx),
            ConditionError::BadSuffix(ctx) => write!(f, "bad suffix, was {}", ctx),
            ConditionError::NotFound => write!(f, "not found"),
            ConditionError::FoundForbidden => write!(f, "found forbidden"),
            ConditionError::WrongCount { got, want } => {
                write!(f, "wrong count: got {}, want {}", got, want)
            }
            ConditionError::TooShort { len, min } => {
                write!(f, "too short: {} bytes, want at least {}", len, min)
            }
            ConditionError::TooLong { len, max } => {
                write!(f, "too long: {} bytes, want at most {}", len, max)
            }
            ConditionError::NotANumber(s) => write!(f, "not a number: {:?}", s),
            ConditionError::TooSmall { got, min } => write!(f, "{} <= {} (min)", got, min),
            ConditionError::TooLarge { got, max } => write!(f, "{} >= {} (max)", got, max),
            ConditionError::UnknownTag(tag) => write!(f, "unknown Is tag: {}", tag),
            ConditionError::NotOfType(tag) => write!(f, "value is not {}", tag),
            ConditionError::BadTime { layout, value } => {
                write!(f, "{:?} does not match time layout {:?}", value, layout)
            }
            ConditionError::MalformedCheck(msg) => write!(f, "malformed check: {}", msg),
        }
    }
}

impl std::error::Error for ConditionError {}

impl Condition {
    /// Validate and compile the regex, if any. Must run before `check`.
    pub fn compile(&mut self) -> Result<(), ConditionError> {
        if let Some(pattern) = &self.regexp {
            let re = Regex::new(pattern)
                .map_err(|e| ConditionError::MalformedCheck(format!("bad regexp {:?}: {}", pattern, e)))?;
            self.compiled_regexp = Some(re);
        }
        if self.greater_than.is_some() && self.less_than.is_some() {
            if self.greater_than.unwrap() > self.less_than.unwrap() {
                return Err(ConditionError::MalformedCheck(
                    "GreaterThan must be <= LessThan".to_string(),
                ));
            }
        }
        if let Some(tags) = &self.is {
            for tag in tags.split_whitespace() {
                if tag == "OR" {
                    continue;
                }
                if TypeTag::parse(tag).is_none() {
                    return Err(ConditionError::UnknownTag(tag.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Evaluate the bundle against `s`, in the order documented in spec §4.1.
    pub fn check(&self, s: &str) -> Result<(), ConditionError> {
        if let Some(expect) = &self.equals {
            if s != expect {
                return Err(ConditionError::Unequal(truncate_for_display(s, expect.len())));
            }
            return Ok(());
        }

        if let Some(prefix) = &self.prefix {
            if !s.starts_with(prefix.as_str()) {
                return Err(ConditionError::BadPrefix(truncate_for_display(s, prefix.len() + 10)));
            }
        }

        if let Some(suffix) = &self.suffix {
            if !s.ends_with(suffix.as_str()) {
                return Err(ConditionError::BadSuffix(truncate_for_display(s, suffix.len() + 10)));
            }
        }

        if let Some(needle) = &self.contains {
            check_count(s.matches(needle.as_str()).count(), self.count)?;
        }

        if let Some(re) = &self.compiled_regexp {
            check_count(re.find_iter(s).count(), self.count)?;
        }

        if let Some(min) = self.min {
            if s.len() < min {
                return Err(ConditionError::TooShort { len: s.len(), min });
            }
        }
        if let Some(max) = self.max {
            if s.len() > max {
                return Err(ConditionError::TooLong { len: s.len(), max });
            }
        }

        if self.greater_than.is_some() || self.less_than.is_some() {
            let trimmed = s.trim().trim_matches(|c| c == '\'' || c == '"');
            let value: f64 = trimmed
                .parse()
                .map_err(|_| ConditionError::NotANumber(s.to_string()))?;
            if let Some(min) = self.greater_than {
                if value <= min {
                    return Err(ConditionError::TooSmall { got: value, min });
                }
            }
            if let Some(max) = self.less_than {
                if value >= max {
                    return Err(ConditionError::TooLarge { got: value, max });
                }
            }
        }

        if let Some(tags) = &self.is {
            let mut any_ok = false;
            let mut last_tag = String::new();
            for tag in tags.split_whitespace() {
                if tag == "OR" {
                    continue;
                }
                last_tag = tag.to_string();
                if let Some(t) = TypeTag::parse(tag) {
                    if t.matches(s) {
                        any_ok = true;
                        break;
                    }
                }
            }
            if !any_ok {
                return Err(ConditionError::NotOfType(last_tag));
            }
        }

        if let Some(layout) = &self.time {
            let value = s.trim_matches(|c| c == '\'' || c == '"');
            if chrono::NaiveDateTime::parse_from_str(value, layout).is_err()
                && chrono::DateTime::parse_from_str(value, layout).is_err()
                && chrono::NaiveDate::parse_from_str(value, layout).is_err()
            {
                return Err(ConditionError::BadTime {
                    layout: layout.clone(),
                    value: value.to_string(),
                });
            }
        }

        Ok(())
    }

    /// True if this Condition has no predicate set at all.
    pub fn is_empty(&self) -> bool {
        self.equals.is_none()
            && self.prefix.is_none()
            && self.suffix.is_none()
            && self.contains.is_none()
            && self.regexp.is_none()
            && self.min.is_none()
            && self.max.is_none()
            && self.greater_than.is_none()
            && self.less_than.is_none()
            && self.is.is_none()
            && self.time.is_none()
    }
}

/// `Count` semantics shared by `Contains` and `Regexp` (spec §4.1.3/4).
fn check_count(got: usize, count: Option<i64>) -> Result<(), ConditionError> {
    match count.unwrap_or(1) {
        0 => {
            if got == 0 {
                Err(ConditionError::NotFound)
            } else {
                Ok(())
            }
        }
        n if n < 0 => {
            if got > 0 {
                Err(ConditionError::FoundForbidden)
            } else {
                Ok(())
            }
        }
        n => {
            if got as i64 != n {
                Err(ConditionError::WrongCount { got, want: n })
            } else {
                Ok(())
            }
        }
    }
}

/// Truncation heuristic (spec §4.1.1, §8 scenario 1): show the full
/// actual value when it is at most 1.5x the expected length, else show
/// `expected_len + 10` characters with an ellipsis.
fn truncate_for_display(actual: &str, expected_len: usize) -> String {
    let threshold = (expected_len as f64 * 1.5) as usize;
    if actual.len() <= threshold {
        format!("{:?}", actual)
    } else {
        let cut = expected_len + 10;
        let cut = cut.min(actual.len());
        // Respect char boundaries.
        let mut end = cut;
        while end > 0 && !actual.is_char_boundary(end) {
            end -= 1;
        }
        format!("\"{}\"...", &actual[..end])
    }
}

/// The type tags recognized by `Is` (spec §4.1.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeTag {
    Email,
    Url,
    Ipv4,
    Ipv6,
    Uuid,
    CountryCode,
    HexColor,
    CreditCard,
    Int,
    Float,
    Bool,
    NonEmpty,
}

impl TypeTag {
    fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "Email" => TypeTag::Email,
            "URL" | "Url" => TypeTag::Url,
            "IPv4" => TypeTag::Ipv4,
            "IPv6" => TypeTag::Ipv6,
            "UUID" => TypeTag::Uuid,
            "ISOCountry" => TypeTag::CountryCode,
            "HexColor" => TypeTag::HexColor,
            "CreditCard" => TypeTag::CreditCard,
            "Int" => TypeTag::Int,
            "Float" => TypeTag::Float,
            "Bool" => TypeTag::Bool,
            "NonEmpty" => TypeTag::NonEmpty,
            _ => return None,
        })
    }

    fn matches(self, s: &str) -> bool {
        match self {
            TypeTag::Email => email_address::EmailAddress::is_valid(s),
            TypeTag::Url => url::Url::parse(s).is_ok(),
            TypeTag::Ipv4 => s.parse::<std::net::Ipv4Addr>().is_ok(),
            TypeTag::Ipv6 => s.parse::<std::net::Ipv6Addr>().is_ok(),
            TypeTag::Uuid => uuid::Uuid::parse_str(s).is_ok(),
            TypeTag::CountryCode => s.len() == 2 && s.chars().all(|c| c.is_ascii_uppercase()),
            TypeTag::HexColor => {
                let s = s.strip_prefix('#').unwrap_or(s);
                (s.len() == 3 || s.len() == 6) && s.chars().all(|c| c.is_ascii_hexdigit())
            }
            TypeTag::CreditCard => is_luhn_valid(s),
            TypeTag::Int => s.trim().parse::<i64>().is_ok(),
            TypeTag::Float => s.trim().parse::<f64>().is_ok(),
            TypeTag::Bool => matches!(s.trim(), "true" | "false"),
            TypeTag::NonEmpty => !s.is_empty(),
        }
    }
}

/// Luhn checksum, used by the `CreditCard` type tag.
fn is_luhn_valid(s: &str) -> bool {
    let digits: Vec<u32> = s.chars().filter(|c| c.is_ascii_digit()).filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 12 {
        return false;
    }
    let mut sum = 0u32;
    for (i, d) in digits.iter().rev().enumerate() {
        let mut d = *d;
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn equals_truncation_scenario() {
        let c = Condition {
            equals: Some("foobar".to_string()),
            ..Default::default()
        };
        let err = c.check("foobarbazwazturpot").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unequal, was \"foobarbazwazturp\"..."
        );
    }

    #[test]
    fn contains_count_scenarios() {
        let mut c = Condition {
            contains: Some("foo".to_string()),
            count: Some(1),
            ..Default::default()
        };
        c.compile().unwrap();
        assert_eq!(
            c.check("foobarfoobar").unwrap_err(),
            ConditionError::WrongCount { got: 2, want: 1 }
        );

        c.count = Some(2);
        assert!(c.check("foobarfoobar").is_ok());
    }

    #[test]
    fn contains_count_zero_means_any_positive() {
        let c = Condition {
            contains: Some("x".to_string()),
            count: Some(0),
            ..Default::default()
        };
        assert!(c.check("xyz").is_ok());
        assert_eq!(c.check("abc").unwrap_err(), ConditionError::NotFound);
    }

    #[test]
    fn contains_count_negative_is_forbidden() {
        let c = Condition {
            contains: Some("x".to_string()),
            count: Some(-1),
            ..Default::default()
        };
        assert!(c.check("abc").is_ok());
        assert_eq!(c.check("xyz").unwrap_err(), ConditionError::FoundForbidden);
    }

    #[test]
    fn min_max_length() {
        let c = Condition {
            min: Some(3),
            max: Some(5),
            ..Default::default()
        };
        assert!(c.check("abcd").is_ok());
        assert!(c.check("ab").is_err());
        assert!(c.check("abcdef").is_err());
    }

    #[test]
    fn greater_than_less_than_bounds() {
        let c = Condition {
            greater_than: Some(10.0),
            less_than: Some(20.0),
            ..Default::default()
        };
        assert!(c.check(" 15 ").is_ok());
        assert!(c.check("5").is_err());
        assert!(c.check("25").is_err());
        assert!(c.check("not-a-number").is_err());
    }

    #[test]
    fn is_email_or_url() {
        let mut c = Condition {
            is: Some("Email OR URL".to_string()),
            ..Default::default()
        };
        c.compile().unwrap();
        assert!(c.check("user@example.com").is_ok());
        assert!(c.check("https://example.com").is_ok());
        assert!(c.check("not an email or url").is_err());
    }

    #[test]
    fn is_unknown_tag_is_malformed() {
        let mut c = Condition {
            is: Some("Bogus".to_string()),
            ..Default::default()
        };
        assert!(matches!(c.compile(), Err(ConditionError::UnknownTag(_))));
    }

    #[test]
    fn regexp_must_compile_cleanly() {
        let mut c = Condition {
            regexp: Some("(unclosed".to_string()),
            ..Default::default()
        };
        assert!(matches!(c.compile(), Err(ConditionError::MalformedCheck(_))));
    }

    #[test]
    fn time_layout() {
        let c = Condition {
            time: Some("%Y-%m-%d".to_string()),
            ..Default::default()
        };
        assert!(c.check("2024-01-15").is_ok());
        assert!(c.check("not-a-date").is_err());
    }
}
