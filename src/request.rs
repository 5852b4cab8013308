//! Request — the data model for an HTTP request template (spec §3).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How `Params` are encoded onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ParamsAs {
    #[default]
    Query,
    FormUrlEncoded,
    Multipart,
    Body,
}

/// Basic auth credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// A cookie to send with the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// An ordered multi-map, preserving insertion order for both keys and
/// per-key value lists (headers/params both need this for
/// deterministic mixin merges, spec §4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderedMultiMap {
    entries: Vec<(String, Vec<String>)>,
}

impl OrderedMultiMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        if let Some((_, values)) = self.entries.iter_mut().find(|(k, _)| k == key) {
            values.push(value.into());
        } else {
            self.entries.push((key.to_string(), vec![value.into()]));
        }
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn get_first(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.first()).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Union two maps; on key collision, append `other`'s values after `self`'s.
    pub fn union_append(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (k, values) in other.iter() {
            for v in values {
                out.insert(k, v.clone());
            }
        }
        out
    }

    /// Apply `f` to every value, preserving keys and order (used for
    /// variable substitution over header/param values).
    pub fn map_values(&self, mut f: impl FnMut(&str) -> String) -> Self {
        OrderedMultiMap {
            entries: self
                .entries
                .iter()
                .map(|(k, values)| (k.clone(), values.iter().map(|v| f(v)).collect()))
                .collect(),
        }
    }

    /// Union by key; `self` wins on collision (used for Cookies/DataExtraction merges).
    pub fn union_base_wins(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (k, values) in other.iter() {
            if out.get(k).is_none() {
                for v in values {
                    out.insert(k, v.clone());
                }
            }
        }
        out
    }
}

/// A declared request body special form (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodySource {
    Literal(String),
    File(String),
    VarFile(String),
}

impl BodySource {
    pub fn parse(raw: &str) -> Self {
        if let Some(path) = raw.strip_prefix("@vfile:") {
            BodySource::VarFile(path.to_string())
        } else if let Some(path) = raw.strip_prefix("@file:") {
            BodySource::File(path.to_string())
        } else {
            BodySource::Literal(raw.to_string())
        }
    }
}

/// A multipart part's explicit MIME-type override (`@TYPE@PATH`, spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartOverride {
    pub mime_type: String,
    pub path: String,
}

impl MultipartOverride {
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix('@')?;
        let (mime_type, path) = rest.split_once('@')?;
        Some(MultipartOverride {
            mime_type: mime_type.to_string(),
            path: path.to_string(),
        })
    }
}

/// A Request — method, URL, params, headers, cookies, body (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_method")]
    pub method: String,

    pub url: String,

    #[serde(default, rename = "Params")]
    pub params: OrderedMultiMap,

    #[serde(default, rename = "ParamsAs")]
    pub params_as: ParamsAs,

    #[serde(default, rename = "Header")]
    pub header: OrderedMultiMap,

    #[serde(default, rename = "Cookies")]
    pub cookies: Vec<Cookie>,

    #[serde(default, rename = "Body")]
    pub body: String,

    #[serde(default = "default_true", rename = "FollowRedirects")]
    pub follow_redirects: bool,

    #[serde(default, rename = "BasicAuth")]
    pub basic_auth: Option<BasicAuth>,

    #[serde(default, with = "duration_ms_opt", rename = "Timeout")]
    pub timeout: Option<Duration>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: default_method(),
            url: String::new(),
            params: OrderedMultiMap::default(),
            params_as: ParamsAs::default(),
            header: OrderedMultiMap::default(),
            cookies: Vec::new(),
            body: String::new(),
            follow_redirects: true,
            basic_auth: None,
            timeout: None,
        }
    }
}

impl Request {
    pub fn param_values(&self, name: &str) -> Option<&[String]> {
        self.params.get(name)
    }
}

mod duration_ms_opt {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_multimap_union_append() {
        let mut a = OrderedMultiMap::new();
        a.insert("X", "1");
        let mut b = OrderedMultiMap::new();
        b.insert("X", "2");
        b.insert("Y", "3");
        let merged = a.union_append(&b);
        assert_eq!(merged.get("X"), Some(&["1".to_string(), "2".to_string()][..]));
        assert_eq!(merged.get("Y"), Some(&["3".to_string()][..]));
    }

    #[test]
    fn body_source_parses_file_prefixes() {
        assert_eq!(BodySource::parse("@file:a.json"), BodySource::File("a.json".to_string()));
        assert_eq!(BodySource::parse("@vfile:a.json"), BodySource::VarFile("a.json".to_string()));
        assert_eq!(BodySource::parse("plain"), BodySource::Literal("plain".to_string()));
    }

    #[test]
    fn multipart_override_parses_type_and_path() {
        let o = MultipartOverride::parse("@image/png@photo.png").unwrap();
        assert_eq!(o.mime_type, "image/png");
        assert_eq!(o.path, "photo.png");
    }
}
