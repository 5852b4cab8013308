//! Error types for vigil
//!
//! This is for failures in *loading and operating* the engine itself
//! (bad test files, unreadable paths, a malformed CLI invocation). A
//! failing `Check` is a modeled outcome (`Status::Fail`/`Status::Bogus`
//! on a `TestResult`), not a `vigil::Error`.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// vigil errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("load error: {0}")]
    Load(String),

    #[error("malformed check: {0}")]
    MalformedCheck(String),

    #[error("{0}")]
    UnknownName(String),

    #[error("CEL error: {0}")]
    Cel(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JSON5 error: {0}")]
    Json5(#[from] json5::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("URL error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("{0}")]
    Other(String),
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
