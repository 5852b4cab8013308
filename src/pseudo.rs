//! `file://` and `bash://` pseudo-request interceptors (spec §4.8).
//!
//! Dispatched before any real HTTP call: a Request whose URL uses one
//! of these schemes never touches the network, but still produces a
//! synthetic `Response` so the rest of the executor pipeline (checks,
//! extractors, status classification) is oblivious to the distinction.

use crate::request::{OrderedMultiMap, Request};
use crate::response::Response;
use std::time::{Duration, Instant};

/// Does this Request target a pseudo-URL rather than a real endpoint?
pub fn is_pseudo_url(url: &str) -> bool {
    url.starts_with("file://") || url.starts_with("bash://")
}

/// Dispatch a pseudo-URL request, producing a synthetic `Response`.
/// Panics (via an internal `unreachable!`) if `request.url` is not a
/// pseudo-URL; callers must check `is_pseudo_url` first.
pub async fn dispatch(request: &Request) -> Response {
    if let Some(path) = request.url.strip_prefix("file://") {
        dispatch_file(path, request).await
    } else if let Some(rest) = request.url.strip_prefix("bash://") {
        dispatch_bash(rest, request).await
    } else {
        unreachable!("dispatch called on a non-pseudo URL: {}", request.url)
    }
}

async fn dispatch_file(path: &str, request: &Request) -> Response {
    let start = Instant::now();
    let method = request.method.to_uppercase();

    let result = match method.as_str() {
        "GET" => tokio::fs::read_to_string(path)
            .await
            .map(|content| (200u16, content)),
        "PUT" => tokio::fs::write(path, &request.body)
            .await
            .map(|_| (200u16, format!("Successfully wrote {}", path))),
        "DELETE" => tokio::fs::remove_file(path)
            .await
            .map(|_| (200u16, format!("Successfully deleted {}", path))),
        other => {
            return synthetic(
                500,
                format!("file:// does not support method {}", other),
                start.elapsed(),
                None,
            )
        }
    };

    match result {
        Ok((status, body)) => synthetic(status, body, start.elapsed(), None),
        Err(e) => synthetic(500, e.to_string(), start.elapsed(), Some(e.to_string())),
    }
}

/// `bash://host/cwd` — `host` is unused (the script always runs
/// locally); `cwd` is the working directory. `Params` are exported as
/// environment variables; the Request `Body` is the script text.
async fn dispatch_bash(rest: &str, request: &Request) -> Response {
    let start = Instant::now();
    let idx = rest.find('/').unwrap_or(rest.len());
    let cwd = &rest[idx..];
    let cwd = if cwd.is_empty() { "." } else { cwd };

    let mut cmd = tokio::process::Command::new("bash");
    cmd.arg("-c")
        .arg(&request.body)
        .current_dir(cwd)
        .envs(flatten_params(&request.params))
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let timeout = request.timeout.unwrap_or(Duration::from_secs(30));

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return synthetic(500, e.to_string(), start.elapsed(), Some(e.to_string())),
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut body = String::from_utf8_lossy(&output.stdout).into_owned();
            body.push_str(&String::from_utf8_lossy(&output.stderr));
            let status = if output.status.success() { 200 } else { 500 };
            synthetic(status, body, start.elapsed(), None)
        }
        Ok(Err(e)) => synthetic(500, e.to_string(), start.elapsed(), Some(e.to_string())),
        Err(_) => synthetic(
            408,
            "bash:// script timed out".to_string(),
            start.elapsed(),
            Some("timeout".to_string()),
        ),
    }
}

fn flatten_params(params: &OrderedMultiMap) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(k, values)| (k.to_string(), values.join(",")))
        .collect()
}

fn synthetic(status: u16, body: String, duration: Duration, transport_error: Option<String>) -> Response {
    Response {
        status,
        headers: Vec::new(),
        body_bytes: body.clone().into_bytes(),
        body_text: Some(body),
        redirects: Vec::new(),
        final_url: String::new(),
        duration,
        protocol: "pseudo".to_string(),
        transport_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(url: &str) -> Request {
        Request {
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn recognizes_pseudo_schemes() {
        assert!(is_pseudo_url("file:///tmp/x"));
        assert!(is_pseudo_url("bash://local/tmp"));
        assert!(!is_pseudo_url("https://example.com"));
    }

    #[tokio::test]
    async fn file_get_reads_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, "hi there").unwrap();

        let mut request = req(&format!("file://{}", path.display()));
        request.method = "GET".to_string();
        let response = dispatch(&request).await;

        assert_eq!(response.status, 200);
        assert_eq!(response.body_text.as_deref(), Some("hi there"));
    }

    #[tokio::test]
    async fn file_get_missing_path_is_500() {
        let mut request = req("file:///no/such/path/at/all");
        request.method = "GET".to_string();
        let response = dispatch(&request).await;
        assert_eq!(response.status, 500);
        assert!(response.transport_error.is_some());
    }

    #[tokio::test]
    async fn file_put_writes_and_reports_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        let mut request = req(&format!("file://{}", path.display()));
        request.method = "PUT".to_string();
        request.body = "payload".to_string();
        let response = dispatch(&request).await;

        assert_eq!(response.status, 200);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "payload");
    }

    #[tokio::test]
    async fn bash_exit_zero_is_200() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = req(&format!("bash://local{}", dir.path().display()));
        request.body = "exit 0".to_string();
        let response = dispatch(&request).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn bash_nonzero_exit_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = req(&format!("bash://local{}", dir.path().display()));
        request.body = "exit 7".to_string();
        let response = dispatch(&request).await;
        assert_eq!(response.status, 500);
    }

    #[tokio::test]
    async fn bash_exports_params_as_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = req(&format!("bash://local{}", dir.path().display()));
        request.params.insert("GREETING", "hello");
        request.body = "test \"$GREETING\" = hello".to_string();
        let response = dispatch(&request).await;
        assert_eq!(response.status, 200);
    }
}
