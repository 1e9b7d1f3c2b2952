use crate::error::FetchError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

const BODY_SNIPPET_CHARS: usize = 300;

/// Sends one request and decodes a JSON body, mapping every failure onto the fetch taxonomy.
///
/// Network faults, 408, 429 and 5xx are transient; other non-success statuses are permanent.
/// A body that fails to decode is treated as transient (truncated or proxy-mangled responses).
pub async fn send_json<T: DeserializeOwned>(
    source_name: &str,
    req: reqwest::RequestBuilder,
) -> Result<T, FetchError> {
    let res = req.send().await.map_err(|e| request_error(source_name, e))?;

    let status = res.status();
    let retry_after = parse_retry_after(res.headers());
    let text = res
        .text()
        .await
        .map_err(|e| FetchError::transient(source_name, format!("failed to read body: {e}")))?;

    if !status.is_success() {
        return Err(status_error(source_name, status, retry_after, &text));
    }

    decode_json(source_name, &text)
}

pub fn decode_json<T: DeserializeOwned>(source_name: &str, text: &str) -> Result<T, FetchError> {
    serde_json::from_str::<T>(text).map_err(|e| {
        FetchError::transient(
            source_name,
            format!("response is not valid JSON for expected shape: {e}: {}", snippet(text)),
        )
    })
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

pub fn status_error(
    source_name: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> FetchError {
    let detail = format!("HTTP {status}: {}", snippet(body));
    if is_retryable_status(status) {
        FetchError::Transient {
            source_name: source_name.to_string(),
            detail,
            retry_after,
        }
    } else {
        FetchError::permanent(source_name, detail)
    }
}

fn request_error(source_name: &str, err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        return FetchError::permanent(source_name, format!("malformed request: {err}"));
    }
    FetchError::transient(source_name, format!("request failed: {err}"))
}

/// Only the delta-seconds form is honoured; HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn snippet(text: &str) -> String {
    let t = text.trim();
    if t.chars().count() <= BODY_SNIPPET_CHARS {
        return t.to_string();
    }
    let cut: String = t.chars().take(BODY_SNIPPET_CHARS).collect();
    format!("{cut}...")
}
