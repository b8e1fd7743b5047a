//! Shared HTTP client construction and response classification.

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::{PipelineError, Result, ServiceErrorKind};

/// Builds a rustls-backed client with a per-request timeout.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("kotoba/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| {
            PipelineError::config_validation(
                format!("failed to build HTTP client: {e}"),
                "Check the TLS setup of this machine",
            )
        })
}

/// Reads a successful response body as JSON.
///
/// Non-2xx statuses are classified with [`ServiceErrorKind::from_status`]
/// and unparsable bodies become [`ServiceErrorKind::Malformed`]. The
/// returned pair is `(kind, message)` for the caller to wrap in its own
/// stage error.
pub async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    service: &str,
) -> std::result::Result<T, (ServiceErrorKind, String)> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err((
            ServiceErrorKind::from_status(status.as_u16()),
            format!("{service} returned {status}: {}", truncate(&body, 300)),
        ));
    }

    let body = response
        .text()
        .await
        .map_err(|e| (ServiceErrorKind::from_reqwest(&e), e.to_string()))?;
    serde_json::from_str(&body).map_err(|e| {
        (
            ServiceErrorKind::Malformed,
            format!("{service} returned unparsable JSON: {e}"),
        )
    })
}

/// Classifies a failure to send a request.
pub fn send_error(err: &reqwest::Error, service: &str) -> (ServiceErrorKind, String) {
    (
        ServiceErrorKind::from_reqwest(err),
        format!("request to {service} failed: {err}"),
    )
}

/// Shortens `text` to at most `max` characters for log and error output.
pub fn truncate(text: &str, max: usize) -> &str {
    text.char_indices()
        .nth(max)
        .map_or(text, |(idx, _)| &text[..idx])
}
