use crate::config::env_u64;
use crate::ports::UpstreamError;
use reqwest::{Client, Response, header::HeaderMap};
use std::time::Duration;
use tracing::warn;

const ERROR_BODY_LIMIT: usize = 300;

pub fn build_client() -> Client {
    let timeout = env_u64("HTTP_TIMEOUT_SECS").unwrap_or(15);
    let connect = env_u64("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .user_agent(concat!("daily-supply-rs/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|err| {
            warn!(target = "supply.http", error = %err, "client builder failed; using defaults");
            Client::new()
        })
}

/// Passes successful responses through; anything else becomes
/// `UpstreamError::Status` with a truncated body.
pub async fn ensure_success(response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::Status {
        status: status.as_u16(),
        body: body.chars().take(ERROR_BODY_LIMIT).collect(),
    })
}

/// Wait the server asked for, in seconds, from `X-Ratelimit-Retry` or
/// `Retry-After`. Values that do not fit a `Duration` are dropped.
pub fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    ["x-ratelimit-retry", "retry-after"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| value.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}
