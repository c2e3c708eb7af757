use crate::config::env_string;
use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, sync::Arc};
use tracing::{info, warn};

pub const KEY_HEADER: &str = "x-supply-key";

/// Admin API keys, looked up by the presented secret.
#[derive(Clone, Default)]
pub struct AuthState {
    keys: Arc<HashMap<String, String>>,
}

/// Which configured key authorised the request.
#[derive(Clone, Debug)]
pub struct AdminContext {
    pub key_name: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env_string("ADMIN_API_KEYS").unwrap_or_default();
        let state = Self::parse(&raw);
        if state.keys.is_empty() {
            warn!(
                target = "supply.api",
                "ADMIN_API_KEYS is empty; protected routes will reject every request"
            );
        } else {
            info!(
                target = "supply.api",
                key_count = state.keys.len(),
                "loaded admin keys"
            );
        }
        state
    }

    /// `name:secret,name:secret`; malformed entries are skipped.
    pub fn parse(raw: &str) -> Self {
        let mut keys = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.splitn(2, ':');
            let name = parts.next().map(str::trim).filter(|s| !s.is_empty());
            let secret = parts.next().map(str::trim).filter(|s| !s.is_empty());
            match (name, secret) {
                (Some(name), Some(secret)) => {
                    keys.insert(secret.to_string(), name.to_string());
                }
                _ => warn!(target = "supply.api", "ignored malformed ADMIN_API_KEYS entry"),
            }
        }
        Self {
            keys: Arc::new(keys),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AdminContext> {
        self.keys.get(presented).map(|name| AdminContext {
            key_name: name.clone(),
        })
    }
}

pub async fn require_admin_key(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized(
            "missing_api_key",
            "Provide X-Supply-Key or Bearer token",
        ));
    };
    let Some(context) = state.authenticate(&presented) else {
        warn!(target = "supply.api", path = %request.uri().path(), "rejected unknown admin key");
        return Ok(unauthorized("invalid_api_key", "Key not recognized"));
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string()).filter(|key| !key.is_empty());
    }
    headers
        .get(KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}
