use crate::http::{build_client, retry_after_hint};
use crate::models::{CardAttribute, CatalogCard};
use crate::ports::{CatalogError, CatalogLookup};
use crate::wb::config::CONTENT_ROOT;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::AUTHORIZATION, header::HeaderMap};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

const SEARCH_LIMIT: u32 = 10;

/// Content API card search. One attempt per call; retries belong to the caller.
#[derive(Debug, Clone)]
pub struct WbContentClient {
    base_url: String,
    token: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct CardsEnvelope {
    #[serde(default)]
    cards: Vec<WbCard>,
}

#[derive(Debug, Deserialize)]
struct WbCard {
    #[serde(rename = "nmID")]
    nm_id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    characteristics: Vec<WbCharacteristic>,
}

#[derive(Debug, Deserialize)]
struct WbCharacteristic {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: Value,
}

impl From<WbCard> for CatalogCard {
    fn from(card: WbCard) -> Self {
        CatalogCard {
            id: card.nm_id,
            title: card.title,
            attributes: card
                .characteristics
                .into_iter()
                .map(|c| CardAttribute {
                    name: c.name,
                    values: characteristic_values(c.value),
                })
                .collect(),
        }
    }
}

/// Characteristic values arrive either as a list or as a single scalar.
fn characteristic_values(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.into_iter().filter_map(scalar_text).collect(),
        other => scalar_text(other).into_iter().collect(),
    }
}

fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

impl WbContentClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, CONTENT_ROOT.as_str())
    }

    pub fn with_base_url(token: impl Into<String>, base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            http: build_client(),
        }
    }
}

#[async_trait]
impl CatalogLookup for WbContentClient {
    async fn find_by_identifier(
        &self,
        text: &str,
        locale: &str,
    ) -> Result<Vec<CatalogCard>, CatalogError> {
        let url = format!(
            "{}/content/v2/get/cards/list?locale={}",
            self.base_url,
            urlencoding::encode(locale)
        );
        let body = json!({
            "settings": {
                "cursor": { "limit": SEARCH_LIMIT },
                "filter": { "textSearch": text, "withPhoto": -1 },
            }
        });
        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;

        if let Some(err) = classify_status(response.status(), response.headers()) {
            debug!(target = "supply.wb", %text, error = %err, "card search rejected");
            return Err(err);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;
        parse_cards(&bytes)
    }
}

fn classify_status(status: StatusCode, headers: &HeaderMap) -> Option<CatalogError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS => CatalogError::RateLimited {
            retry_after: retry_after_hint(headers),
        },
        StatusCode::REQUEST_TIMEOUT => CatalogError::Transient(format!("HTTP {status}")),
        s if s.is_server_error() => CatalogError::Transient(format!("HTTP {status}")),
        s => CatalogError::Rejected { status: s.as_u16() },
    })
}

fn parse_cards(body: &[u8]) -> Result<Vec<CatalogCard>, CatalogError> {
    let envelope: CardsEnvelope =
        serde_json::from_slice(body).map_err(|err| CatalogError::Malformed(err.to_string()))?;
    Ok(envelope.cards.into_iter().map(CatalogCard::from).collect())
}
