use crate::config::env_string;
use crate::http::{build_client, ensure_success};
use crate::ports::{Notifier, NotifyError, UpstreamError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

static TELEGRAM_ROOT: Lazy<String> = Lazy::new(|| {
    env_string("TELEGRAM_API_URL")
        .unwrap_or_else(|| "https://api.telegram.org".to_string())
        .trim_end_matches('/')
        .to_string()
});

/// Sends plain-text messages to every admin of one account's bot.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    base_url: String,
    token: String,
    admin_ids: Vec<i64>,
    http: Client,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, admin_ids: Vec<i64>) -> Self {
        Self::with_base_url(token, admin_ids, TELEGRAM_ROOT.as_str())
    }

    pub fn with_base_url(token: impl Into<String>, admin_ids: Vec<i64>, base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            admin_ids,
            http: build_client(),
        }
    }

    async fn send(&self, chat_id: i64, text: &str) -> Result<(), UpstreamError> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let response = self
            .http
            .post(url)
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .map_err(|err| UpstreamError::Request(err.without_url().to_string()))?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    /// One admin failing does not stop delivery to the rest.
    async fn notify_admins(&self, text: &str) -> Result<(), NotifyError> {
        if self.admin_ids.is_empty() {
            return Err(NotifyError::NoRecipients);
        }
        let mut failed = 0;
        for chat_id in &self.admin_ids {
            match self.send(*chat_id, text).await {
                Ok(()) => debug!(target = "supply.telegram", chat_id, "message delivered"),
                Err(err) => {
                    failed += 1;
                    warn!(target = "supply.telegram", chat_id, error = %err, "message delivery failed");
                }
            }
        }
        if failed > 0 {
            return Err(NotifyError::Delivery {
                failed,
                total: self.admin_ids.len(),
            });
        }
        Ok(())
    }
}
