//! Narrow interfaces for everything the supply pipeline talks to.
//!
//! Production adapters live in `wb`, `telegram` and `store`; the test fakes in
//! `testing` implement the same traits.

use crate::models::{CacheEntry, CatalogCard, Order, RunRecord};
use crate::retry::{RetryClass, Retryable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("request rejected with HTTP {status}")]
    Rejected { status: u16 },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl Retryable for CatalogError {
    fn classify(&self) -> RetryClass {
        match self {
            CatalogError::RateLimited { retry_after } => RetryClass::RateLimited(*retry_after),
            CatalogError::Transient(_) => RetryClass::Transient,
            CatalogError::Rejected { .. } | CatalogError::Malformed(_) => RetryClass::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Backend(String),
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no admins configured")]
    NoRecipients,
    #[error("delivery failed for {failed} of {total} admins")]
    Delivery { failed: usize, total: usize },
}

#[async_trait]
pub trait OrderSource: Send + Sync {
    async fn fetch_new_orders(&self) -> Result<Vec<Order>, UpstreamError>;
}

#[async_trait]
pub trait SupplyRegistrar: Send + Sync {
    /// Returns the supply identifier exactly as the service reported it; the
    /// caller decides what an empty identifier means.
    async fn create_supply(&self, name: &str) -> Result<String, UpstreamError>;

    /// `order_ids` must already respect [`ATTACH_CHUNK_LIMIT`].
    async fn attach_orders(&self, supply_id: &str, order_ids: &[u64]) -> Result<(), UpstreamError>;
}

/// Per-call item limit of the supply attach endpoint.
pub const ATTACH_CHUNK_LIMIT: usize = 100;

#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn find_by_identifier(
        &self,
        text: &str,
        locale: &str,
    ) -> Result<Vec<CatalogCard>, CatalogError>;
}

#[async_trait]
pub trait ProductCache: Send + Sync {
    async fn get(&self, scope: &str, product_id: u64) -> Result<Option<CacheEntry>, StoreError>;

    async fn set(
        &self,
        scope: &str,
        product_id: u64,
        title: &str,
        color: Option<&str>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn already_ran(&self, scope: &str, day_key: &str) -> Result<bool, StoreError>;

    async fn mark_ok(
        &self,
        scope: &str,
        day_key: &str,
        supply_id: Option<&str>,
        at: DateTime<Utc>,
        order_count: usize,
        report_text: &str,
    ) -> Result<(), StoreError>;

    async fn mark_failed(
        &self,
        scope: &str,
        day_key: &str,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError>;

    async fn last_report(&self, scope: &str) -> Result<Option<RunRecord>, StoreError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_admins(&self, text: &str) -> Result<(), NotifyError>;
}
