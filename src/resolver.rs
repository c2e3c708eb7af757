//! Product identifier -> display name, degrading through
//! cache -> catalog -> order fallback -> synthetic placeholder.

use crate::models::{ResolutionSource, ResolvedProduct};
use crate::ports::{CatalogError, CatalogLookup, ProductCache};
use crate::retry::{RetryError, RetryPolicy, RetryableCall};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::{
    sync::{Semaphore, SemaphorePermit},
    task::JoinSet,
};
use tracing::{debug, warn};

/// Process-wide limit on concurrent catalog requests, shared by every scope.
#[derive(Clone, Debug)]
pub struct CatalogGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl CatalogGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>, CatalogError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| CatalogError::Transient("catalog gate closed".into()))
    }
}

/// Name and color the order itself carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackHint {
    pub name: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub product: ResolvedProduct,
    /// The catalog lookup failed, as opposed to finding no exact match.
    pub upstream_error: bool,
}

pub fn synthetic_title(product_id: u64) -> String {
    format!("id-{product_id}")
}

#[derive(Clone)]
pub struct ProductResolver {
    scope: String,
    cache: Arc<dyn ProductCache>,
    catalog: Arc<dyn CatalogLookup>,
    gate: CatalogGate,
    call: RetryableCall,
    locale: String,
}

enum RemoteOutcome {
    Found { title: String, color: Option<String> },
    NoExactMatch,
    Failed(RetryError<CatalogError>),
}

impl ProductResolver {
    pub fn new(
        scope: impl Into<String>,
        cache: Arc<dyn ProductCache>,
        catalog: Arc<dyn CatalogLookup>,
        gate: CatalogGate,
        policy: RetryPolicy,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            cache,
            catalog,
            gate,
            call: RetryableCall::new("catalog_lookup", policy),
            locale: locale.into(),
        }
    }

    /// Never fails: every internal error degrades to the next tier.
    pub async fn resolve(&self, product_id: u64, hint: &FallbackHint) -> Resolution {
        if let Some(product) = self.from_cache(product_id).await {
            return self.finish(product, false);
        }

        let upstream_error = match self.lookup_remote(product_id).await {
            RemoteOutcome::Found { title, color } => {
                self.remember(product_id, &title, color.as_deref()).await;
                let product = ResolvedProduct {
                    product_id,
                    title,
                    color: color.unwrap_or_default(),
                    source: ResolutionSource::Remote,
                };
                return self.finish(product, false);
            }
            RemoteOutcome::NoExactMatch => false,
            RemoteOutcome::Failed(err) => {
                warn!(
                    target = "supply.resolver",
                    scope = %self.scope,
                    product_id,
                    attempts = err.attempts(),
                    error = %err,
                    "catalog_lookup_failed"
                );
                true
            }
        };

        let color = hint
            .color
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let (title, source) = match hint.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => (name.to_string(), ResolutionSource::OrderFallback),
            _ => (synthetic_title(product_id), ResolutionSource::Synthetic),
        };
        self.remember(product_id, &title, color).await;
        let product = ResolvedProduct {
            product_id,
            title,
            color: color.unwrap_or_default().to_string(),
            source,
        };
        self.finish(product, upstream_error)
    }

    /// Placeholder used when a resolution task could not complete at all.
    pub fn placeholder(&self, product_id: u64, hint: &FallbackHint) -> Resolution {
        let (title, source) = match hint.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => (name.to_string(), ResolutionSource::OrderFallback),
            _ => (synthetic_title(product_id), ResolutionSource::Synthetic),
        };
        Resolution {
            product: ResolvedProduct {
                product_id,
                title,
                color: hint.color.clone().unwrap_or_default(),
                source,
            },
            upstream_error: true,
        }
    }

    async fn from_cache(&self, product_id: u64) -> Option<ResolvedProduct> {
        match self.cache.get(&self.scope, product_id).await {
            Ok(Some(entry)) if !entry.title.trim().is_empty() => Some(ResolvedProduct {
                product_id,
                title: entry.title,
                color: entry.color.unwrap_or_default(),
                source: ResolutionSource::Cache,
            }),
            Ok(_) => None,
            Err(err) => {
                warn!(target = "supply.resolver", scope = %self.scope, product_id, error = %err, "cache_read_failed");
                None
            }
        }
    }

    async fn lookup_remote(&self, product_id: u64) -> RemoteOutcome {
        let text = product_id.to_string();
        let text = text.as_str();
        let locale = self.locale.as_str();
        let result = self
            .call
            .run_gated(
                || self.gate.acquire(),
                |_attempt| self.catalog.find_by_identifier(text, locale),
            )
            .await;

        match result {
            Ok(cards) => cards
                .into_iter()
                .find(|card| card.id == product_id && !card.title.trim().is_empty())
                .map(|card| RemoteOutcome::Found {
                    color: card.color().map(str::to_string),
                    title: card.title.trim().to_string(),
                })
                .unwrap_or(RemoteOutcome::NoExactMatch),
            Err(err) => RemoteOutcome::Failed(err),
        }
    }

    async fn remember(&self, product_id: u64, title: &str, color: Option<&str>) {
        if let Err(err) = self.cache.set(&self.scope, product_id, title, color).await {
            warn!(target = "supply.resolver", scope = %self.scope, product_id, error = %err, "cache_write_failed");
        }
    }

    fn finish(&self, product: ResolvedProduct, upstream_error: bool) -> Resolution {
        debug!(
            target = "supply.resolver",
            scope = %self.scope,
            product_id = product.product_id,
            source = product.source.as_str(),
            "product_resolved"
        );
        crate::metrics::product_resolved(product.source.as_str());
        Resolution {
            product,
            upstream_error,
        }
    }
}

/// Resolutions made during one run. Owned by a single pipeline invocation and
/// dropped with it.
#[derive(Debug, Default)]
pub struct ResolutionMemo {
    resolved: HashMap<u64, Resolution>,
}

impl ResolutionMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, product_id: u64) -> Option<&Resolution> {
        self.resolved.get(&product_id)
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn values(&self) -> impl Iterator<Item = &Resolution> {
        self.resolved.values()
    }

    pub async fn resolve(
        &mut self,
        resolver: &ProductResolver,
        product_id: u64,
        hint: &FallbackHint,
    ) -> Resolution {
        if let Some(existing) = self.resolved.get(&product_id) {
            return existing.clone();
        }
        let resolution = resolver.resolve(product_id, hint).await;
        self.resolved.insert(product_id, resolution.clone());
        resolution
    }

    /// Resolves every product id not yet in the memo, concurrently. The first
    /// hint seen for an id is the one used.
    pub async fn resolve_all(
        &mut self,
        resolver: &ProductResolver,
        requests: impl IntoIterator<Item = (u64, FallbackHint)>,
    ) {
        let mut pending: HashMap<u64, FallbackHint> = HashMap::new();
        for (product_id, hint) in requests {
            if !self.resolved.contains_key(&product_id) {
                pending.entry(product_id).or_insert(hint);
            }
        }
        if pending.is_empty() {
            return;
        }

        let mut tasks = JoinSet::new();
        for (product_id, hint) in &pending {
            let resolver = resolver.clone();
            let product_id = *product_id;
            let hint = hint.clone();
            tasks.spawn(async move { (product_id, resolver.resolve(product_id, &hint).await) });
        }

        let mut finished = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((product_id, resolution)) => {
                    finished.insert(product_id);
                    self.resolved.insert(product_id, resolution);
                }
                Err(err) => {
                    warn!(target = "supply.resolver", error = %err, "resolution_task_aborted");
                }
            }
        }

        for (product_id, hint) in pending {
            if !finished.contains(&product_id) {
                self.resolved
                    .insert(product_id, resolver.placeholder(product_id, &hint));
            }
        }
    }
}
