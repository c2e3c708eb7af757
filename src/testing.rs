//! Deterministic fakes for every collaborator trait, shared by the unit tests.

use crate::models::{CacheEntry, CardAttribute, CatalogCard, Order, RunRecord};
use crate::ports::{
    CatalogError, CatalogLookup, Notifier, NotifyError, OrderSource, ProductCache, RunLedger,
    StoreError, SupplyRegistrar, UpstreamError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

pub fn card(id: u64, title: &str, color: Option<&str>) -> CatalogCard {
    CatalogCard {
        id,
        title: title.to_string(),
        attributes: color
            .map(|c| {
                vec![CardAttribute {
                    name: "Цвет".into(),
                    values: vec![c.to_string()],
                }]
            })
            .unwrap_or_default(),
    }
}

pub fn order(order_id: u64, product_id: u64, quantity: u32, offer_name: Option<&str>) -> Order {
    Order {
        order_id,
        product_id,
        quantity,
        raw_offer_name: offer_name.map(str::to_string),
        raw_vendor_code: None,
        raw_color_code: None,
    }
}

type CatalogReply = Result<Vec<CatalogCard>, CatalogError>;

#[derive(Default)]
struct CatalogState {
    scripts: HashMap<u64, VecDeque<CatalogReply>>,
    calls: HashMap<u64, u32>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Catalog answering from per-product scripts; once a script runs dry it
/// answers with `exhausted` (no cards by default).
#[derive(Default)]
pub struct ScriptedCatalog {
    state: Mutex<CatalogState>,
    exhausted: Option<CatalogError>,
    latency: Option<Duration>,
}

impl ScriptedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: CatalogError) -> Self {
        Self {
            exhausted: Some(error),
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn push_cards(&self, product_id: u64, cards: Vec<CatalogCard>) {
        self.push(product_id, Ok(cards));
    }

    pub fn push_error(&self, product_id: u64, error: CatalogError) {
        self.push(product_id, Err(error));
    }

    fn push(&self, product_id: u64, reply: CatalogReply) {
        let mut state = self.state.lock().unwrap();
        state.scripts.entry(product_id).or_default().push_back(reply);
    }

    pub fn calls_for(&self, product_id: u64) -> u32 {
        let state = self.state.lock().unwrap();
        state.calls.get(&product_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.state.lock().unwrap().calls.values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }
}

#[async_trait]
impl CatalogLookup for ScriptedCatalog {
    async fn find_by_identifier(&self, text: &str, _locale: &str) -> CatalogReply {
        let product_id: u64 = text.parse().unwrap();
        let reply = {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(product_id).or_default() += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state
                .scripts
                .get_mut(&product_id)
                .and_then(VecDeque::pop_front)
        };
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.state.lock().unwrap().in_flight -= 1;
        reply.unwrap_or_else(|| match &self.exhausted {
            Some(error) => Err(error.clone()),
            None => Ok(Vec::new()),
        })
    }
}

#[derive(Default)]
struct MarketplaceState {
    panics_left: u32,
    created: Vec<String>,
    attached: Vec<(String, Vec<u64>)>,
}

/// Marketplace fake: serves fixed orders and records supply calls.
pub struct FakeMarketplace {
    orders: Vec<Order>,
    supply_id: String,
    fail_fetch: bool,
    state: Mutex<MarketplaceState>,
}

impl FakeMarketplace {
    pub fn new(orders: Vec<Order>) -> Self {
        Self {
            orders,
            supply_id: "WB-GI-1".into(),
            fail_fetch: false,
            state: Mutex::new(MarketplaceState::default()),
        }
    }

    pub fn with_supply_id(mut self, supply_id: &str) -> Self {
        self.supply_id = supply_id.to_string();
        self
    }

    pub fn failing_fetch(mut self) -> Self {
        self.fail_fetch = true;
        self
    }

    /// The next `count` order fetches panic instead of returning.
    pub fn panicking_fetches(self, count: u32) -> Self {
        self.state.lock().unwrap().panics_left = count;
        self
    }

    pub fn supply_names(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn attached(&self) -> Vec<(String, Vec<u64>)> {
        self.state.lock().unwrap().attached.clone()
    }
}

#[async_trait]
impl OrderSource for FakeMarketplace {
    async fn fetch_new_orders(&self) -> Result<Vec<Order>, UpstreamError> {
        if self.fail_fetch {
            return Err(UpstreamError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        let panic_now = {
            let mut state = self.state.lock().unwrap();
            let panic_now = state.panics_left > 0;
            state.panics_left = state.panics_left.saturating_sub(1);
            panic_now
        };
        if panic_now {
            panic!("order feed exploded");
        }
        Ok(self.orders.clone())
    }
}

#[async_trait]
impl SupplyRegistrar for FakeMarketplace {
    async fn create_supply(&self, name: &str) -> Result<String, UpstreamError> {
        self.state.lock().unwrap().created.push(name.to_string());
        Ok(self.supply_id.clone())
    }

    async fn attach_orders(&self, supply_id: &str, order_ids: &[u64]) -> Result<(), UpstreamError> {
        self.state
            .lock()
            .unwrap()
            .attached
            .push((supply_id.to_string(), order_ids.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_admins(&self, text: &str) -> Result<(), NotifyError> {
        self.messages.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(NotifyError::Delivery {
                failed: 1,
                total: 1,
            });
        }
        Ok(())
    }
}

/// Store whose every operation fails, for best-effort paths.
pub struct BrokenStore;

fn broken() -> StoreError {
    StoreError::Backend("connection refused".into())
}

#[async_trait]
impl ProductCache for BrokenStore {
    async fn get(&self, _scope: &str, _product_id: u64) -> Result<Option<CacheEntry>, StoreError> {
        Err(broken())
    }

    async fn set(
        &self,
        _scope: &str,
        _product_id: u64,
        _title: &str,
        _color: Option<&str>,
    ) -> Result<(), StoreError> {
        Err(broken())
    }
}

#[async_trait]
impl RunLedger for BrokenStore {
    async fn already_ran(&self, _scope: &str, _day_key: &str) -> Result<bool, StoreError> {
        Err(broken())
    }

    async fn mark_ok(
        &self,
        _scope: &str,
        _day_key: &str,
        _supply_id: Option<&str>,
        _at: DateTime<Utc>,
        _order_count: usize,
        _report_text: &str,
    ) -> Result<(), StoreError> {
        Err(broken())
    }

    async fn mark_failed(
        &self,
        _scope: &str,
        _day_key: &str,
        _at: DateTime<Utc>,
        _error: &str,
    ) -> Result<(), StoreError> {
        Err(broken())
    }

    async fn last_report(&self, _scope: &str) -> Result<Option<RunRecord>, StoreError> {
        Err(broken())
    }
}

/// A ready-to-run pipeline for `scope` over in-memory collaborators.
pub struct PipelineFixture {
    pub pipeline: crate::pipeline::DailySupplyPipeline,
    pub store: std::sync::Arc<crate::store::MemoryStore>,
    pub market: std::sync::Arc<FakeMarketplace>,
    pub notifier: std::sync::Arc<RecordingNotifier>,
}

pub fn pipeline_fixture(
    scope: &str,
    store: std::sync::Arc<crate::store::MemoryStore>,
    market: FakeMarketplace,
) -> PipelineFixture {
    use crate::pipeline::{Collaborators, DailySupplyPipeline, PipelineConfig};
    use crate::resolver::{CatalogGate, ProductResolver};
    use crate::retry::RetryPolicy;
    use std::sync::Arc;

    let market = Arc::new(market);
    let notifier = Arc::new(RecordingNotifier::new());
    let policy = RetryPolicy {
        max_attempts: 1,
        ..RetryPolicy::default()
    };
    let resolver = ProductResolver::new(
        scope,
        store.clone(),
        Arc::new(ScriptedCatalog::new()),
        CatalogGate::new(2),
        policy,
        "ru",
    );
    let pipeline = DailySupplyPipeline::new(
        PipelineConfig {
            scope: scope.to_string(),
            enabled: true,
            supply_name_prefix: "AutoSupply".into(),
            utc_offset: chrono::FixedOffset::east_opt(3 * 3600).unwrap(),
        },
        Collaborators {
            orders: market.clone(),
            registrar: market.clone(),
            ledger: store.clone(),
            notifier: notifier.clone(),
            resolver,
        },
    );
    PipelineFixture {
        pipeline,
        store,
        market,
        notifier,
    }
}
