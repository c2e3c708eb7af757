use crate::aggregate::{Aggregation, aggregate};
use crate::models::{Order, ResolvedProduct, SkipReason, StageReport};
use crate::ports::{Notifier, OrderSource, RunLedger, SupplyRegistrar};
use crate::resolver::{FallbackHint, ProductResolver, ResolutionMemo};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub scope: String,
    pub enabled: bool,
    pub supply_name_prefix: String,
    pub utc_offset: FixedOffset,
}

/// Everything one scope's pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub orders: Arc<dyn OrderSource>,
    pub registrar: Arc<dyn SupplyRegistrar>,
    pub ledger: Arc<dyn RunLedger>,
    pub notifier: Arc<dyn Notifier>,
    pub resolver: ProductResolver,
}

/// Drives one daily supply run for a single scope.
#[derive(Clone)]
pub struct DailySupplyPipeline {
    config: Arc<PipelineConfig>,
    deps: Collaborators,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    CheckingIdempotency,
    FetchingOrders,
    CreatingSupply,
    ResolvingProducts,
    Aggregating,
    Reporting,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub stage: &'static str,
    pub kind: PipelineErrorKind,
    pub message: String,
}

impl From<&PipelineError> for RunFailure {
    fn from(err: &PipelineError) -> Self {
        Self {
            stage: err.stage(),
            kind: err.kind(),
            message: err.detail().to_string(),
        }
    }
}

/// Terminal result of a run. Runs never return errors; a failure is carried
/// in `failure` with `state == Failed`.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub scope: String,
    pub day_key: String,
    pub state: RunState,
    pub skipped: Option<SkipReason>,
    pub supply_id: Option<String>,
    pub order_count: usize,
    pub total_qty: u64,
    pub lines: Vec<String>,
    pub unresolved: usize,
    pub upstream_errors: usize,
    pub report_text: Option<String>,
    pub failure: Option<RunFailure>,
    pub stages: Vec<StageReport>,
}

struct Progress {
    scope: String,
    day_key: String,
    state: RunState,
    stages: Vec<StageReport>,
}

impl Progress {
    fn new(scope: &str, day_key: &str) -> Self {
        Self {
            scope: scope.to_string(),
            day_key: day_key.to_string(),
            state: RunState::Idle,
            stages: Vec::new(),
        }
    }

    fn advance(&mut self, next: RunState) {
        debug!(
            target = "supply.pipeline",
            scope = %self.scope,
            day_key = %self.day_key,
            from = ?self.state,
            to = ?next,
            "run_state"
        );
        self.state = next;
    }

    fn outcome(&mut self) -> RunOutcome {
        RunOutcome {
            scope: self.scope.clone(),
            day_key: self.day_key.clone(),
            state: self.state,
            skipped: None,
            supply_id: None,
            order_count: 0,
            total_qty: 0,
            lines: Vec::new(),
            unresolved: 0,
            upstream_errors: 0,
            report_text: None,
            failure: None,
            stages: std::mem::take(&mut self.stages),
        }
    }
}

impl DailySupplyPipeline {
    pub fn new(config: PipelineConfig, deps: Collaborators) -> Self {
        Self {
            config: Arc::new(config),
            deps,
        }
    }

    pub fn scope(&self) -> &str {
        &self.config.scope
    }

    /// Calendar day of `now` in the configured offset, `YYYY-MM-DD`.
    pub fn day_key(&self, now: DateTime<Utc>) -> String {
        now.with_timezone(&self.config.utc_offset)
            .format("%Y-%m-%d")
            .to_string()
    }

    pub async fn run(&self) -> RunOutcome {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> RunOutcome {
        let day_key = self.day_key(now);
        let mut progress = Progress::new(&self.config.scope, &day_key);

        if !self.config.enabled {
            info!(target = "supply.pipeline", scope = %self.config.scope, %day_key, "daily supply disabled for scope");
            progress.advance(RunState::Done);
            let mut outcome = progress.outcome();
            outcome.skipped = Some(SkipReason::Disabled);
            return outcome;
        }

        info!(target = "supply.pipeline", scope = %self.config.scope, %day_key, "run_started");
        match self.execute(&mut progress, now).await {
            Ok(outcome) => {
                info!(
                    target = "supply.pipeline",
                    scope = %outcome.scope,
                    day_key = %outcome.day_key,
                    total_qty = outcome.total_qty,
                    skipped = ?outcome.skipped,
                    "run_finished"
                );
                outcome
            }
            Err(err) => self.fail(progress, now, err).await,
        }
    }

    async fn execute(
        &self,
        progress: &mut Progress,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, PipelineError> {
        let scope = self.config.scope.clone();
        let day_key = progress.day_key.clone();

        progress.advance(RunState::CheckingIdempotency);
        let already_ran = self
            .capture_stage(
                "check_idempotency",
                &mut progress.stages,
                stages::check_idempotency(&*self.deps.ledger, &scope, &day_key),
            )
            .await?;
        if already_ran {
            info!(target = "supply.pipeline", %scope, %day_key, "supply already created today");
            progress.advance(RunState::Done);
            let mut outcome = progress.outcome();
            outcome.skipped = Some(SkipReason::AlreadyRan);
            return Ok(outcome);
        }

        progress.advance(RunState::FetchingOrders);
        let orders = self
            .capture_stage(
                "fetch_orders",
                &mut progress.stages,
                stages::fetch_orders(&*self.deps.orders),
            )
            .await?;

        if orders.is_empty() {
            progress.advance(RunState::Reporting);
            let text = format!("Supply {day_key}: no new orders.");
            self.capture_stage(
                "report",
                &mut progress.stages,
                stages::report(self.reporting(&scope, &day_key, now), None, 0, &text),
            )
            .await?;
            progress.advance(RunState::Done);
            let mut outcome = progress.outcome();
            outcome.lines = Aggregation::default().render();
            outcome.report_text = Some(text);
            return Ok(outcome);
        }

        progress.advance(RunState::CreatingSupply);
        let supply_name = format!("{} {day_key}", self.config.supply_name_prefix);
        let supply_id = self
            .capture_stage(
                "create_supply",
                &mut progress.stages,
                stages::create_supply(&*self.deps.registrar, &supply_name),
            )
            .await?;
        self.capture_stage(
            "attach_orders",
            &mut progress.stages,
            stages::attach_orders(&*self.deps.registrar, &supply_id, &orders),
        )
        .await?;

        progress.advance(RunState::ResolvingProducts);
        let memo = self
            .capture_stage(
                "resolve_products",
                &mut progress.stages,
                stages::resolve_products(&self.deps.resolver, &orders),
            )
            .await?;
        let unresolved = memo
            .values()
            .filter(|r| r.product.source.is_unresolved())
            .count();
        let upstream_errors = memo.values().filter(|r| r.upstream_error).count();

        progress.advance(RunState::Aggregating);
        let aggregation = self
            .capture_stage(
                "aggregate",
                &mut progress.stages,
                stages::aggregate_orders(&self.deps.resolver, &memo, &orders),
            )
            .await?;

        progress.advance(RunState::Reporting);
        let lines = report_lines(&aggregation, unresolved, upstream_errors);
        let text = format!(
            "Supply {day_key}\nSupply created: {supply_id}\n\n{}",
            lines.join("\n")
        );
        self.capture_stage(
            "report",
            &mut progress.stages,
            stages::report(
                self.reporting(&scope, &day_key, now),
                Some(&supply_id),
                orders.len(),
                &text,
            ),
        )
        .await?;

        progress.advance(RunState::Done);
        let mut outcome = progress.outcome();
        outcome.supply_id = Some(supply_id);
        outcome.order_count = orders.len();
        outcome.total_qty = aggregation.total;
        outcome.lines = lines;
        outcome.unresolved = unresolved;
        outcome.upstream_errors = upstream_errors;
        outcome.report_text = Some(text);
        Ok(outcome)
    }

    /// Records and announces a failed run. Ledger and notifier errors are
    /// logged only.
    async fn fail(&self, mut progress: Progress, now: DateTime<Utc>, err: PipelineError) -> RunOutcome {
        error!(
            target = "supply.pipeline",
            scope = %progress.scope,
            day_key = %progress.day_key,
            stage = err.stage(),
            error = %err,
            "run_failed"
        );
        progress.advance(RunState::Failed);
        let message = err.to_string();
        let scope = progress.scope.clone();
        let day_key = progress.day_key.clone();

        if let Err(store_err) = self
            .deps
            .ledger
            .mark_failed(&scope, &day_key, now, &message)
            .await
        {
            error!(target = "supply.pipeline", %scope, %day_key, error = %store_err, "ledger_mark_failed_failed");
        }
        let text = format!("Supply {day_key}: failed\n{message}");
        if let Err(notify_err) = self.deps.notifier.notify_admins(&text).await {
            error!(target = "supply.pipeline", %scope, %day_key, error = %notify_err, "failure_notification_failed");
        }

        let mut outcome = progress.outcome();
        outcome.report_text = Some(text);
        outcome.failure = Some(RunFailure::from(&err));
        outcome
    }

    fn reporting<'a>(
        &'a self,
        scope: &'a str,
        day_key: &'a str,
        at: DateTime<Utc>,
    ) -> stages::ReportTarget<'a> {
        stages::ReportTarget {
            ledger: &*self.deps.ledger,
            notifier: &*self.deps.notifier,
            scope,
            day_key,
            at,
        }
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

fn fallback_hint(order: &Order) -> FallbackHint {
    FallbackHint {
        name: order.fallback_name().map(str::to_string),
        color: order.raw_color().map(str::to_string),
    }
}

/// Aggregated lines plus the optional notes about degraded resolutions.
fn report_lines(aggregation: &Aggregation, unresolved: usize, upstream_errors: usize) -> Vec<String> {
    let mut lines = aggregation.render();
    if unresolved > 0 {
        lines.push(format!("Unresolved products: {unresolved}"));
    }
    if upstream_errors > 0 {
        lines.push(format!("Catalog errors: {upstream_errors}"));
    }
    lines
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineErrorKind {
    /// The upstream answered in a way the run cannot continue from.
    Configuration,
    Upstream,
    Storage,
}

impl PipelineError {
    pub fn configuration(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Configuration,
        }
    }

    pub fn upstream(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Upstream,
        }
    }

    pub fn storage(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Storage,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

mod stages {
    use super::*;
    use crate::ports::ATTACH_CHUNK_LIMIT;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tracing::warn;

    pub(super) struct ReportTarget<'a> {
        pub ledger: &'a dyn RunLedger,
        pub notifier: &'a dyn Notifier,
        pub scope: &'a str,
        pub day_key: &'a str,
        pub at: DateTime<Utc>,
    }

    pub(super) async fn check_idempotency(
        ledger: &dyn RunLedger,
        scope: &str,
        day_key: &str,
    ) -> Result<StageOutcome<bool>, PipelineError> {
        let already_ran = ledger
            .already_ran(scope, day_key)
            .await
            .map_err(|err| PipelineError::storage("check_idempotency", err.to_string()))?;
        Ok(StageOutcome::new(
            already_ran,
            json!({ "day_key": day_key, "already_ran": already_ran }),
        ))
    }

    pub(super) async fn fetch_orders(
        source: &dyn OrderSource,
    ) -> Result<StageOutcome<Vec<Order>>, PipelineError> {
        let orders = source
            .fetch_new_orders()
            .await
            .map_err(|err| PipelineError::upstream("fetch_orders", err.to_string()))?;
        let units: u64 = orders.iter().map(|o| u64::from(o.quantity)).sum();
        let output = json!({ "orders": orders.len(), "units": units });
        Ok(StageOutcome::new(orders, output))
    }

    pub(super) async fn create_supply(
        registrar: &dyn SupplyRegistrar,
        name: &str,
    ) -> Result<StageOutcome<String>, PipelineError> {
        let supply_id = registrar
            .create_supply(name)
            .await
            .map_err(|err| PipelineError::upstream("create_supply", err.to_string()))?;
        let supply_id = supply_id.trim().to_string();
        if supply_id.is_empty() {
            return Err(PipelineError::configuration(
                "create_supply",
                "supply creation response carried no supply id",
            ));
        }
        let output = json!({ "name": name, "supply_id": supply_id });
        Ok(StageOutcome::new(supply_id, output))
    }

    pub(super) async fn attach_orders(
        registrar: &dyn SupplyRegistrar,
        supply_id: &str,
        orders: &[Order],
    ) -> Result<StageOutcome<()>, PipelineError> {
        let order_ids: Vec<u64> = orders.iter().map(|o| o.order_id).collect();
        let mut chunks = 0usize;
        for chunk in order_ids.chunks(ATTACH_CHUNK_LIMIT) {
            registrar
                .attach_orders(supply_id, chunk)
                .await
                .map_err(|err| {
                    PipelineError::upstream("attach_orders", format!("supply {supply_id}: {err}"))
                })?;
            chunks += 1;
        }
        Ok(StageOutcome::new(
            (),
            json!({ "orders": order_ids.len(), "chunks": chunks }),
        ))
    }

    pub(super) async fn resolve_products(
        resolver: &ProductResolver,
        orders: &[Order],
    ) -> Result<StageOutcome<ResolutionMemo>, PipelineError> {
        let mut memo = ResolutionMemo::new();
        memo.resolve_all(
            resolver,
            orders.iter().map(|o| (o.product_id, fallback_hint(o))),
        )
        .await;

        let mut by_source: BTreeMap<&'static str, usize> = BTreeMap::new();
        for resolution in memo.values() {
            *by_source
                .entry(resolution.product.source.as_str())
                .or_default() += 1;
        }
        let output = json!({ "products": memo.len(), "by_source": by_source });
        Ok(StageOutcome::new(memo, output))
    }

    pub(super) async fn aggregate_orders(
        resolver: &ProductResolver,
        memo: &ResolutionMemo,
        orders: &[Order],
    ) -> Result<StageOutcome<Aggregation>, PipelineError> {
        let products: Vec<ResolvedProduct> = orders
            .iter()
            .map(|order| match memo.get(order.product_id) {
                Some(resolution) => resolution.product.clone(),
                None => {
                    resolver
                        .placeholder(order.product_id, &fallback_hint(order))
                        .product
                }
            })
            .collect();
        let aggregation = aggregate(orders.iter().zip(products.iter()));
        let output = json!({ "total_qty": aggregation.total, "groups": aggregation.lines.len() });
        Ok(StageOutcome::new(aggregation, output))
    }

    /// Persists and announces the report. Neither side effect can fail the run.
    pub(super) async fn report(
        target: ReportTarget<'_>,
        supply_id: Option<&str>,
        order_count: usize,
        text: &str,
    ) -> Result<StageOutcome<()>, PipelineError> {
        let recorded = match target
            .ledger
            .mark_ok(target.scope, target.day_key, supply_id, target.at, order_count, text)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(target = "supply.pipeline", scope = %target.scope, day_key = %target.day_key, error = %err, "ledger_mark_ok_failed");
                false
            }
        };
        let notified = match target.notifier.notify_admins(text).await {
            Ok(()) => true,
            Err(err) => {
                warn!(target = "supply.pipeline", scope = %target.scope, day_key = %target.day_key, error = %err, "report_notification_failed");
                false
            }
        };
        Ok(StageOutcome::new(
            (),
            json!({ "recorded": recorded, "notified": notified }),
        ))
    }
}
