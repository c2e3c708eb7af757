mod aggregate;
mod config;
mod http;
mod jobs;
mod metrics;
mod models;
mod normalizer;
mod pipeline;
mod ports;
mod resolver;
mod retry;
mod security;
mod store;
mod telegram;
#[cfg(test)]
mod testing;
mod wb;

use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::{AccountConfig, Settings, env_string};
use eyre::WrapErr;
use jobs::{DailySchedule, EnqueueError, JobQueue, Trigger};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, RunRecord};
use pipeline::{Collaborators, DailySupplyPipeline, PipelineConfig};
use ports::{ProductCache, RunLedger, StoreError};
use resolver::{CatalogGate, ProductResolver};
use security::{AdminContext, AuthState, require_admin_key};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{MemoryStore, RedisStore};
use telegram::TelegramNotifier;
use thiserror::Error;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use wb::{WbContentClient, WbMarketplaceClient};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "supply.api", "service stopped: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    init_tracing();

    let settings = Settings::from_env().wrap_err("loading settings")?;
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let (cache, ledger) = open_stores(&settings);
    let gate = CatalogGate::new(settings.content_max_parallel);
    info!(
        target = "supply.api",
        catalog_parallelism = gate.capacity(),
        "catalog gate ready"
    );

    let pipelines: Vec<DailySupplyPipeline> = settings
        .accounts
        .iter()
        .map(|account| build_pipeline(&settings, account, &cache, &ledger, &gate))
        .collect();
    let (queue, _workers) = JobQueue::spawn(pipelines, settings.queue_capacity);

    let scheduled: Vec<String> = settings
        .accounts
        .iter()
        .filter(|account| settings.enabled_for(account))
        .map(|account| account.name.clone())
        .collect();
    if scheduled.is_empty() {
        warn!(target = "supply.api", "no account has daily supply enabled; scheduler idle");
    } else {
        jobs::spawn_daily_trigger(
            queue.clone(),
            scheduled,
            DailySchedule {
                hour: settings.daily_hour,
                minute: settings.daily_minute,
                offset: settings.utc_offset,
            },
        );
    }

    let state = AppState {
        queue,
        ledger,
        prometheus_handle,
        metrics_key: env_string("METRICS_KEY"),
    };
    let app = router(state, AuthState::from_env());

    let addr: SocketAddr = ([0, 0, 0, 0], settings.port).into();
    info!(target = "supply.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn open_stores(settings: &Settings) -> (Arc<dyn ProductCache>, Arc<dyn RunLedger>) {
    if let Some(url) = &settings.redis_url {
        match RedisStore::open(url) {
            Ok(store) => {
                info!(target = "supply.store", "using redis for cache and ledger");
                let store = Arc::new(store);
                let cache: Arc<dyn ProductCache> = store.clone();
                return (cache, store);
            }
            Err(err) => {
                warn!(target = "supply.store", error = %err, "redis unavailable; falling back to memory")
            }
        }
    }
    let store = Arc::new(MemoryStore::new());
    let cache: Arc<dyn ProductCache> = store.clone();
    (cache, store)
}

fn build_pipeline(
    settings: &Settings,
    account: &AccountConfig,
    cache: &Arc<dyn ProductCache>,
    ledger: &Arc<dyn RunLedger>,
    gate: &CatalogGate,
) -> DailySupplyPipeline {
    let marketplace = Arc::new(WbMarketplaceClient::new(account.wb_token.clone()));
    let resolver = ProductResolver::new(
        account.name.clone(),
        cache.clone(),
        Arc::new(WbContentClient::new(account.wb_token.clone())),
        gate.clone(),
        settings.retry.clone(),
        settings.catalog_locale.clone(),
    );
    DailySupplyPipeline::new(
        PipelineConfig {
            scope: account.name.clone(),
            enabled: settings.enabled_for(account),
            supply_name_prefix: settings.supply_name_prefix.clone(),
            utc_offset: settings.utc_offset,
        },
        Collaborators {
            orders: marketplace.clone(),
            registrar: marketplace,
            ledger: ledger.clone(),
            notifier: Arc::new(TelegramNotifier::new(
                account.telegram_token.clone(),
                account.admin_ids.clone(),
            )),
            resolver,
        },
    )
}

#[derive(Clone)]
struct AppState {
    queue: JobQueue,
    ledger: Arc<dyn RunLedger>,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
}

fn router(state: AppState, auth: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/runs/{scope}", post(enqueue_run))
        .route("/runs/{scope}/last", get(last_run))
        .route("/jobs/{id}", get(get_job_status))
        .route_layer(middleware::from_fn_with_state(auth, require_admin_key));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Liveness check. `GET /health`, no auth.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "daily-supply-rs",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("x-metrics-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

/// Queue a supply run for one account.
///
/// - Method: `POST`
/// - Path: `/runs/{scope}`
/// - Auth: `Authorization: Bearer <key>` or `X-Supply-Key: <key>`
/// - Response: `202` with `{job_id}`; poll `/jobs/{id}` for the outcome.
async fn enqueue_run(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    Path(scope): Path<String>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    metrics::inc_requests("/runs/{scope}");
    let id = state.queue.enqueue(&scope, Trigger::Manual).await?;
    info!(target = "supply.api", %scope, key = %admin.key_name, job_id = %id, "manual run requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

/// Latest ledger record for a scope, successful or not.
async fn last_run(
    State(state): State<AppState>,
    Path(scope): Path<String>,
) -> Result<Json<RunRecord>, AppError> {
    metrics::inc_requests("/runs/{scope}/last");
    if !state.queue.has_scope(&scope) {
        return Err(AppError::UnknownScope(scope));
    }
    match state.ledger.last_report(&scope).await? {
        Some(record) => Ok(Json(record)),
        None => Err(AppError::NoRun(scope)),
    }
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    metrics::inc_requests("/jobs/{id}");
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::InvalidJobId);
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or(AppError::JobNotFound)
}

#[derive(Debug, Error)]
enum AppError {
    #[error("unknown scope `{0}`")]
    UnknownScope(String),
    #[error("no run recorded for `{0}`")]
    NoRun(String),
    #[error("job id must be a UUID")]
    InvalidJobId,
    #[error("job not found")]
    JobNotFound,
    #[error(transparent)]
    Enqueue(EnqueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<EnqueueError> for AppError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::UnknownScope(scope) => AppError::UnknownScope(scope),
            other => AppError::Enqueue(other),
        }
    }
}

impl AppError {
    fn code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::UnknownScope(_) => (StatusCode::NOT_FOUND, "unknown_scope"),
            AppError::NoRun(_) => (StatusCode::NOT_FOUND, "no_run"),
            AppError::InvalidJobId => (StatusCode::BAD_REQUEST, "invalid_job_id"),
            AppError::JobNotFound => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Enqueue(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable"),
            AppError::Store(_) => (StatusCode::BAD_GATEWAY, "store_unavailable"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.code();
        if status.is_server_error() {
            error!(target = "supply.api", error = %self, "request failed");
        }
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(self.to_string()),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
