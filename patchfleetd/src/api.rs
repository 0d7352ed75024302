//! HTTP API of the aggregator.
//!
//! Provides:
//! - `/health` - daemon health check
//! - `/ticket/` - ticket listing for workers
//! - `/ticket/{id}` - one ticket (GET) or tracker metadata upsert (PUT)
//! - `/ticket/{id}/status` - derived status for a base/machine
//! - `/report/{id}` - report submission
//! - `/trusted` - trusted author list
//! - `/base/latest` - greatest baseline label seen on ticket 0
//! - `/log/{*key}`, `/ticket/{id}/log/{*key}` - stored test logs

use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{Duration, Utc};
use patchfleet_common::{
    BASELINE_TICKET_ID, BaseFilter, LeasePolicy, MachineId, SubmissionError, SubmissionPolicy,
    Ticket, TicketStatus, TimedCache, derive_status, latest_version, log_name, now_str,
    prune_and_release, validate_submission,
};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};

use crate::logs::LogStore;
use crate::store::TicketStore;

/// Policies the handlers need from the daemon settings.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub lease: LeasePolicy,
    pub submission: SubmissionPolicy,
    pub trusted_authors: Vec<String>,
    pub ticket_limit: usize,
    pub latest_base_refresh: Duration,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            lease: LeasePolicy::default(),
            submission: SubmissionPolicy::default(),
            trusted_authors: Vec::new(),
            ticket_limit: 1000,
            latest_base_refresh: Duration::seconds(60),
        }
    }
}

/// Shared state for HTTP handlers.
pub struct AppState {
    pub store: TicketStore,
    pub logs: LogStore,
    pub settings: ApiSettings,
    latest_base: Mutex<TimedCache<Option<String>>>,
    pub started_at: Instant,
    pub version: &'static str,
}

impl AppState {
    pub fn new(store: TicketStore, logs: LogStore, settings: ApiSettings) -> Self {
        let latest_base = Mutex::new(TimedCache::new(settings.latest_base_refresh));
        Self {
            store,
            logs,
            settings,
            latest_base,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    fn prune(&self, id: Option<u64>) {
        let removed = self
            .store
            .prune_expired(id, &self.settings.lease, Utc::now(), &self.logs);
        if removed > 0 {
            info!("Pruned {} expired pending reports", removed);
        }
    }

    fn latest_base(&self) -> Option<String> {
        let mut cache = self.latest_base.lock().unwrap_or_else(|e| e.into_inner());
        let refreshed = cache.get_or_try_refresh(Utc::now(), || {
            let baseline = self.store.baseline();
            let latest = latest_version(
                baseline
                    .reports
                    .iter()
                    .filter(|r| !r.is_pending())
                    .map(|r| r.base.as_str()),
            )
            .map(str::to_string);
            Ok::<_, std::convert::Infallible>(latest)
        });
        match refreshed {
            Ok(latest) => latest.clone(),
            Err(never) => match never {},
        }
    }

    fn invalidate_latest_base(&self) {
        let mut cache = self.latest_base.lock().unwrap_or_else(|e| e.into_inner());
        cache.invalidate();
    }
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ticket", get(list_tickets_handler))
        .route("/ticket/", get(list_tickets_handler))
        .route("/ticket/{id}", get(get_ticket_handler).put(put_ticket_handler))
        .route("/ticket/{id}/status", get(status_handler))
        .route("/report/{id}", post(post_report_handler))
        .route("/trusted", get(trusted_handler))
        .route("/base/latest", get(latest_base_handler))
        .route("/log/{*key}", get(log_handler))
        .route("/ticket/{id}/log/{*key}", get(ticket_log_handler))
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no ticket #{0}")]
    NotFound(u64),

    #[error("{0}")]
    BadRequest(String),

    #[error("no log {0}")]
    LogNotFound(String),

    #[error("failed to read log {key}: {source}")]
    LogRead {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) | Self::LogNotFound(_) => StatusCode::NOT_FOUND,
            Self::LogRead { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Submission(e) if e.is_forbidden() => StatusCode::FORBIDDEN,
            Self::Submission(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = std::time::Duration::from_secs(state.started_at.elapsed().as_secs());
    Json(json!({
        "status": "healthy",
        "version": state.version,
        "uptime_seconds": uptime.as_secs(),
        "uptime": humantime::format_duration(uptime).to_string(),
        "tickets": state.store.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_tickets_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<Ticket>> {
    state.prune(None);
    let limit = query
        .limit
        .unwrap_or(state.settings.ticket_limit)
        .min(state.settings.ticket_limit);
    Json(state.store.list(query.status.as_deref(), limit))
}

async fn get_ticket_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Ticket>, ApiError> {
    state.prune(Some(id));
    state.store.get(id).map(Json).ok_or(ApiError::NotFound(id))
}

async fn put_ticket_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(ticket): Json<Ticket>,
) -> Result<Json<Ticket>, ApiError> {
    if ticket.id != id {
        return Err(ApiError::BadRequest(format!(
            "ticket id {} does not match path id {}",
            ticket.id, id
        )));
    }
    Ok(Json(state.store.upsert(ticket)))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    base: Option<String>,
    machine: Option<String>,
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<TicketStatus>, ApiError> {
    state.prune(Some(id));
    let ticket = state.store.get(id).ok_or(ApiError::NotFound(id))?;
    let base = BaseFilter::from_query(query.base.as_deref());
    let machine = query
        .machine
        .as_deref()
        .filter(|m| !m.is_empty())
        .map(MachineId::from_colon_separated);
    Ok(Json(derive_status(&ticket, &base, machine.as_ref())))
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    report: Value,
    #[serde(default)]
    log: Option<String>,
}

async fn post_report_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(body): Json<SubmitBody>,
) -> Result<&'static str, ApiError> {
    if state.store.get(id).is_none() {
        return Err(ApiError::NotFound(id));
    }
    let now = Utc::now();
    let baseline = state.store.baseline();
    let report = validate_submission(&body.report, id, &baseline, &state.settings.submission, now)
        .inspect_err(|e| warn!("Rejected report for #{}: {}", id, e))?;

    let key = log_name(id, &report);
    let machine = report.machine.clone();
    let status = report.status;
    state
        .store
        .update(id, |ticket| {
            prune_and_release(ticket, Some(&machine), &state.settings.lease, now, &state.logs);
            ticket.reports.push(report);
            ticket.retry = false;
            ticket.last_activity = Some(now_str());
        })
        .ok_or(ApiError::NotFound(id))?;

    if let Some(text) = body.log.filter(|t| !t.is_empty())
        && let Err(e) = state.logs.store(&key, &text)
    {
        warn!("Failed to store log {}: {}", key, e);
    }
    if id == BASELINE_TICKET_ID {
        state.invalidate_latest_base();
    }

    info!("#{}: {} from {}", id, status, machine);
    Ok("ok")
}

async fn trusted_handler(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    let mut trusted = state.settings.trusted_authors.clone();
    trusted.sort();
    trusted.dedup();
    Json(trusted)
}

async fn latest_base_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "base": state.latest_base() }))
}

async fn log_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let key = format!("/log/{}", key.trim_start_matches('/'));
    match state.logs.fetch(&key) {
        Ok(Some(text)) => Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text)),
        Ok(None) => Err(ApiError::LogNotFound(key)),
        Err(source) => Err(ApiError::LogRead { key, source }),
    }
}

async fn ticket_log_handler(
    state: State<Arc<AppState>>,
    Path((_id, key)): Path<(u64, String)>,
) -> Result<impl IntoResponse, ApiError> {
    log_handler(state, Path(key)).await
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve(
    addr: std::net::SocketAddr,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
