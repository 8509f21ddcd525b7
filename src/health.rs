//! Reconciliation health surface
//!
//! Outcomes of registrar calls are folded into a [`HealthState`] shared by the
//! reconciler, the event source and a small HTTP server:
//!
//! - `GET /healthz` - liveness, always `ok` while the process serves
//! - `GET /readyz` - 200 once the initial sync finished and consecutive
//!   registrar failures are below the threshold, 503 otherwise
//! - `GET /status` - JSON snapshot of the counters below

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Error;
use crate::registrar::RegistrarAction;

/// Shared reconciliation health
#[derive(Debug)]
pub struct HealthState {
    failure_threshold: u64,
    synced: AtomicBool,
    events_received: AtomicU64,
    registrations: AtomicU64,
    unregistrations: AtomicU64,
    failures_total: AtomicU64,
    consecutive_failures: AtomicU64,
    last_success: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time view of [`HealthState`], served on `/status`
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// Initial listing delivered
    pub synced: bool,
    /// Readiness as reported on `/readyz`
    pub ready: bool,
    /// Events received from the watch
    pub events_received: u64,
    /// Successful register calls
    pub registrations: u64,
    /// Successful unregister calls
    pub unregistrations: u64,
    /// Failed reconciliations since start
    pub failures_total: u64,
    /// Failed reconciliations since the last successful registrar call
    pub consecutive_failures: u64,
    /// Time of the last successful registrar call
    pub last_successful_sync: Option<DateTime<Utc>>,
    /// Most recent failure message
    pub last_error: Option<String>,
}

impl HealthState {
    /// Create a state that turns unready after `failure_threshold` consecutive failures
    pub fn new(failure_threshold: u64) -> Self {
        Self {
            failure_threshold,
            synced: AtomicBool::new(false),
            events_received: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            unregistrations: AtomicU64::new(0),
            failures_total: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_success: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Count an event delivered by the watch
    pub fn record_event(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the initial listing as delivered
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Relaxed);
    }

    /// Record a successful registrar call
    pub fn record_success(&self, action: RegistrarAction) {
        match action {
            RegistrarAction::Register => self.registrations.fetch_add(1, Ordering::Relaxed),
            RegistrarAction::Unregister => self.unregistrations.fetch_add(1, Ordering::Relaxed),
        };
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if let Ok(mut last) = self.last_success.lock() {
            *last = Some(Utc::now());
        }
    }

    /// Record an event handled without error, whether or not it called the registrar
    pub fn record_reconciled(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Record a reconciliation that gave up
    pub fn record_failure(&self, error: &Error) {
        self.failures_total.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }

    /// Failures since the last event handled without error
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Ready once synced and below the failure threshold
    pub fn is_ready(&self) -> bool {
        self.synced.load(Ordering::Relaxed) && self.consecutive_failures() < self.failure_threshold
    }

    /// Snapshot the counters
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            synced: self.synced.load(Ordering::Relaxed),
            ready: self.is_ready(),
            events_received: self.events_received.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            unregistrations: self.unregistrations.load(Ordering::Relaxed),
            failures_total: self.failures_total.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
            last_successful_sync: self.last_success.lock().ok().and_then(|g| *g),
            last_error: self.last_error.lock().ok().and_then(|g| g.clone()),
        }
    }
}

async fn readyz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn status(State(state): State<Arc<HealthState>>) -> Json<HealthSnapshot> {
    Json(state.snapshot())
}

/// Create the health router
pub fn health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .with_state(state)
}

/// Bind the health listener
///
/// Done before the controller starts so a taken port fails startup instead
/// of leaving the process without probes.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, Error> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("failed to bind health server on {addr}: {e}")))
}

/// Serve the health router on `listener` until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    state: Arc<HealthState>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Starting health server");
    }

    axum::serve(listener, health_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::config(format!("health server error: {e}")))
}
