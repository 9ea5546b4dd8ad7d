//! Local status API for a background monitor or trade loop
//!
//! `GET /api/health`, `GET /api/budget`, `GET /api/signals`, `GET /api/events`
//! and `POST /api/cancel`. Read-only apart from cancellation.

use alpha_engine::{atomic_to_usd, BudgetGuard, CycleEvent, CycleReport, RunSummary, Signal};
use axum::{
    extract::{Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::APP_VERSION;

const MAX_SIGNALS: usize = 200;
const MAX_EVENTS: usize = 200;
const DEFAULT_LIMIT: usize = 50;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalRecord {
    pub cycle: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub signal: Signal,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub cycle: u64,
    pub at: DateTime<Utc>,
    pub kind: &'static str,
    pub message: String,
}

/// Shared state of the background loop, newest entries first
pub struct LoopProgress {
    pub mode: &'static str,
    pub status: RwLock<LoopStatus>,
    pub cycles: AtomicU64,
    pub spent_atomic: AtomicU64,
    pub signals: RwLock<Vec<SignalRecord>>,
    pub events: RwLock<Vec<EventRecord>>,
    pub summary: RwLock<Option<RunSummary>>,
}

impl LoopProgress {
    pub fn new(mode: &'static str) -> Self {
        Self {
            mode,
            status: RwLock::new(LoopStatus::Running),
            cycles: AtomicU64::new(0),
            spent_atomic: AtomicU64::new(0),
            signals: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            summary: RwLock::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.status.read().unwrap_or_else(PoisonError::into_inner),
            LoopStatus::Running
        )
    }

    pub fn record(&self, event: &CycleEvent<CycleReport>) {
        let now = Utc::now();
        match event {
            CycleEvent::Completed { cycle, output } => {
                self.cycles.store(*cycle, Ordering::Relaxed);
                self.spent_atomic.fetch_add(output.spent_atomic, Ordering::Relaxed);
                for signal in output.signals() {
                    self.push_signal(SignalRecord {
                        cycle: *cycle,
                        at: now,
                        signal: signal.clone(),
                    });
                }
                for aborted in output.aborted() {
                    self.push_event(EventRecord {
                        cycle: *cycle,
                        at: now,
                        kind: "aborted",
                        message: aborted.to_string(),
                    });
                }
            }
            CycleEvent::Failed {
                cycle,
                error,
                consecutive_failures,
            } => {
                self.cycles.store(*cycle, Ordering::Relaxed);
                self.push_event(EventRecord {
                    cycle: *cycle,
                    at: now,
                    kind: "failed",
                    message: format!("{} ({} in a row)", error, consecutive_failures),
                });
            }
            CycleEvent::Stopped(summary) => {
                *self.status.write().unwrap_or_else(PoisonError::into_inner) = LoopStatus::Stopped;
                *self.summary.write().unwrap_or_else(PoisonError::into_inner) = Some(summary.clone());
                self.push_event(EventRecord {
                    cycle: summary.cycles,
                    at: now,
                    kind: "stopped",
                    message: format!("{:?} after {} cycle(s)", summary.stop, summary.cycles),
                });
            }
        }
    }

    fn push_signal(&self, record: SignalRecord) {
        let mut signals = self.signals.write().unwrap_or_else(PoisonError::into_inner);
        signals.insert(0, record);
        signals.truncate(MAX_SIGNALS);
    }

    fn push_event(&self, record: EventRecord) {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        events.insert(0, record);
        events.truncate(MAX_EVENTS);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub progress: Arc<LoopProgress>,
    pub budget: Arc<BudgetGuard>,
    pub cancel: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/budget", get(api_budget))
        .route("/signals", get(api_signals))
        .route("/events", get(api_events))
        .route("/cancel", post(api_cancel))
        .with_state(state)
}

// ============================================================================
// API Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

/// GET /api/health
async fn api_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let summary = state
        .progress
        .summary
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Json(serde_json::json!({
        "status": "ok",
        "service": "alpha-agent",
        "version": APP_VERSION,
        "mode": state.progress.mode,
        "running": state.progress.is_running(),
        "cycles": state.progress.cycles.load(Ordering::Relaxed),
        "summary": summary,
    }))
}

/// GET /api/budget: global spend window
async fn api_budget(State(state): State<AppState>) -> Json<serde_json::Value> {
    let budget = state.budget.current_state();
    let remaining = budget.remaining();
    Json(serde_json::json!({
        "budget": budget,
        "remaining_atomic": remaining,
        "remaining_usd": atomic_to_usd(remaining),
        "spent_usd": atomic_to_usd(budget.spent_atomic),
        "loop_spent_atomic": state.progress.spent_atomic.load(Ordering::Relaxed),
    }))
}

/// GET /api/signals?limit=N: latest signals first
async fn api_signals(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> Json<serde_json::Value> {
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT);
    let signals: Vec<SignalRecord> = state
        .progress
        .signals
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .take(limit)
        .cloned()
        .collect();
    Json(serde_json::json!({ "count": signals.len(), "signals": signals }))
}

/// GET /api/events?limit=N: failures, aborted subjects, stop
async fn api_events(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> Json<serde_json::Value> {
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT);
    let events: Vec<EventRecord> = state
        .progress
        .events
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .take(limit)
        .cloned()
        .collect();
    Json(serde_json::json!({ "count": events.len(), "events": events }))
}

/// POST /api/cancel: stop the loop; the status API keeps serving
async fn api_cancel(State(state): State<AppState>) -> Json<serde_json::Value> {
    let already = state.cancel.is_cancelled();
    state.cancel.cancel();
    info!("Loop cancel requested via API");
    Json(serde_json::json!({
        "success": true,
        "message": if already { "Already cancelled" } else { "Cancel requested" },
    }))
}
