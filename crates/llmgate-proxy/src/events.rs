//! Real-time event broadcasting and the monitoring snapshot loop.
//!
//! All observers share one broadcast channel carrying a tagged event enum:
//! `request-event` once per completed request, `monitoring-update` every
//! five seconds (and on demand), and `alert` when a heuristic trips. Slow
//! subscribers lag and drop per the broadcast channel's semantics; the
//! request path never waits on them.

use crate::cache::CacheStats;
use crate::pipeline::AppState;
use crate::rate_limit::RateLimiterStats;
use chrono::{DateTime, Utc};
use llmgate_core::{AuditAction, AuditStats, Provider};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How many activity samples the ring retains.
const ACTIVITY_RING_CAPACITY: usize = 20;

/// Interval between monitoring snapshots.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// One event on the observability channel, tagged for wire clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum GateEvent {
    #[serde(rename = "request-event")]
    Request(RequestEvent),
    #[serde(rename = "monitoring-update")]
    Monitoring(MonitoringSnapshot),
    #[serde(rename = "alert")]
    Alert(AlertEvent),
}

/// Published once per completed request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    pub provider: Provider,
    pub action: AuditAction,
    pub path: String,
    pub at: DateTime<Utc>,
}

/// Aggregated observability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSnapshot {
    pub at: DateTime<Utc>,
    pub totals: AuditStats,
    pub cache: CacheStats,
    pub rate_limits: RateLimiterStats,
    pub system: SystemMetrics,
    pub recent_activity: Vec<ActivitySample>,
}

/// Process memory usage sampled at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_ratio: f64,
}

impl SystemMetrics {
    pub fn sample() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let used = sys.used_memory();
        let total = sys.total_memory();
        Self {
            memory_used_bytes: used,
            memory_total_bytes: total,
            memory_ratio: if total == 0 {
                0.0
            } else {
                used as f64 / total as f64
            },
        }
    }
}

/// Heuristic alert levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub level: AlertLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// One Δtotal sample on a snapshot tick.
#[derive(Debug, Clone, Serialize)]
pub struct ActivitySample {
    pub at: DateTime<Utc>,
    pub delta: u64,
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

struct ActivityState {
    last_total: Option<u64>,
    ring: VecDeque<ActivitySample>,
}

/// Broadcast hub for request events, snapshots, and alerts.
pub struct EventBus {
    tx: broadcast::Sender<GateEvent>,
    activity: Mutex<ActivityState>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            activity: Mutex::new(ActivityState {
                last_total: None,
                ring: VecDeque::with_capacity(ACTIVITY_RING_CAPACITY),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event; a send with no subscribers is not an error.
    pub fn publish(&self, event: GateEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_request(&self, event: RequestEvent) {
        self.publish(GateEvent::Request(event));
    }

    /// Advance the activity ring with this tick's total and return the
    /// current series. A counter reset floors the delta at zero.
    pub fn record_tick(&self, at: DateTime<Utc>, total: u64) -> Vec<ActivitySample> {
        let mut state = self.activity.lock().unwrap();
        let delta = match state.last_total {
            Some(last) => total.saturating_sub(last),
            None => 0,
        };
        state.last_total = Some(total);
        state.ring.push_back(ActivitySample { at, delta });
        while state.ring.len() > ACTIVITY_RING_CAPACITY {
            state.ring.pop_front();
        }
        state.ring.iter().cloned().collect()
    }

    /// The current activity series without advancing it.
    pub fn activity_series(&self) -> Vec<ActivitySample> {
        self.activity.lock().unwrap().ring.iter().cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Alert heuristics
// ---------------------------------------------------------------------------

/// Warning when process memory pressure crosses 80%.
pub fn memory_alert(system: &SystemMetrics, at: DateTime<Utc>) -> Option<AlertEvent> {
    if system.memory_total_bytes > 0 && system.memory_ratio > 0.8 {
        Some(AlertEvent {
            level: AlertLevel::Warning,
            message: format!(
                "memory usage at {:.0}% of total",
                system.memory_ratio * 100.0
            ),
            at,
        })
    } else {
        None
    }
}

/// Info when the cache is seeing traffic but rarely hitting.
pub fn cache_alert(cache: &CacheStats, at: DateTime<Utc>) -> Option<AlertEvent> {
    if cache.total_requests > 0 && cache.hit_rate < 0.3 {
        Some(AlertEvent {
            level: AlertLevel::Info,
            message: format!("cache hit rate at {:.0}%", cache.hit_rate * 100.0),
            at,
        })
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Monitoring loop
// ---------------------------------------------------------------------------

/// Assemble one snapshot, advancing the activity ring.
pub async fn assemble_snapshot(state: &AppState) -> Option<MonitoringSnapshot> {
    let at = state.clock.now();
    let totals = match state.store.stats().await {
        Ok(totals) => totals,
        Err(e) => {
            warn!("Skipping snapshot, audit stats unavailable: {e}");
            return None;
        }
    };
    let recent_activity = state.events.record_tick(at, totals.total);

    Some(MonitoringSnapshot {
        at,
        totals,
        cache: state.cache.stats(),
        rate_limits: state.limiter.stats(),
        system: SystemMetrics::sample(),
        recent_activity,
    })
}

/// Periodic snapshot publisher. Runs until `shutdown` is cancelled.
pub async fn run_monitor(state: Arc<AppState>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
    // the immediate first tick would publish an all-zero delta
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => {
                debug!("Monitor loop stopping");
                return;
            }
        }

        let Some(snapshot) = assemble_snapshot(&state).await else {
            continue;
        };

        let at = snapshot.at;
        if let Some(alert) = memory_alert(&snapshot.system, at) {
            state.events.publish(GateEvent::Alert(alert));
        }
        if let Some(alert) = cache_alert(&snapshot.cache, at) {
            state.events.publish(GateEvent::Alert(alert));
        }
        state.events.publish(GateEvent::Monitoring(snapshot));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
