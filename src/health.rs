use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::QUEUE_DEPTH;
use crate::queue::ModelQueueRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    Serving,
    NotServing,
}

impl From<bool> for ServingStatus {
    fn from(serving: bool) -> Self {
        if serving {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ready: ServingStatus,
    pub alive: ServingStatus,
    pub startup: ServingStatus,
    pub queued: usize,
    pub capacity: usize,
    pub timestamp: String,
}

// Serving flags for the health endpoints
#[derive(Debug)]
pub struct HealthState {
    ready: AtomicBool,
    alive: AtomicBool,
    startup: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            alive: AtomicBool::new(true),
            startup: AtomicBool::new(true),
        }
    }

    pub fn ready(&self) -> ServingStatus {
        self.ready.load(Ordering::Relaxed).into()
    }

    pub fn alive(&self) -> ServingStatus {
        self.alive.load(Ordering::Relaxed).into()
    }

    pub fn startup(&self) -> ServingStatus {
        self.startup.load(Ordering::Relaxed).into()
    }

    /// Returns the previous readiness.
    pub fn set_ready(&self, ready: bool) -> bool {
        self.ready.swap(ready, Ordering::Relaxed)
    }

    pub fn report(&self, registry: &ModelQueueRegistry) -> HealthReport {
        HealthReport {
            ready: self.ready(),
            alive: self.alive(),
            startup: self.startup(),
            queued: registry.total_len(),
            capacity: registry.total_capacity(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Fleet-wide backpressure check: healthy while total occupancy is at most
/// half of total capacity.
pub fn queues_healthy(registry: &ModelQueueRegistry) -> bool {
    registry.total_len() * 2 <= registry.total_capacity()
}

/// Runs one check, updates readiness and queue gauges. Returns the new
/// readiness.
pub fn check(registry: &ModelQueueRegistry, health: &HealthState) -> bool {
    for queue in registry.iter() {
        QUEUE_DEPTH
            .with_label_values(&[queue.model()])
            .set(queue.len() as i64);
    }

    let healthy = queues_healthy(registry);
    let was_healthy = health.set_ready(healthy);

    // Log status changes
    if was_healthy != healthy {
        if healthy {
            info!(
                queued = registry.total_len(),
                capacity = registry.total_capacity(),
                "queues drained, dispatcher is ready"
            );
        } else {
            warn!(
                queued = registry.total_len(),
                capacity = registry.total_capacity(),
                "queues over half full, dispatcher is not ready"
            );
        }
    }
    healthy
}

pub async fn health_checker(
    registry: Arc<ModelQueueRegistry>,
    health: Arc<HealthState>,
    check_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(check_interval);
    info!(interval = ?check_interval, "health checker started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                check(&registry, &health);
            }
        }
    }
}
