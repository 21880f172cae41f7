//! Health and metrics endpoint.
//!
//! `/healthz` aggregates per-component status (healthy/degraded/unhealthy),
//! `/metrics` exports the worker counters as JSON. Components push their
//! status into the registry as they observe failures; the endpoint never
//! probes backends itself.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crawlgrid_core::Health;
use crawlgrid_lease::LeaseManager;
use crawlgrid_queue::{QueueClient, QueueName};

use crate::concurrent::ConcurrentCrawlManager;
use crate::stats::WorkerStats;

/// Push-model component status registry.
#[derive(Default)]
pub struct ComponentHealth {
    components: DashMap<String, Health>,
}

impl ComponentHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, component: &str, health: Health) {
        self.components.insert(component.to_string(), health);
    }

    pub fn aggregate(&self) -> Health {
        let mut overall = Health::Healthy;
        for entry in self.components.iter() {
            match entry.value() {
                Health::Unhealthy => return Health::Unhealthy,
                Health::Degraded => overall = Health::Degraded,
                Health::Healthy => {}
            }
        }
        overall
    }

    pub fn snapshot(&self) -> HashMap<String, Health> {
        self.components
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

pub struct ServerState {
    pub crawler_id: String,
    pub started_at: DateTime<Utc>,
    pub stats: Arc<WorkerStats>,
    pub health: Arc<ComponentHealth>,
    pub concurrency: Arc<ConcurrentCrawlManager>,
    pub lease: Arc<LeaseManager>,
    pub queue: QueueClient,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let overall = state.health.aggregate();
    let status = match overall {
        Health::Healthy | Health::Degraded => StatusCode::OK,
        Health::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = json!({
        "status": overall,
        "crawler_id": state.crawler_id,
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "components": state.health.snapshot(),
        "held_leases": state.lease.held_count(),
    });
    (status, Json(body))
}

async fn metrics(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let mut queue_depths = serde_json::Map::new();
    for queue in [
        QueueName::Discovery,
        QueueName::Crawl,
        QueueName::Indexing,
        QueueName::DeadLetter,
    ] {
        if let Ok(depth) = state.queue.depth(queue).await {
            queue_depths.insert(
                queue.as_str().to_string(),
                serde_json::to_value(depth).unwrap_or_default(),
            );
        }
    }

    Json(json!({
        "worker": state.stats.snapshot(state.started_at),
        "concurrency": state.concurrency.stats(),
        "leases": state.lease.stats(),
        "queues": queue_depths,
    }))
}

/// Serve the endpoint until the shutdown signal fires.
pub fn spawn(
    port: u16,
    state: Arc<ServerState>,
    shutdown: &broadcast::Sender<()>,
) -> JoinHandle<()> {
    let mut shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let app = router(state);
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(port, "failed to bind health endpoint: {}", e);
                return;
            }
        };
        info!(port, "health endpoint listening");
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        });
        if let Err(e) = serve.await {
            error!("health endpoint error: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_prefers_the_worst_status() {
        let health = ComponentHealth::new();
        assert_eq!(health.aggregate(), Health::Healthy);

        health.set("queue", Health::Healthy);
        health.set("state_store", Health::Degraded);
        assert_eq!(health.aggregate(), Health::Degraded);

        health.set("rate_limiter", Health::Unhealthy);
        assert_eq!(health.aggregate(), Health::Unhealthy);

        health.set("rate_limiter", Health::Healthy);
        assert_eq!(health.aggregate(), Health::Degraded);
    }
}
