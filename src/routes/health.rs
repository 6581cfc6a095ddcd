use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub redis: ComponentHealth,
    pub queue_depth: Option<u64>,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn ok(latency: std::time::Duration) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms: Some(latency.as_millis() as u64),
        }
    }

    fn error() -> Self {
        Self {
            status: "error".to_string(),
            latency_ms: None,
        }
    }
}

/// GET /health: dependency status plus the current invitation backlog.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let db_check = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => ComponentHealth::ok(start.elapsed()),
        Err(e) => {
            tracing::warn!(error = %e, "Database health check failed");
            ComponentHealth::error()
        }
    };

    let redis_start = std::time::Instant::now();
    let redis_check = match state.queue.health_check().await {
        Ok(_) => ComponentHealth::ok(redis_start.elapsed()),
        Err(e) => {
            tracing::warn!(error = %e, "Redis health check failed");
            ComponentHealth::error()
        }
    };

    let queue_depth = state.queue.depth().await.ok();
    if let Some(depth) = queue_depth {
        metrics::gauge!("invite_queue_depth").set(depth as f64);
    }

    let all_healthy = db_check.status == "ok" && redis_check.status == "ok";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            redis: redis_check,
            queue_depth,
        },
    };

    (status_code, Json(response))
}
