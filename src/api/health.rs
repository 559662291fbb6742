/// Health check endpoints for liveness and readiness checks
///
/// Readiness depends on the identity store: in snapshot mode the service is
/// not ready until the first snapshot has loaded.

use crate::{context::AppContext, error::ResolverError, metrics};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Health status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall status: "healthy" or "unhealthy"
    pub status: String,

    /// Application version
    pub version: String,

    /// Uptime in seconds
    pub uptime_seconds: f64,

    /// Individual component checks
    pub checks: Vec<ComponentHealth>,
}

/// Health status of individual component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Build health check routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health_basic))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/health/detailed", get(health_detailed))
        .route("/metrics", get(metrics_endpoint))
}

/// Basic health check
pub async fn health_basic() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Liveness: if we can respond, we're alive
pub async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness: 503 until the identity store can serve lookups
pub async fn readiness(
    State(ctx): State<AppContext>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if let Err(e) = ctx.directory.health_check().await {
        tracing::warn!(error = %e, "readiness_failed: identity store check failed");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(serde_json::json!({
        "status": "ready",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

/// Detailed health check with all component statuses
pub async fn health_detailed(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthStatus>) {
    let mut checks = vec![check_directory_detailed(&ctx).await];
    if ctx.snapshot.is_some() {
        checks.push(check_snapshot_detailed(&ctx).await);
    }

    let healthy = checks.iter().all(|c| c.status == "healthy");
    let health = HealthStatus {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: ctx.started_at.elapsed().as_secs_f64(),
        checks,
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Prometheus scrape endpoint
pub async fn metrics_endpoint() -> Result<Response, ResolverError> {
    let body = metrics::render_metrics()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

async fn check_directory_detailed(ctx: &AppContext) -> ComponentHealth {
    let start = Instant::now();
    let result = ctx.directory.health_check().await;
    let response_time_ms = Some(start.elapsed().as_millis() as u64);

    match result {
        Ok(()) => ComponentHealth {
            name: "identity_store".to_string(),
            status: "healthy".to_string(),
            response_time_ms,
            error: None,
            details: Some(serde_json::json!({
                "mode": ctx.config.storage.directory_mode,
            })),
        },
        Err(e) => ComponentHealth {
            name: "identity_store".to_string(),
            status: "unhealthy".to_string(),
            response_time_ms,
            error: Some(e.to_string()),
            details: None,
        },
    }
}

async fn check_snapshot_detailed(ctx: &AppContext) -> ComponentHealth {
    let current = match &ctx.snapshot {
        Some(snapshot) => snapshot.current().await,
        None => None,
    };

    match current {
        Some(snapshot) => ComponentHealth {
            name: "snapshot".to_string(),
            status: "healthy".to_string(),
            response_time_ms: None,
            error: None,
            details: Some(serde_json::json!({
                "entries": snapshot.index.len(),
                "groups": snapshot.index.group_count(),
                "loaded_at": snapshot.loaded_at.to_rfc3339(),
            })),
        },
        None => ComponentHealth {
            name: "snapshot".to_string(),
            status: "unhealthy".to_string(),
            response_time_ms: None,
            error: Some("snapshot not loaded".to_string()),
            details: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::test_config, directory::DirectoryIndex};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_detailed_health_with_index() {
        let ctx = AppContext::with_directory(test_config(), Arc::new(DirectoryIndex::default()));

        let (status, Json(health)) = health_detailed(State(ctx)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health.status, "healthy");
        assert_eq!(health.checks.len(), 1);
        assert_eq!(health.checks[0].name, "identity_store");
    }

    #[test]
    fn test_health_status_serialization() {
        let health = HealthStatus {
            status: "healthy".to_string(),
            version: "0.1.0".to_string(),
            uptime_seconds: 12.5,
            checks: vec![ComponentHealth {
                name: "identity_store".to_string(),
                status: "healthy".to_string(),
                response_time_ms: Some(1),
                error: None,
                details: None,
            }],
        };

        let json = serde_json::to_string(&health).unwrap();
        assert!(json.contains("identity_store"));
        assert!(!json.contains("error"));
    }
}
