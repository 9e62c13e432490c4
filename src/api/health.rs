/// Health check endpoints
use crate::{
    context::AppContext,
    error::{TroveError, TroveResult},
};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::future::Future;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Build health routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(liveness))
}

/// Overall health report
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub checks: HealthChecks,
    /// Seconds since startup
    pub uptime: u64,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub storage: ComponentHealth,
}

/// Result of probing one dependency
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn is_healthy(&self) -> bool {
        self.status == "ok"
    }
}

/// Liveness probe: the process answers
async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Probe the database and the blob backend; `503` if either fails
pub async fn health(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthStatus>) {
    let cancel = CancellationToken::new();
    let (database, storage) = tokio::join!(
        probe(ctx.store.ping()),
        probe(async {
            ctx.backend.health(&cancel).await?;
            Ok::<(), TroveError>(())
        }),
    );

    let checks = HealthChecks { database, storage };
    let healthy = checks.database.is_healthy() && checks.storage.is_healthy();
    if !healthy {
        tracing::warn!(
            database = %checks.database.status,
            storage = %checks.storage.status,
            "health_check_degraded"
        );
    }

    let status = HealthStatus {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        checks,
        uptime: ctx.uptime_secs(),
        version: ctx.config.service.version.clone(),
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

async fn probe<F>(check: F) -> ComponentHealth
where
    F: Future<Output = TroveResult<()>>,
{
    let start = Instant::now();
    let result = check.await;
    let response_time_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(()) => ComponentHealth {
            status: "ok".to_string(),
            response_time_ms,
            error: None,
        },
        Err(e) => ComponentHealth {
            status: "error".to_string(),
            response_time_ms,
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_reports_errors() {
        let ok = probe(async { Ok::<(), TroveError>(()) }).await;
        assert!(ok.is_healthy());
        assert!(ok.error.is_none());

        let failed = probe(async { Err::<(), _>(TroveError::BackendUnavailable("down".into())) }).await;
        assert!(!failed.is_healthy());
        assert_eq!(failed.status, "error");
        assert!(failed.error.unwrap().contains("down"));
    }

    #[test]
    fn test_health_status_serialization() {
        let health = HealthStatus {
            status: "ok".to_string(),
            checks: HealthChecks {
                database: ComponentHealth {
                    status: "ok".to_string(),
                    response_time_ms: 1,
                    error: None,
                },
                storage: ComponentHealth {
                    status: "ok".to_string(),
                    response_time_ms: 2,
                    error: None,
                },
            },
            uptime: 42,
            version: "0.1.0".to_string(),
        };

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["checks"]["database"]["status"], "ok");
        assert_eq!(json["checks"]["storage"]["response_time_ms"], 2);
        assert_eq!(json["uptime"], 42);
        assert!(json["checks"]["database"].get("error").is_none());
    }
}
