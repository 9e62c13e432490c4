/// HTTP server setup and routing
use crate::{
    auth::{client_ip, CSRF_HEADER},
    config::IpCidr,
    context::AppContext,
    error::{TroveError, TroveResult},
};
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderName, HeaderValue, Method, Request, StatusCode},
    response::Json,
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Build the main application router
/// Returns Router<()> because state is already provided
pub fn build_router(ctx: AppContext) -> Router {
    let cors = cors_layer(&ctx.config.http.cors_allowed_origins);
    let trusted: Arc<[IpCidr]> = ctx.config.http.trusted_proxies.clone().into();

    // Every request span carries the request id and the real client address
    let trace = TraceLayer::new_for_http().make_span_with(move |request: &Request<Body>| {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let client = client_ip(request.headers(), peer, &trusted)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".to_string());

        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
            client_ip = %client,
        )
    });

    Router::new()
        .merge(crate::api::routes())
        .fallback(not_found)
        // Provide state - converts Router<AppContext> to Router<()>
        .with_state(ctx)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(trace)
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(cors),
        )
}

/// CORS policy from the configured origins; `*` allows any origin without credentials
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(CSRF_HEADER),
        ]);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(AllowOrigin::any());
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    if allowed.is_empty() {
        layer
    } else {
        layer
            .allow_origin(AllowOrigin::list(allowed))
            .allow_credentials(true)
    }
}

/// 404 handler
async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "NotFound",
            "message": "Endpoint not found"
        })),
    )
}

/// Start the HTTP server and run until `shutdown` is cancelled
pub async fn serve(ctx: AppContext, shutdown: CancellationToken) -> TroveResult<()> {
    let addr = format!("{}:{}", ctx.config.service.host, ctx.config.service.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TroveError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    info!("Trove listening on {}", addr);
    info!(
        "   Blob backend: {}, environment: {:?}",
        ctx.backend.name(),
        ctx.config.service.environment
    );

    let app = build_router(ctx);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .map_err(|e| TroveError::Internal(format!("Server error: {}", e)))?;

    info!("HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryBlobBackend;
    use crate::config::ServerConfig;
    use crate::db::MetadataStore;
    use tower::ServiceExt;

    async fn router() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::in_memory().await.unwrap();
        let ctx = AppContext::from_parts(
            ServerConfig::for_testing(dir.path()),
            store,
            Arc::new(MemoryBlobBackend::new()),
        );
        (build_router(ctx), dir)
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404_with_request_id() {
        let (app, _dir) = router().await;
        let response = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn test_health_reports_ok() {
        let (app, _dir) = router().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_cors_origin_parsing_skips_garbage() {
        // Must not panic on values that are not valid header values
        let _ = cors_layer(&["https://files.example.com".to_string(), "bad\norigin".to_string()]);
        let _ = cors_layer(&["*".to_string()]);
        let _ = cors_layer(&[]);
    }
}
