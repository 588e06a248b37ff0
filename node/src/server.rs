//! Prometheus `/metrics` endpoint served while a settlement run is in progress.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{error, info};

struct MetricsState {
    registry: Registry,
    auth_token: Option<String>,
}

/// Bearer token from `METRICS_AUTH_TOKEN`, if set and non-blank.
pub fn metrics_auth_token() -> Option<String> {
    let token = std::env::var("METRICS_AUTH_TOKEN").ok()?;
    let trimmed = token.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Accept the request when no token is configured, or when it presents the token as
/// `Authorization: Bearer` or `x-metrics-token`.
pub fn authorize_metrics(headers: &HeaderMap, token: Option<&str>) -> Result<(), StatusCode> {
    if let Some(token) = token {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        let header_token = headers
            .get("x-metrics-token")
            .and_then(|value| value.to_str().ok());

        if bearer != Some(token) && header_token != Some(token) {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    Ok(())
}

async fn metrics_handler(
    State(state): State<Arc<MetricsState>>,
    headers: HeaderMap,
) -> Result<Response<Body>, StatusCode> {
    authorize_metrics(&headers, state.auth_token.as_deref())?;

    let mut body = String::new();
    encode(&mut body, &state.registry).map_err(|err| {
        error!("metrics encoding failed: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(Body::from(body))
        .map_err(|err| {
            error!("metrics response build failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

pub fn router(registry: Registry, auth_token: Option<String>) -> Router {
    let state = Arc::new(MetricsState {
        registry,
        auth_token,
    });
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Bind `addr` and serve `registry` until the returned task is aborted.
pub async fn spawn_metrics_server(
    addr: SocketAddr,
    registry: Registry,
    auth_token: Option<String>,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let app = router(registry, auth_token);
    let handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            error!("metrics server failed on {local_addr}: {err}");
        }
    });
    info!(%local_addr, "serving metrics");
    Ok((local_addr, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use prizeline_settlement::SettlementMetrics;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get_metrics(addr: SocketAddr, extra_header: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /metrics HTTP/1.1\r\nHost: localhost\r\n{extra_header}Connection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn token_is_checked_when_configured() {
        let mut headers = HeaderMap::new();
        assert!(authorize_metrics(&headers, None).is_ok());
        assert_eq!(
            authorize_metrics(&headers, Some("secret")),
            Err(StatusCode::UNAUTHORIZED)
        );

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(authorize_metrics(&headers, Some("secret")).is_err());
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer secret"),
        );
        assert!(authorize_metrics(&headers, Some("secret")).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("x-metrics-token", HeaderValue::from_static("secret"));
        assert!(authorize_metrics(&headers, Some("secret")).is_ok());
    }

    #[tokio::test]
    async fn serves_settlement_counters() {
        let mut registry = Registry::default();
        let metrics = SettlementMetrics::register(&mut registry);
        metrics.succeeded.inc();

        let (addr, handle) = spawn_metrics_server(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            registry,
            Some("secret".to_string()),
        )
        .await
        .unwrap();

        let denied = get_metrics(addr, "").await;
        assert!(denied.starts_with("HTTP/1.1 401"), "{denied}");

        let allowed = get_metrics(addr, "Authorization: Bearer secret\r\n").await;
        assert!(allowed.starts_with("HTTP/1.1 200"), "{allowed}");
        assert!(allowed.contains("settlement_payouts_succeeded_total 1"));

        handle.abort();
    }
}
