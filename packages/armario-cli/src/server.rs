//! HTTP gateway between the web application and the lockers

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use armario_core::scanner::probe_target;
use armario_core::{
    AnnouncementListener, ControlError, DeviceScanner, ListenerState, LockerAction, LockerClient,
    ProbeResponse, ScanRequest,
};
use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// State shared across handlers
pub struct GatewayState {
    pub scanner: DeviceScanner,
    pub lockers: LockerClient,
    pub listener: Option<Arc<AnnouncementListener>>,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Discovery
        .route("/api/scan-network", get(scan_network_handler))
        .route("/api/test-device", get(test_device_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/devices/announce", post(announce_handler))
        // Locker commands
        .route("/api/esp32/{ip}/status", get(status_handler))
        .route("/api/esp32/{ip}/{action}", post(command_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Run the gateway until `shutdown_signal` resolves.
pub async fn serve(
    bind: &str,
    state: Arc<GatewayState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind gateway on {}", bind))?;
    tracing::info!("Gateway listening on {}", bind);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Gateway server error")?;

    tracing::info!("Gateway stopped");
    Ok(())
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let listener = state
        .listener
        .as_ref()
        .map(|l| l.state())
        .unwrap_or(ListenerState::Unbound);

    Json(json!({
        "status": "healthy",
        "service": "armario",
        "version": env!("CARGO_PKG_VERSION"),
        "listener": listener,
    }))
}

#[derive(Debug, Deserialize)]
struct ScanQuery {
    prefix: Option<String>,
}

async fn scan_network_handler(
    State(state): State<Arc<GatewayState>>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    Query(query): Query<ScanQuery>,
) -> impl IntoResponse {
    let peer = connect_info.map(|Extension(ConnectInfo(addr))| addr);
    let request = ScanRequest {
        prefix: query.prefix.filter(|p| !p.trim().is_empty()),
        client_address: client_address(&headers, peer),
    };

    let response = state.scanner.scan_network(&request).await;
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(response))
}

/// Caller address: proxy headers first, then the socket peer.
fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    ["x-forwarded-for", "x-real-ip"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .find(|value| !value.trim().is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

#[derive(Debug, Deserialize)]
struct TestDeviceQuery {
    ip: Option<String>,
}

async fn test_device_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<TestDeviceQuery>,
) -> Response {
    let Some(ip) = query.ip.filter(|ip| !ip.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ProbeResponse {
                success: false,
                device: None,
                ip: String::new(),
                error: Some("ip query parameter is required".to_string()),
                message: None,
            }),
        )
            .into_response();
    };

    // Off-LAN or unparsable targets are refused without touching the network
    let status = match probe_target(&ip) {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::BAD_REQUEST,
    };
    (status, Json(state.scanner.probe_one(&ip).await)).into_response()
}

async fn devices_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    match &state.listener {
        Some(listener) => {
            let devices = listener.snapshot().await;
            Json(json!({
                "success": true,
                "listener": listener.state(),
                "total": devices.len(),
                "devices": devices,
            }))
        }
        None => Json(json!({
            "success": true,
            "listener": ListenerState::Unbound,
            "total": 0,
            "devices": [],
        })),
    }
}

async fn announce_handler(State(state): State<Arc<GatewayState>>) -> Response {
    let Some(listener) = &state.listener else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "success": false, "error": "announcement listener is disabled" })),
        )
            .into_response();
    };

    match listener.request_announcements().await {
        Ok(_) => Json(json!({
            "success": true,
            "message": "Discovery request broadcast",
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn status_handler(
    State(state): State<Arc<GatewayState>>,
    Path(ip): Path<String>,
) -> Response {
    forward(&state, &ip, LockerAction::Status, None).await
}

async fn command_handler(
    State(state): State<Arc<GatewayState>>,
    Path((ip, action)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let action = match action.parse::<LockerAction>() {
        Ok(action) => action,
        Err(e) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "success": false, "error": e })),
            )
                .into_response();
        }
    };

    let body: Option<Value> = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => Some(value),
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "success": false, "error": format!("invalid JSON body: {}", e) })),
                )
                    .into_response();
            }
        }
    };

    forward(&state, &ip, action, body.as_ref()).await
}

async fn forward(
    state: &GatewayState,
    ip: &str,
    action: LockerAction,
    body: Option<&Value>,
) -> Response {
    match state.lockers.send(ip, action, body).await {
        Ok(reply) => Json(json!({
            "success": true,
            "ip": ip,
            "action": action.to_string(),
            "response": reply,
        }))
        .into_response(),
        Err(e) => control_error_response(ip, action, e),
    }
}

fn control_error_response(ip: &str, action: LockerAction, error: ControlError) -> Response {
    let status = match &error {
        ControlError::InvalidAddress(_) | ControlError::NotLocal(_) => StatusCode::BAD_REQUEST,
        ControlError::Timeout { .. } | ControlError::Unreachable { .. } => StatusCode::BAD_GATEWAY,
        ControlError::Status { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        ControlError::Client(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let details = match &error {
        ControlError::Status { body, .. } => body.clone(),
        _ => Value::Null,
    };

    tracing::debug!("{} on {} failed: {}", action, ip, error);

    (
        status,
        Json(json!({
            "success": false,
            "ip": ip,
            "action": action.to_string(),
            "error": error.to_string(),
            "details": details,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use armario_core::config::{ControlConfig, ScanConfig};
    use axum::body::{Body, to_bytes};
    use axum::http::{HeaderValue, Request};
    use tower::ServiceExt;

    fn test_state() -> Arc<GatewayState> {
        Arc::new(GatewayState {
            scanner: DeviceScanner::new(ScanConfig::default()).unwrap(),
            lockers: LockerClient::new(&ControlConfig::default()).unwrap(),
            listener: None,
        })
    }

    async fn call(request: Request<Body>) -> (StatusCode, Value) {
        let response = router(test_state()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["listener"], "unbound");
    }

    #[tokio::test]
    async fn test_test_device_requires_ip() {
        let (status, body) = call(get_request("/api/test-device")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_test_device_invalid_ip() {
        let (status, body) = call(get_request("/api/test-device?ip=not-an-ip")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["ip"], "not-an-ip");
    }

    #[tokio::test]
    async fn test_scan_rejects_bad_prefix() {
        let (status, body) = call(get_request("/api/scan-network?prefix=1.2")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["totalScanned"], 0);
    }

    #[tokio::test]
    async fn test_test_device_refuses_public_address() {
        let (status, body) = call(get_request("/api/test-device?ip=203.0.113.9")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("not a local network address"));
    }

    #[tokio::test]
    async fn test_scan_refuses_public_prefix() {
        for uri in ["/api/scan-network?prefix=8.8.8", "/api/scan-network?prefix=8.8.8.0/24"] {
            let (status, body) = call(get_request(uri)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(body["success"], false);
            assert_eq!(body["totalScanned"], 0);
        }
    }

    #[tokio::test]
    async fn test_devices_without_listener() {
        let (status, body) = call(get_request("/api/devices")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);
        assert_eq!(body["listener"], "unbound");
    }

    #[tokio::test]
    async fn test_announce_without_listener() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/devices/announce")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_proxy_refuses_public_address() {
        let (status, body) = call(get_request("/api/esp32/8.8.8.8/status")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["action"], "status");
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/esp32/192.168.1.10/explodir")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_command_rejects_malformed_body() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/esp32/192.168.1.10/abrir")
            .body(Body::from("{porta"))
            .unwrap();
        let (status, body) = call(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid JSON"));
    }

    #[test]
    fn test_client_address_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.5, 172.16.0.1"));
        let peer: SocketAddr = "127.0.0.1:51000".parse().unwrap();

        assert_eq!(
            client_address(&headers, Some(peer)),
            Some("10.0.0.5, 172.16.0.1".to_string())
        );
        assert_eq!(
            client_address(&HeaderMap::new(), Some(peer)),
            Some("127.0.0.1".to_string())
        );
        assert_eq!(client_address(&HeaderMap::new(), None), None);
    }
}
