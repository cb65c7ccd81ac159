//! Host facade: wires handshake, registry, lifecycle, router, broker, rate
//! limiter, and platform into the route table described in the system's
//! external interfaces, and exposes [`build_router`] so the binary entry
//! point and integration tests share one assembly path.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use pluginhost_broker::CapabilityBroker;
use pluginhost_core::health::HealthState;
use pluginhost_core::{RuntimeConfig, RuntimeError};
use pluginhost_handshake::{HandshakeRequest, HandshakeResponse, HandshakeServer};
use pluginhost_lifecycle::{LifecycleServer, ReportHealthRequest};
use pluginhost_platform::Platform;
use pluginhost_ratelimit::RateLimiter;
use pluginhost_registry::{
    DiscoverServiceRequest, DiscoverServiceResponse, RegisterServiceRequest, RegisterServiceResponse,
    ServiceRegistry,
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// The app-level protocol version negotiated at handshake. Distinct from
/// `RuntimeConfig::protocol_version`, which is the core wire-protocol
/// version; this one is specific to the application built on top of it.
const APP_PROTOCOL_VERSION: u32 = 1;

/// Everything a request handler needs, shared across the whole process.
pub struct AppState {
    pub handshake: Arc<HandshakeServer>,
    pub registry: Arc<ServiceRegistry>,
    pub lifecycle: Arc<LifecycleServer>,
    pub router: Arc<pluginhost_router::ServiceRouter>,
    pub broker: Arc<CapabilityBroker>,
    pub rate_limiter: RateLimiter,
    pub platform: Arc<Platform>,
}

impl AppState {
    /// Assemble the full component graph from one loaded [`RuntimeConfig`].
    pub fn new(config: &RuntimeConfig, supported_plugins: Vec<String>, server_metadata: String) -> Arc<Self> {
        let handshake = Arc::new(HandshakeServer::new(
            config,
            APP_PROTOCOL_VERSION,
            supported_plugins,
            server_metadata,
        ));
        let lifecycle = Arc::new(LifecycleServer::new());
        let registry = ServiceRegistry::new(lifecycle.clone(), config.sweep_interval, config.health_liveness_window);
        let router = Arc::new(pluginhost_router::ServiceRouter::new(
            handshake.clone(),
            registry.clone(),
            lifecycle.clone(),
            config.unmanaged_base_url_allowlist.clone(),
            Duration::from_secs(30),
        ));
        let broker = Arc::new(CapabilityBroker::new(config.capability_grant_ttl));
        let rate_limiter = RateLimiter::new(
            config.rate_limit_capacity,
            config.rate_limit_refill_per_sec,
            config.sweep_interval,
            Duration::from_secs(300),
        );
        let platform = Arc::new(Platform::new(
            handshake.clone(),
            registry.clone(),
            lifecycle.clone(),
            router.clone(),
            config.shutdown_grace,
        ));

        Arc::new(AppState {
            handshake,
            registry,
            lifecycle,
            router,
            broker,
            rate_limiter,
            platform,
        })
    }

    /// Stop every background sweeper owned by this state. Idempotent.
    pub fn close(&self) {
        self.registry.close();
        self.rate_limiter.close();
    }
}

/// Assemble the full route table: handshake, lifecycle, registry, broker,
/// the service-router proxy, and liveness/readiness probes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let proxy = pluginhost_router::router(state.router.clone());

    Router::new()
        .route("/handshake", post(handshake))
        .route("/lifecycle/report", post(report_health))
        .route("/lifecycle/health/{runtime_id}", get(get_health))
        .route("/registry/register", post(register_service))
        .route("/registry/unregister", post(unregister_service))
        .route("/registry/discover", post(discover_service))
        .route("/registry/watch/{service_type}", get(watch_service))
        .route("/broker/request", post(request_capability))
        .route("/capabilities/{capability_type}/{grant_id}/{*rest}", any(invoke_capability))
        .route("/healthz", get(|| async { StatusCode::OK }))
        .route("/readyz", get(|| async { StatusCode::OK }))
        .merge(proxy)
        .with_state(state)
}

fn caller_identity(headers: &HeaderMap) -> Result<(String, String), RuntimeError> {
    let runtime_id = headers
        .get("x-plugin-runtime-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RuntimeError::Unauthenticated("missing X-Plugin-Runtime-ID".into()))?
        .to_string();
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| RuntimeError::Unauthenticated("missing bearer token".into()))?
        .to_string();
    Ok((runtime_id, token))
}

/// Validate the caller's bearer token and charge its rate-limit bucket,
/// keyed by `runtime_id`. Every plugin->host RPC except `/handshake` itself
/// goes through this.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, RuntimeError> {
    let (runtime_id, token) = caller_identity(headers)?;
    if !state.rate_limiter.allow(&runtime_id) {
        return Err(RuntimeError::ResourceExhausted(format!(
            "rate limit exceeded for '{runtime_id}'"
        )));
    }
    if !state.handshake.validate_token(&runtime_id, &token).await {
        return Err(RuntimeError::Unauthenticated("invalid or expired token".into()));
    }
    Ok(runtime_id)
}

async fn handshake(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HandshakeRequest>,
) -> Result<Json<HandshakeResponse>, RuntimeError> {
    let resp = state.handshake.handshake(req).await?;
    Ok(Json(resp))
}

async fn report_health(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ReportHealthRequest>,
) -> Result<StatusCode, RuntimeError> {
    let runtime_id = authenticate(&state, &headers).await?;
    let transition = state.lifecycle.report_health(&runtime_id, req);
    if transition.changed() {
        state.registry.on_health_change(&runtime_id).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct HealthResponse {
    state: HealthState,
}

async fn get_health(State(state): State<Arc<AppState>>, Path(runtime_id): Path<String>) -> Json<HealthResponse> {
    Json(HealthResponse {
        state: state.lifecycle.get_health(&runtime_id),
    })
}

async fn register_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterServiceRequest>,
) -> Result<Json<RegisterServiceResponse>, RuntimeError> {
    let runtime_id = authenticate(&state, &headers).await?;
    let resp = state.registry.register(&runtime_id, req).await?;
    Ok(Json(resp))
}

#[derive(Deserialize)]
struct UnregisterServiceRequest {
    registration_id: String,
}

async fn unregister_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<UnregisterServiceRequest>,
) -> Result<StatusCode, RuntimeError> {
    let runtime_id = authenticate(&state, &headers).await?;
    state.registry.unregister(&runtime_id, &req.registration_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn discover_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<DiscoverServiceRequest>,
) -> Result<Json<DiscoverServiceResponse>, RuntimeError> {
    authenticate(&state, &headers).await?;
    let resp = state.registry.discover(req).await?;
    Ok(Json(resp))
}

async fn watch_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(service_type): Path<String>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>>, RuntimeError> {
    authenticate(&state, &headers).await?;
    let handle = state.registry.watch(&service_type).await;
    let stream = ReceiverStream::new(handle.events).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().event("watch").data(data))
    });
    Ok(Sse::new(stream))
}

#[derive(Deserialize)]
struct RequestCapabilityRequest {
    capability_type: String,
}

#[derive(Serialize)]
struct CapabilityGrantResponseDto {
    grant_id: String,
    bearer_token: String,
    invoke_url: String,
}

impl From<pluginhost_broker::CapabilityGrantResponse> for CapabilityGrantResponseDto {
    fn from(grant: pluginhost_broker::CapabilityGrantResponse) -> Self {
        CapabilityGrantResponseDto {
            grant_id: grant.grant_id,
            bearer_token: grant.bearer_token,
            invoke_url: grant.invoke_url,
        }
    }
}

async fn request_capability(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RequestCapabilityRequest>,
) -> Result<Json<CapabilityGrantResponseDto>, RuntimeError> {
    let runtime_id = authenticate(&state, &headers).await?;
    let grant = state.broker.request_capability(&runtime_id, &req.capability_type).await?;
    Ok(Json(grant.into()))
}

async fn invoke_capability(
    State(state): State<Arc<AppState>>,
    Path((_capability_type, grant_id, _rest)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let token = match headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        Some(token) => token,
        None => return RuntimeError::Unauthenticated("missing bearer token".into()).into_response(),
    };
    match state.broker.invoke(&grant_id, token, &body).await {
        Ok(out) => out.into_response(),
        Err(err) => err.into_response(),
    }
}
