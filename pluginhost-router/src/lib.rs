//! Service router: the host-mediated reverse proxy for plugin-to-plugin
//! calls. Everything under `/services/{service_type}/{provider_runtime_id}/`
//! is authenticated here, health-gated, and forwarded to the provider.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use dashmap::DashMap;
use pluginhost_handshake::HandshakeServer;
use pluginhost_lifecycle::LifecycleServer;
use pluginhost_registry::ServiceRegistry;

/// Headers stripped from the outbound (host -> provider) request because
/// they authenticate the caller to the *host*, not to the provider.
const STRIPPED_REQUEST_HEADERS: &[&str] = &["authorization", "x-plugin-runtime-id"];

/// Headers that must never be copied across a proxy hop (RFC 7230 §6.1),
/// in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared router state: everything needed to authenticate a caller, resolve
/// a provider's address, and gate on its health.
pub struct ServiceRouter {
    handshake: Arc<HandshakeServer>,
    registry: Arc<ServiceRegistry>,
    lifecycle: Arc<LifecycleServer>,
    /// `runtime_id -> base_url`, populated by the platform for managed
    /// plugins. Authoritative over a provider's `base_url` metadata.
    endpoint_table: DashMap<String, String>,
    /// Hosts an unmanaged provider's `base_url` metadata may point at.
    /// Empty (the default) disables unmanaged proxying entirely.
    unmanaged_base_url_allowlist: Vec<String>,
    client: reqwest::Client,
    proxy_timeout: Duration,
}

impl ServiceRouter {
    pub fn new(
        handshake: Arc<HandshakeServer>,
        registry: Arc<ServiceRegistry>,
        lifecycle: Arc<LifecycleServer>,
        unmanaged_base_url_allowlist: Vec<String>,
        proxy_timeout: Duration,
    ) -> Self {
        ServiceRouter {
            handshake,
            registry,
            lifecycle,
            endpoint_table: DashMap::new(),
            unmanaged_base_url_allowlist,
            client: reqwest::Client::new(),
            proxy_timeout,
        }
    }

    /// Record (or update) a managed plugin's base URL. Called by the
    /// platform after a successful launch.
    pub fn set_endpoint(&self, runtime_id: &str, base_url: &str) {
        self.endpoint_table.insert(runtime_id.to_string(), base_url.to_string());
    }

    pub fn remove_endpoint(&self, runtime_id: &str) {
        self.endpoint_table.remove(runtime_id);
    }

    fn resolve_base_url(&self, runtime_id: &str, metadata: &BTreeMap<String, String>) -> Option<String> {
        if let Some(url) = self.endpoint_table.get(runtime_id) {
            return Some(url.clone());
        }
        let candidate = metadata.get("base_url")?;
        let host = candidate
            .split("://")
            .nth(1)?
            .split(['/', ':'])
            .next()?;
        if self
            .unmanaged_base_url_allowlist
            .iter()
            .any(|allowed| allowed == host)
        {
            Some(candidate.clone())
        } else {
            None
        }
    }
}

/// Build the axum router mounting the proxy at `/services/*`.
pub fn router(state: Arc<ServiceRouter>) -> axum::Router {
    axum::Router::new()
        .route("/services/{service_type}/{runtime_id}/{*method}", any(proxy))
        .with_state(state)
}

async fn proxy(
    State(state): State<Arc<ServiceRouter>>,
    Path((service_type, runtime_id, method)): Path<(String, String, String)>,
    method_verb: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match proxy_inner(&state, service_type, runtime_id, method, method_verb, uri, headers, body).await {
        Ok(resp) => resp,
        Err(resp) => resp,
    }
}

#[allow(clippy::too_many_arguments)]
async fn proxy_inner(
    state: &ServiceRouter,
    service_type: String,
    runtime_id: String,
    method: String,
    method_verb: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Response> {
    let caller_runtime_id = headers
        .get("x-plugin-runtime-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing X-Plugin-Runtime-ID").into_response())?;
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing bearer token").into_response())?;

    if !state.handshake.validate_token(caller_runtime_id, token).await {
        return Err((StatusCode::UNAUTHORIZED, "invalid or expired token").into_response());
    }

    let provider = state
        .registry
        .provider(&service_type, &runtime_id)
        .await
        .ok_or_else(|| (StatusCode::NOT_FOUND, "unknown provider").into_response())?;

    let base_url = state
        .resolve_base_url(&runtime_id, &provider.metadata)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "provider has no resolvable endpoint").into_response())?;

    if !state.lifecycle.routes_traffic(&runtime_id) {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "provider is not traffic-eligible").into_response());
    }

    let target = format!(
        "{}{}{}",
        base_url.trim_end_matches('/'),
        provider.endpoint_path,
        method
    );
    let target = match uri.query() {
        Some(q) if !q.is_empty() => format!("{target}?{q}"),
        _ => target,
    };

    let mut outbound_headers = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if STRIPPED_REQUEST_HEADERS.contains(&lower.as_str()) || HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()) {
            if let Ok(value) = reqwest::header::HeaderValue::from_bytes(value.as_bytes()) {
                outbound_headers.append(name, value);
            }
        }
    }

    let started = tokio::time::Instant::now();
    let outbound = state
        .client
        .request(method_verb.clone(), &target)
        .headers(outbound_headers)
        .body(body)
        .timeout(state.proxy_timeout)
        .send()
        .await;

    let duration = started.elapsed();
    let outbound = match outbound {
        Ok(resp) => resp,
        Err(err) if err.is_timeout() => {
            tracing::warn!(
                caller = caller_runtime_id,
                provider = %runtime_id,
                method = %method_verb,
                duration_ms = duration.as_millis(),
                "proxy request timed out"
            );
            return Err((StatusCode::GATEWAY_TIMEOUT, "provider did not respond in time").into_response());
        }
        Err(err) => {
            tracing::warn!(
                caller = caller_runtime_id,
                provider = %runtime_id,
                method = %method_verb,
                error = %err,
                "proxy request failed"
            );
            return Err((StatusCode::BAD_GATEWAY, "provider unreachable").into_response());
        }
    };

    let status = outbound.status();
    tracing::info!(
        caller = caller_runtime_id,
        provider = %runtime_id,
        method = %method_verb,
        status = status.as_u16(),
        duration_ms = duration.as_millis(),
        "proxied plugin call"
    );

    let mut response_headers = HeaderMap::new();
    for (name, value) in outbound.headers().iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes()) {
            if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                response_headers.append(name, value);
            }
        }
    }

    let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body_stream = outbound.bytes_stream();
    let mut builder = Response::builder().status(status);
    if let Some(existing) = builder.headers_mut() {
        *existing = response_headers;
    }
    builder
        .body(Body::from_stream(body_stream))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pluginhost_core::RuntimeConfig;
    use pluginhost_handshake::{HandshakeRequest, HandshakeServer};
    use pluginhost_registry::RegisterServiceRequest;
    use std::collections::HashSet;

    async fn make_state() -> (Arc<ServiceRouter>, Arc<HandshakeServer>, Arc<ServiceRegistry>, Arc<LifecycleServer>) {
        let config = RuntimeConfig::default();
        let handshake = Arc::new(HandshakeServer::new(&config, 1, vec![], "test".into()));
        let lifecycle = Arc::new(LifecycleServer::new());
        let registry = ServiceRegistry::new(lifecycle.clone(), Duration::from_secs(3600), Duration::from_secs(90));
        let router = Arc::new(ServiceRouter::new(
            handshake.clone(),
            registry.clone(),
            lifecycle.clone(),
            vec![],
            Duration::from_secs(5),
        ));
        (router, handshake, registry, lifecycle)
    }

    #[tokio::test]
    async fn missing_auth_headers_are_unauthorized() {
        let (state, _h, _r, _l) = make_state().await;
        let resp = proxy_inner(
            &state,
            "cache".into(),
            "cache-r1".into(),
            "Get".into(),
            Method::POST,
            "/x".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let (state, handshake, _r, _l) = make_state().await;
        let identity = handshake
            .handshake(HandshakeRequest {
                core_protocol_version: 1,
                app_protocol_version: 1,
                magic_cookie_key: "PLUGINHOST_MAGIC_COOKIE_KEY".into(),
                magic_cookie_value: "pluginhost".into(),
                requested_plugins: vec![],
                self_id: "caller".into(),
                self_version: "1.0.0".into(),
            })
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-plugin-runtime-id", identity.runtime_id.parse().unwrap());
        headers.insert(
            "authorization",
            format!("Bearer {}", identity.runtime_token).parse().unwrap(),
        );

        let resp = proxy_inner(
            &state,
            "cache".into(),
            "cache-ghost".into(),
            "Get".into(),
            Method::POST,
            "/x".parse().unwrap(),
            headers,
            Bytes::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unhealthy_provider_is_unavailable() {
        let (state, handshake, registry, lifecycle) = make_state().await;
        let mut allowed = HashSet::new();
        allowed.insert("cache".to_string());
        registry.authorize("cache-r1", allowed);
        registry
            .register(
                "cache-r1",
                RegisterServiceRequest {
                    service_type: "cache".into(),
                    version: "1.0.0".into(),
                    endpoint_path: "/cache.v1.Cache/".into(),
                    metadata: BTreeMap::new(),
                },
            )
            .await
            .unwrap();
        let _ = lifecycle; // not reported healthy: Unspecified, not traffic-eligible
        state.set_endpoint("cache-r1", "http://127.0.0.1:1");

        let identity = handshake
            .handshake(HandshakeRequest {
                core_protocol_version: 1,
                app_protocol_version: 1,
                magic_cookie_key: "PLUGINHOST_MAGIC_COOKIE_KEY".into(),
                magic_cookie_value: "pluginhost".into(),
                requested_plugins: vec![],
                self_id: "caller".into(),
                self_version: "1.0.0".into(),
            })
            .await
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-plugin-runtime-id", identity.runtime_id.parse().unwrap());
        headers.insert(
            "authorization",
            format!("Bearer {}", identity.runtime_token).parse().unwrap(),
        );

        let resp = proxy_inner(
            &state,
            "cache".into(),
            "cache-r1".into(),
            "Get".into(),
            Method::POST,
            "/x".parse().unwrap(),
            headers,
            Bytes::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        registry.close();
    }
}
