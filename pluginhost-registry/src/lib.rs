//! Multi-provider service registry: registration, health-filtered discovery,
//! selection strategies, and a watch-based change stream.
//!
//! The registry also runs the health-liveness eviction sweep described in
//! the design's resolution of "unmanaged deregistration": a `runtime_id`
//! whose lifecycle record has gone stale has its registrations dropped as
//! if it had called `UnregisterService` for each of them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use pluginhost_core::health::{aggregate_availability, AggregateAvailability, HealthState};
use pluginhost_core::{validate_endpoint_path, validate_metadata, validate_service_type, RuntimeError};
use pluginhost_lifecycle::LifecycleServer;
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

const WATCH_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    First,
    RoundRobin,
    Random,
    Weighted,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::First
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderRecord {
    pub registration_id: String,
    pub runtime_id: String,
    pub service_type: String,
    pub version: String,
    pub endpoint_path: String,
    pub metadata: BTreeMap<String, String>,
    pub registered_at_unix: u64,
    #[serde(skip)]
    parsed_version: Version,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterServiceRequest {
    pub service_type: String,
    pub version: String,
    pub endpoint_path: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterServiceResponse {
    pub registration_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverServiceRequest {
    pub service_type: String,
    pub min_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceEndpoint {
    pub provider_runtime_id: String,
    pub version: String,
    pub endpoint_url: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoverServiceResponse {
    pub endpoint: ServiceEndpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    Unspecified,
    Available,
    Unavailable,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchEvent {
    pub service_type: String,
    pub state: WatchState,
    pub endpoint: Option<ServiceEndpoint>,
}

struct Watcher {
    tx: mpsc::Sender<WatchEvent>,
    dropped: Arc<AtomicU64>,
}

/// A live watch subscription: the event half plus the running count of
/// events this watcher has had dropped due to a full buffer.
pub struct WatchHandle {
    pub events: mpsc::Receiver<WatchEvent>,
    pub dropped: Arc<AtomicU64>,
}

struct TypeState {
    providers: Vec<ProviderRecord>,
    strategy: SelectionStrategy,
    round_robin: AtomicU64,
    watchers: Vec<Watcher>,
    /// Set by `ReplacePlugin`'s atomic pointer flip (§4.5): when present and
    /// still eligible, this `runtime_id` is selected regardless of
    /// `strategy`, so traffic moves from the old instance to the new one in
    /// one write-lock-protected step instead of racing the selection rule.
    pinned: Option<String>,
}

impl TypeState {
    fn new() -> Self {
        TypeState {
            providers: Vec::new(),
            strategy: SelectionStrategy::default(),
            round_robin: AtomicU64::new(0),
            watchers: Vec::new(),
            pinned: None,
        }
    }
}

/// Process-wide service registry. Construction spawns the liveness eviction
/// sweeper, stopped via [`ServiceRegistry::close`].
pub struct ServiceRegistry {
    types: RwLock<HashMap<String, TypeState>>,
    registration_index: DashMap<String, String>,
    allowed_services: DashMap<String, HashSet<String>>,
    runtime_service_types: DashMap<String, HashSet<String>>,
    lifecycle: Arc<LifecycleServer>,
    cancel: CancellationToken,
}

impl ServiceRegistry {
    pub fn new(
        lifecycle: Arc<LifecycleServer>,
        sweep_interval: Duration,
        liveness_window: Duration,
    ) -> Arc<Self> {
        let registry = Arc::new(ServiceRegistry {
            types: RwLock::new(HashMap::new()),
            registration_index: DashMap::new(),
            allowed_services: DashMap::new(),
            runtime_service_types: DashMap::new(),
            lifecycle,
            cancel: CancellationToken::new(),
        });

        let sweep_registry = registry.clone();
        let sweep_cancel = registry.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        sweep_registry.sweep_stale_runtimes(liveness_window).await;
                    }
                }
            }
        });

        registry
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Record the set of `service_type`s a `runtime_id` is permitted to
    /// register (exactly its declared `provides` types).
    pub fn authorize(&self, runtime_id: &str, allowed_types: HashSet<String>) {
        self.allowed_services.insert(runtime_id.to_string(), allowed_types);
    }

    pub fn deauthorize(&self, runtime_id: &str) {
        self.allowed_services.remove(runtime_id);
    }

    /// `ReplacePlugin`'s atomic pointer flip: force every subsequent
    /// `discover` of `service_type` to the given `runtime_id` (provided it
    /// stays eligible), and notify watchers of the resulting endpoint.
    pub async fn pin_provider(&self, service_type: &str, runtime_id: &str) {
        {
            let mut types = self.types.write().await;
            let state = types.entry(service_type.to_string()).or_insert_with(TypeState::new);
            state.pinned = Some(runtime_id.to_string());
        }
        self.notify_watchers(service_type).await;
    }

    pub async fn unpin_provider(&self, service_type: &str) {
        let mut types = self.types.write().await;
        if let Some(state) = types.get_mut(service_type) {
            state.pinned = None;
        }
    }

    pub async fn register(
        &self,
        runtime_id: &str,
        req: RegisterServiceRequest,
    ) -> Result<RegisterServiceResponse, RuntimeError> {
        validate_service_type(&req.service_type)?;
        let parsed_version = pluginhost_core::validation::validate_version(&req.version)?;
        validate_endpoint_path(&req.endpoint_path)?;
        validate_metadata(&req.metadata)?;

        match self.allowed_services.get(runtime_id) {
            None => {
                return Err(RuntimeError::PermissionDenied(format!(
                    "unknown runtime_id '{runtime_id}'"
                )))
            }
            Some(allowed) => {
                if !allowed.contains(&req.service_type) {
                    return Err(RuntimeError::PermissionDenied(format!(
                        "runtime_id '{runtime_id}' is not authorized for service_type '{}'",
                        req.service_type
                    )));
                }
            }
        }

        let registration_id = pluginhost_crypto::random_id()?;
        let record = ProviderRecord {
            registration_id: registration_id.clone(),
            runtime_id: runtime_id.to_string(),
            service_type: req.service_type.clone(),
            version: req.version.clone(),
            endpoint_path: req.endpoint_path,
            metadata: req.metadata,
            registered_at_unix: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            parsed_version,
        };

        {
            let mut types = self.types.write().await;
            let state = types.entry(req.service_type.clone()).or_insert_with(TypeState::new);
            state.providers.push(record);
        }
        self.registration_index.insert(registration_id.clone(), req.service_type.clone());
        self.runtime_service_types
            .entry(runtime_id.to_string())
            .or_default()
            .insert(req.service_type.clone());

        self.notify_watchers(&req.service_type).await;

        Ok(RegisterServiceResponse { registration_id })
    }

    pub async fn unregister(&self, runtime_id: &str, registration_id: &str) -> Result<(), RuntimeError> {
        let service_type = self
            .registration_index
            .get(registration_id)
            .map(|r| r.clone())
            .ok_or_else(|| RuntimeError::NotFound(format!("unknown registration '{registration_id}'")))?;

        {
            let mut types = self.types.write().await;
            if let Some(state) = types.get_mut(&service_type) {
                match state.providers.iter().find(|p| p.registration_id == registration_id) {
                    Some(p) if p.runtime_id != runtime_id => {
                        return Err(RuntimeError::PermissionDenied(
                            "only the owning runtime may unregister this provider".into(),
                        ));
                    }
                    Some(_) => {
                        state.providers.retain(|p| p.registration_id != registration_id);
                    }
                    None => {}
                }
            }
        }
        self.registration_index.remove(registration_id);
        self.notify_watchers(&service_type).await;
        Ok(())
    }

    /// Look up one provider by `(service_type, runtime_id)` regardless of
    /// health state — used by the router, which applies its own health gate
    /// after the lookup so it can return a distinct 503 rather than 404.
    pub async fn provider(&self, service_type: &str, runtime_id: &str) -> Option<ProviderRecord> {
        let types = self.types.read().await;
        types
            .get(service_type)?
            .providers
            .iter()
            .find(|p| p.runtime_id == runtime_id)
            .cloned()
    }

    pub async fn discover(
        &self,
        req: DiscoverServiceRequest,
    ) -> Result<DiscoverServiceResponse, RuntimeError> {
        validate_service_type(&req.service_type)?;
        let min_version = pluginhost_core::validation::validate_version(&req.min_version)?;

        let types = self.types.read().await;
        let state = types
            .get(&req.service_type)
            .ok_or_else(|| RuntimeError::NotFound(format!("no provider for '{}'", req.service_type)))?;

        let eligible: Vec<&ProviderRecord> = state
            .providers
            .iter()
            .filter(|p| p.parsed_version >= min_version)
            .filter(|p| self.lifecycle.routes_traffic(&p.runtime_id))
            .collect();

        if eligible.is_empty() {
            return Err(RuntimeError::NotFound(format!(
                "no eligible provider for '{}'",
                req.service_type
            )));
        }

        let chosen = self.select(state, &eligible);
        Ok(DiscoverServiceResponse {
            endpoint: to_endpoint(chosen),
        })
    }

    fn select<'a>(
        &self,
        state: &TypeState,
        eligible: &[&'a ProviderRecord],
    ) -> &'a ProviderRecord {
        if let Some(pinned) = &state.pinned {
            if let Some(provider) = eligible.iter().find(|p| &p.runtime_id == pinned) {
                return provider;
            }
        }
        match state.strategy {
            SelectionStrategy::First => eligible[0],
            SelectionStrategy::RoundRobin => {
                let len = eligible.len() as u64;
                let n = state.round_robin.fetch_add(1, Ordering::Relaxed);
                let idx = ((n % len) + len) % len;
                eligible[idx as usize]
            }
            SelectionStrategy::Random => {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..eligible.len());
                eligible[idx]
            }
            SelectionStrategy::Weighted => {
                use rand::Rng;
                let weights: Vec<f64> = eligible
                    .iter()
                    .map(|p| {
                        p.metadata
                            .get("weight")
                            .and_then(|w| w.parse::<f64>().ok())
                            .unwrap_or(1.0)
                            .max(0.0)
                    })
                    .collect();
                let total: f64 = weights.iter().sum();
                if total <= 0.0 {
                    return eligible[0];
                }
                let mut pick = rand::thread_rng().gen_range(0.0..total);
                for (p, w) in eligible.iter().zip(weights.iter()) {
                    if pick < *w {
                        return p;
                    }
                    pick -= w;
                }
                eligible[eligible.len() - 1]
            }
        }
    }

    /// Subscribe to change events for `service_type`. Sends an initial event
    /// reflecting the current provider set, then one event per subsequent
    /// register/unregister/health-change.
    pub async fn watch(&self, service_type: &str) -> WatchHandle {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));

        let initial = {
            let mut types = self.types.write().await;
            let state = types.entry(service_type.to_string()).or_insert_with(TypeState::new);
            let event = self.current_event(service_type, state);
            state.watchers.push(Watcher {
                tx: tx.clone(),
                dropped: dropped.clone(),
            });
            event
        };
        let _ = tx.try_send(initial);

        WatchHandle { events: rx, dropped }
    }

    fn current_event(&self, service_type: &str, state: &TypeState) -> WatchEvent {
        let eligible: Vec<&ProviderRecord> = state
            .providers
            .iter()
            .filter(|p| self.lifecycle.routes_traffic(&p.runtime_id))
            .collect();
        if eligible.is_empty() {
            return WatchEvent {
                service_type: service_type.to_string(),
                state: if state.providers.is_empty() {
                    WatchState::Unspecified
                } else {
                    WatchState::Unavailable
                },
                endpoint: None,
            };
        }
        let health_states: Vec<HealthState> = eligible
            .iter()
            .map(|p| if self.lifecycle.get_health(&p.runtime_id) == HealthState::Healthy {
                HealthState::Healthy
            } else {
                HealthState::Degraded
            })
            .collect();
        let aggregate = aggregate_availability(health_states);
        let watch_state = match aggregate {
            AggregateAvailability::Available => WatchState::Available,
            AggregateAvailability::Degraded => WatchState::Degraded,
            AggregateAvailability::Unavailable => WatchState::Unavailable,
            AggregateAvailability::Unspecified => WatchState::Unspecified,
        };
        WatchEvent {
            service_type: service_type.to_string(),
            state: watch_state,
            endpoint: Some(to_endpoint(eligible[0])),
        }
    }

    async fn notify_watchers(&self, service_type: &str) {
        let mut types = self.types.write().await;
        let Some(state) = types.get_mut(service_type) else { return };
        let event = self.current_event(service_type, state);
        state.watchers.retain(|watcher| match watcher.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                watcher.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Called after a health transition for `runtime_id`: re-notify every
    /// `service_type` that runtime currently provides.
    pub async fn on_health_change(&self, runtime_id: &str) {
        let types: Vec<String> = self
            .runtime_service_types
            .get(runtime_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for service_type in types {
            self.notify_watchers(&service_type).await;
        }
    }

    /// Remove every registration owned by `runtime_id`, as an explicit
    /// `RemovePlugin` would, and notify affected watchers.
    pub async fn evict_runtime(&self, runtime_id: &str) {
        let affected: Vec<String> = self
            .runtime_service_types
            .remove(runtime_id)
            .map(|(_, types)| types.into_iter().collect())
            .unwrap_or_default();

        {
            let mut types = self.types.write().await;
            for service_type in &affected {
                if let Some(state) = types.get_mut(service_type) {
                    state.providers.retain(|p| p.runtime_id != runtime_id);
                }
            }
        }
        self.registration_index
            .retain(|_, service_type| !affected.contains(service_type));
        self.deauthorize(runtime_id);
        for service_type in &affected {
            self.notify_watchers(service_type).await;
        }
    }

    async fn sweep_stale_runtimes(&self, liveness_window: Duration) {
        let runtimes: Vec<String> = self
            .runtime_service_types
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for runtime_id in runtimes {
            if self.lifecycle.is_stale(&runtime_id, liveness_window) {
                tracing::info!(runtime_id, "evicting stale runtime registrations");
                self.evict_runtime(&runtime_id).await;
            }
        }
    }

    #[cfg(test)]
    pub async fn provider_count(&self, service_type: &str) -> usize {
        self.types
            .read()
            .await
            .get(service_type)
            .map(|s| s.providers.len())
            .unwrap_or(0)
    }
}

fn to_endpoint(provider: &ProviderRecord) -> ServiceEndpoint {
    ServiceEndpoint {
        provider_runtime_id: provider.runtime_id.clone(),
        version: provider.version.clone(),
        endpoint_url: format!("/services/{}/{}/", provider.service_type, provider.runtime_id),
        metadata: provider.metadata.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pluginhost_lifecycle::ReportHealthRequest;

    async fn registry_with_one_healthy_cache() -> (Arc<ServiceRegistry>, Arc<LifecycleServer>) {
        let lifecycle = Arc::new(LifecycleServer::new());
        let registry = ServiceRegistry::new(lifecycle.clone(), Duration::from_secs(3600), Duration::from_secs(90));
        let mut allowed = HashSet::new();
        allowed.insert("cache".to_string());
        registry.authorize("cache-r1", allowed);
        lifecycle.report_health(
            "cache-r1",
            ReportHealthRequest {
                state: HealthState::Healthy,
                reason: None,
                unavailable_dependencies: vec![],
            },
        );
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
        (registry, lifecycle)
    }

    #[tokio::test]
    async fn register_then_discover_returns_same_provider() {
        let (registry, _lifecycle) = registry_with_one_healthy_cache().await;
        let resp = registry
            .discover(DiscoverServiceRequest {
                service_type: "cache".into(),
                min_version: "1.0.0".into(),
            })
            .await
            .unwrap();
        assert_eq!(resp.endpoint.provider_runtime_id, "cache-r1");
        assert_eq!(resp.endpoint.endpoint_url, "/services/cache/cache-r1/");
        registry.close();
    }

    #[tokio::test]
    async fn unauthorized_runtime_cannot_register() {
        let lifecycle = Arc::new(LifecycleServer::new());
        let registry = ServiceRegistry::new(lifecycle, Duration::from_secs(3600), Duration::from_secs(90));
        let err = registry
            .register(
                "ghost",
                RegisterServiceRequest {
                    service_type: "cache".into(),
                    version: "1.0.0".into(),
                    endpoint_path: "/x/".into(),
                    metadata: BTreeMap::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::PermissionDenied(_)));
        registry.close();
    }

    #[tokio::test]
    async fn unhealthy_provider_is_invisible_to_discover() {
        let (registry, lifecycle) = registry_with_one_healthy_cache().await;
        lifecycle.report_health(
            "cache-r1",
            ReportHealthRequest {
                state: HealthState::Unhealthy,
                reason: None,
                unavailable_dependencies: vec![],
            },
        );
        let err = registry
            .discover(DiscoverServiceRequest {
                service_type: "cache".into(),
                min_version: "1.0.0".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
        registry.close();
    }

    #[tokio::test]
    async fn register_then_unregister_then_discover_is_not_found() {
        let (registry, _lifecycle) = registry_with_one_healthy_cache().await;
        let reg_id = {
            let types = registry.types.read().await;
            types.get("cache").unwrap().providers[0].registration_id.clone()
        };
        registry.unregister("cache-r1", &reg_id).await.unwrap();
        let err = registry
            .discover(DiscoverServiceRequest {
                service_type: "cache".into(),
                min_version: "1.0.0".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
        registry.close();
    }

    #[tokio::test]
    async fn non_owner_cannot_unregister() {
        let (registry, _lifecycle) = registry_with_one_healthy_cache().await;
        let reg_id = {
            let types = registry.types.read().await;
            types.get("cache").unwrap().providers[0].registration_id.clone()
        };
        let err = registry.unregister("some-other-runtime", &reg_id).await.unwrap_err();
        assert!(matches!(err, RuntimeError::PermissionDenied(_)));
        registry.close();
    }

    #[tokio::test]
    async fn watch_emits_initial_event() {
        let (registry, _lifecycle) = registry_with_one_healthy_cache().await;
        let mut handle = registry.watch("cache").await;
        let event = handle.events.recv().await.unwrap();
        assert_eq!(event.state, WatchState::Available);
        registry.close();
    }

    #[tokio::test]
    async fn eviction_sweep_removes_stale_runtime_registrations() {
        let (registry, _lifecycle) = registry_with_one_healthy_cache().await;
        assert_eq!(registry.provider_count("cache").await, 1);
        registry.sweep_stale_runtimes(Duration::from_nanos(0)).await;
        assert_eq!(registry.provider_count("cache").await, 0);
        registry.close();
    }

    #[tokio::test]
    async fn pinning_overrides_selection_strategy() {
        let (registry, lifecycle) = registry_with_one_healthy_cache().await;
        let mut allowed = HashSet::new();
        allowed.insert("cache".to_string());
        registry.authorize("cache-r2", allowed);
        lifecycle.report_health(
            "cache-r2",
            pluginhost_lifecycle::ReportHealthRequest {
                state: HealthState::Healthy,
                reason: None,
                unavailable_dependencies: vec![],
            },
        );
        registry
            .register(
                "cache-r2",
                RegisterServiceRequest {
                    service_type: "cache".into(),
                    version: "1.0.0".into(),
                    endpoint_path: "/cache.v1.Cache/".into(),
                    metadata: BTreeMap::new(),
                },
            )
            .await
            .unwrap();

        registry.pin_provider("cache", "cache-r2").await;
        let resp = registry
            .discover(DiscoverServiceRequest {
                service_type: "cache".into(),
                min_version: "1.0.0".into(),
            })
            .await
            .unwrap();
        assert_eq!(resp.endpoint.provider_runtime_id, "cache-r2");

        registry.unpin_provider("cache").await;
        registry.close();
    }
}
