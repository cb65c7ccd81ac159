//! Dependency graph and plugin lifecycle orchestration: topological startup
//! order, `AddPlugin`/`RemovePlugin`/`ReplacePlugin`, and the endpoint table
//! the router resolves providers through.
//!
//! A managed plugin's identity RPC and control RPC (the wire calls a real
//! deployment would use to push identity to the plugin process and ask it
//! to drain) are outside this crate's scope — see `spec.md`'s framing of the
//! wire-encoded RPC transport as an external collaborator. This crate models
//! the host side of that contract: it mints identity through the same
//! handshake path an unmanaged plugin would use, and expects the plugin
//! (or, in tests, the caller) to call `ReportHealth` once it's actually
//! ready, exactly as it would over the real wire.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use pluginhost_core::RuntimeError;
use pluginhost_handshake::HandshakeServer;
use pluginhost_launcher::{launch, LaunchSpec, LaunchedPlugin};
use pluginhost_lifecycle::LifecycleServer;
use pluginhost_registry::{RegisterServiceRequest, ServiceRegistry};
use pluginhost_router::ServiceRouter;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// A service this plugin answers for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidesEntry {
    pub service_type: String,
    pub version: String,
    pub endpoint_path: String,
}

/// A dependency edge: this plugin needs `service_type` at `min_version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiresEntry {
    pub service_type: String,
    pub min_version: String,
    pub required_for_startup: bool,
    pub watch_for_changes: bool,
}

/// The plugin's self-declared identity, as returned by its identity RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub self_id: String,
    pub self_version: String,
    pub provides: Vec<ProvidesEntry>,
    pub requires: Vec<RequiresEntry>,
}

/// Everything `AddPlugin` needs: the declared descriptor plus how to launch
/// its process.
pub struct PluginConfig {
    pub descriptor: PluginDescriptor,
    pub launch_spec: LaunchSpec,
    /// How long to wait for the plugin to report `Healthy` after launch
    /// before rolling back.
    pub readiness_deadline: Duration,
}

struct GraphNode {
    provides: HashSet<String>,
    requires: Vec<RequiresEntry>,
}

/// Nodes keyed by `runtime_id`; edges point from a consumer to any node
/// providing a required `service_type`. Mutation methods reject anything
/// that would introduce a cycle.
pub struct DependencyGraph {
    nodes: HashMap<String, GraphNode>,
    insertion_order: Vec<String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph {
            nodes: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    fn would_cycle(&self, candidate_id: &str, candidate: &GraphNode) -> bool {
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, node) in &self.nodes {
            edges.insert(id.as_str(), self.dependency_targets(node));
        }
        edges.insert(candidate_id, self.dependency_targets(candidate));

        let mut visiting: HashSet<&str> = HashSet::new();
        let mut visited: HashSet<&str> = HashSet::new();

        fn dfs<'a>(
            node: &'a str,
            edges: &HashMap<&'a str, Vec<&'a str>>,
            visiting: &mut HashSet<&'a str>,
            visited: &mut HashSet<&'a str>,
        ) -> bool {
            if visiting.contains(node) {
                return true;
            }
            if visited.contains(node) {
                return false;
            }
            visiting.insert(node);
            if let Some(targets) = edges.get(node) {
                for &target in targets {
                    if dfs(target, edges, visiting, visited) {
                        return true;
                    }
                }
            }
            visiting.remove(node);
            visited.insert(node);
            false
        }

        dfs(candidate_id, &edges, &mut visiting, &mut visited)
    }

    /// Resolve each `requires` edge to the set of existing node ids that
    /// currently provide it (any alternate provider counts as a target).
    fn dependency_targets<'a>(&'a self, node: &'a GraphNode) -> Vec<&'a str> {
        node.requires
            .iter()
            .flat_map(|req| {
                self.nodes
                    .iter()
                    .filter(move |(_, n)| n.provides.contains(&req.service_type))
                    .map(|(id, _)| id.as_str())
            })
            .collect()
    }

    pub fn insert(
        &mut self,
        runtime_id: &str,
        provides: HashSet<String>,
        requires: Vec<RequiresEntry>,
    ) -> Result<(), RuntimeError> {
        let node = GraphNode { provides, requires };
        if self.would_cycle(runtime_id, &node) {
            return Err(RuntimeError::FailedPrecondition(format!(
                "adding '{runtime_id}' would create a dependency cycle"
            )));
        }
        self.nodes.insert(runtime_id.to_string(), node);
        self.insertion_order.push(runtime_id.to_string());
        Ok(())
    }

    pub fn remove(&mut self, runtime_id: &str) {
        self.nodes.remove(runtime_id);
        self.insertion_order.retain(|id| id != runtime_id);
    }

    pub fn contains(&self, runtime_id: &str) -> bool {
        self.nodes.contains_key(runtime_id)
    }

    /// Runtime ids whose `requires` list references a `service_type` this
    /// plugin provides, and that have no other provider for that type.
    pub fn impact_of_removal(&self, runtime_id: &str) -> Vec<String> {
        let Some(leaving) = self.nodes.get(runtime_id) else {
            return Vec::new();
        };
        let mut affected = Vec::new();
        for (id, node) in &self.nodes {
            if id == runtime_id {
                continue;
            }
            let depends_on_leaving = node
                .requires
                .iter()
                .any(|req| leaving.provides.contains(&req.service_type));
            if !depends_on_leaving {
                continue;
            }
            let has_alternate = node.requires.iter().any(|req| {
                leaving.provides.contains(&req.service_type)
                    && self.nodes.iter().any(|(other_id, other)| {
                        other_id != runtime_id && other_id != id && other.provides.contains(&req.service_type)
                    })
            });
            if !has_alternate {
                affected.push(id.clone());
            }
        }
        affected
    }

    /// Kahn's algorithm over the `requires` edges, with deterministic
    /// tie-break by insertion order. A remaining cycle (which `insert`
    /// should already have prevented) is reported as `FailedPrecondition`.
    pub fn topological_order(&self) -> Result<Vec<String>, RuntimeError> {
        let mut in_degree: HashMap<&str, usize> = self.nodes.keys().map(|id| (id.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (id, node) in &self.nodes {
            for target in self.dependency_targets(node) {
                *in_degree.entry(id.as_str()).or_insert(0) += 1;
                dependents.entry(target).or_default().push(id.as_str());
            }
        }

        let mut ready: Vec<&str> = self
            .insertion_order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.first().copied() {
            ready.remove(0);
            order.push(id.to_string());
            if let Some(dependents_of_id) = dependents.get(id) {
                for &dependent in dependents_of_id {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            let insertion_index = self
                                .insertion_order
                                .iter()
                                .position(|x| x == dependent)
                                .unwrap_or(usize::MAX);
                            let pos = ready
                                .iter()
                                .position(|r| {
                                    let r_index =
                                        self.insertion_order.iter().position(|x| x == r).unwrap_or(usize::MAX);
                                    r_index > insertion_index
                                })
                                .unwrap_or(ready.len());
                            ready.insert(pos, dependent);
                        }
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(RuntimeError::FailedPrecondition(
                "dependency graph contains a cycle".into(),
            ));
        }
        Ok(order)
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// The result of a successful `AddPlugin` call.
pub struct AddedPlugin {
    pub runtime_id: String,
    pub runtime_token: String,
    pub endpoint_url: String,
}

/// Orchestrates managed plugins: owns the dependency graph, the handshake,
/// registry, and lifecycle components, and the launched-process handles.
pub struct Platform {
    handshake: Arc<HandshakeServer>,
    registry: Arc<ServiceRegistry>,
    lifecycle: Arc<LifecycleServer>,
    router: Arc<ServiceRouter>,
    graph: RwLock<DependencyGraph>,
    launched: RwLock<HashMap<String, LaunchedPlugin>>,
    /// Grace period between notifying a plugin of removal and tearing down
    /// its registrations, used by `remove_plugin`.
    shutdown_grace: Duration,
    /// Broadcasts each freshly minted `runtime_id` as soon as it exists, so
    /// a test can report the in-process plugin healthy without already
    /// knowing the CSPRNG-suffixed id `add_plugin` is about to assign it.
    #[cfg(test)]
    minted_identities: tokio::sync::broadcast::Sender<String>,
}

impl Platform {
    pub fn new(
        handshake: Arc<HandshakeServer>,
        registry: Arc<ServiceRegistry>,
        lifecycle: Arc<LifecycleServer>,
        router: Arc<ServiceRouter>,
        shutdown_grace: Duration,
    ) -> Self {
        Platform {
            handshake,
            registry,
            lifecycle,
            router,
            graph: RwLock::new(DependencyGraph::new()),
            launched: RwLock::new(HashMap::new()),
            shutdown_grace,
            #[cfg(test)]
            minted_identities: tokio::sync::broadcast::channel(16).0,
        }
    }

    async fn required_dependencies_satisfied(&self, config: &PluginConfig) -> Result<(), RuntimeError> {
        for req in &config.descriptor.requires {
            if !req.required_for_startup {
                continue;
            }
            self.registry
                .discover(pluginhost_registry::DiscoverServiceRequest {
                    service_type: req.service_type.clone(),
                    min_version: req.min_version.clone(),
                })
                .await
                .map_err(|_| {
                    RuntimeError::FailedPrecondition(format!(
                        "required dependency '{}' has no eligible provider",
                        req.service_type
                    ))
                })?;
        }
        Ok(())
    }

    /// Bring a managed plugin online: validate its required-for-startup
    /// dependencies, mint identity, launch it, wait for it to report
    /// healthy, then register its services and insert it into the graph.
    /// Any failure after identity is minted rolls the identity back out.
    pub async fn add_plugin(&self, config: PluginConfig) -> Result<AddedPlugin, RuntimeError> {
        self.required_dependencies_satisfied(&config).await?;

        // A managed plugin never performs its own Handshake call (it has no
        // magic cookie to present): the platform mints its identity directly
        // through the same id/token primitives the handshake server itself
        // uses, then hands `(runtime_id, runtime_token)` to the plugin via
        // its launch environment.
        let identity = self.mint_identity_directly(&config.descriptor).await?;
        #[cfg(test)]
        let _ = self.minted_identities.send(identity.runtime_id.clone());

        let provides: HashSet<String> = config
            .descriptor
            .provides
            .iter()
            .map(|p| p.service_type.clone())
            .collect();
        self.registry.authorize(&identity.runtime_id, provides.clone());

        let rollback = || async {
            self.handshake.revoke(&identity.runtime_id).await;
            self.registry.deauthorize(&identity.runtime_id);
        };

        let launched = match launch(config.launch_spec, CancellationToken::new()).await {
            Ok(launched) => launched,
            Err(err) => {
                rollback().await;
                return Err(err);
            }
        };
        self.router.set_endpoint(&identity.runtime_id, &launched.endpoint_url);

        if let Err(err) = self
            .wait_for_healthy(&identity.runtime_id, config.readiness_deadline)
            .await
        {
            launched.cleanup().await;
            self.router.remove_endpoint(&identity.runtime_id);
            rollback().await;
            return Err(err);
        }

        for entry in &config.descriptor.provides {
            if let Err(err) = self
                .registry
                .register(
                    &identity.runtime_id,
                    RegisterServiceRequest {
                        service_type: entry.service_type.clone(),
                        version: entry.version.clone(),
                        endpoint_path: entry.endpoint_path.clone(),
                        metadata: Default::default(),
                    },
                )
                .await
            {
                launched.cleanup().await;
                self.router.remove_endpoint(&identity.runtime_id);
                self.registry.evict_runtime(&identity.runtime_id).await;
                rollback().await;
                return Err(err);
            }
        }

        {
            let mut graph = self.graph.write().await;
            if let Err(err) = graph.insert(&identity.runtime_id, provides, config.descriptor.requires.clone()) {
                drop(graph);
                launched.cleanup().await;
                self.router.remove_endpoint(&identity.runtime_id);
                self.registry.evict_runtime(&identity.runtime_id).await;
                rollback().await;
                return Err(err);
            }
        }

        let endpoint_url = launched.endpoint_url.clone();
        self.launched.write().await.insert(identity.runtime_id.clone(), launched);

        Ok(AddedPlugin {
            endpoint_url,
            runtime_id: identity.runtime_id,
            runtime_token: identity.runtime_token,
        })
    }

    async fn mint_identity_directly(
        &self,
        descriptor: &PluginDescriptor,
    ) -> Result<pluginhost_handshake::HandshakeResponse, RuntimeError> {
        let normalized = pluginhost_crypto::normalize_label(&descriptor.self_id);
        let runtime_id = pluginhost_crypto::derive_runtime_id(&normalized)?;
        let runtime_token = pluginhost_crypto::random_token()?;
        self.handshake
            .tokens()
            .issue(&runtime_id, runtime_token.clone(), Duration::from_secs(3600))
            .await;
        Ok(pluginhost_handshake::HandshakeResponse {
            supported_plugins: vec![],
            server_metadata: String::new(),
            runtime_id,
            runtime_token,
            expires_at: 0,
        })
    }

    async fn wait_for_healthy(&self, runtime_id: &str, deadline: Duration) -> Result<(), RuntimeError> {
        let started = tokio::time::Instant::now();
        loop {
            if self.lifecycle.routes_traffic(runtime_id) {
                return Ok(());
            }
            if started.elapsed() >= deadline {
                return Err(RuntimeError::DeadlineExceeded(format!(
                    "'{runtime_id}' did not become healthy within {deadline:?}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Runtime ids that would lose their only provider for a service type
    /// this plugin offers, were it removed right now.
    pub async fn impact_of_removal(&self, runtime_id: &str) -> Vec<String> {
        self.graph.read().await.impact_of_removal(runtime_id)
    }

    /// Tear a managed plugin down: compute the impact on its consumers,
    /// notify it via its control RPC and wait out the grace period, then
    /// unregister its services, drop its lifecycle record, evict its
    /// registry authorization, remove it from the graph, invalidate its
    /// token, and stop its launched process.
    pub async fn remove_plugin(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        if !self.graph.read().await.contains(runtime_id) {
            return Err(RuntimeError::NotFound(format!("unknown plugin '{runtime_id}'")));
        }

        let impacted = self.impact_of_removal(runtime_id).await;
        if !impacted.is_empty() {
            tracing::warn!(
                runtime_id,
                impacted = ?impacted,
                "removing plugin with no alternate provider for one or more dependents"
            );
        }

        // Notify via the plugin's control RPC (an external collaborator not
        // modeled by this crate) and wait out the grace window before
        // tearing anything down, so in-flight calls routed to it have a
        // chance to drain.
        tokio::time::sleep(self.shutdown_grace).await;

        self.registry.evict_runtime(runtime_id).await;
        self.lifecycle.remove(runtime_id);
        self.router.remove_endpoint(runtime_id);
        self.handshake.revoke(runtime_id).await;
        self.graph.write().await.remove(runtime_id);

        if let Some(launched) = self.launched.write().await.remove(runtime_id) {
            launched.cleanup().await;
        }
        Ok(())
    }

    /// Bring a replacement instance online, atomically flip registry
    /// selection for every service type the two instances share, then
    /// remove the old instance.
    pub async fn replace_plugin(
        &self,
        old_runtime_id: &str,
        new_config: PluginConfig,
        drain_window: Duration,
    ) -> Result<AddedPlugin, RuntimeError> {
        let shared_types: Vec<String> = new_config
            .descriptor
            .provides
            .iter()
            .map(|p| p.service_type.clone())
            .collect();

        let added = self.add_plugin(new_config).await?;

        for service_type in &shared_types {
            self.registry.pin_provider(service_type, &added.runtime_id).await;
        }

        tokio::time::sleep(drain_window).await;

        for service_type in &shared_types {
            self.registry.unpin_provider(service_type).await;
        }
        self.remove_plugin(old_runtime_id).await?;

        Ok(added)
    }

    /// Kahn's-algorithm startup order over the current graph.
    pub async fn startup_order(&self) -> Result<Vec<String>, RuntimeError> {
        self.graph.read().await.topological_order()
    }
}
