//! Capability broker: host-provided capabilities (e.g. "logger", "secrets")
//! granted to plugins via short-lived bearer tokens, distinct from the
//! plugin-to-plugin services the registry tracks.
//!
//! Grant issuance and validation mirror the handshake server's token store
//! (§4.1): a fresh CSPRNG `grant_id` + bearer token with a TTL, validated
//! constant-time, lazily cleaned up on the first access past expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pluginhost_core::{RuntimeError, TokenStore};

/// A host-provided capability's handler. Capabilities are registered by
/// type at broker construction; the interface is fixed per capability
/// rather than dispatched through a runtime type assertion, so each
/// capability type gets its own concrete implementation behind this trait.
pub trait CapabilityHandler: Send + Sync {
    /// Human-readable label surfaced in diagnostics, e.g. "logger".
    fn name(&self) -> &str;

    /// Handle one invocation body, returning the response body.
    fn invoke(&self, body: &[u8]) -> Result<Vec<u8>, RuntimeError>;
}

struct Grant {
    capability_type: String,
    owner_runtime_id: String,
}

/// Process-wide capability broker. Holds the set of registered capability
/// handlers and the live grants issued against them.
pub struct CapabilityBroker {
    handlers: HashMap<String, Arc<dyn CapabilityHandler>>,
    tokens: TokenStore,
    grants: DashMap<String, Grant>,
    grant_ttl: Duration,
}

/// `RequestCapability` response: the grant id, bearer token, and the URL the
/// plugin should invoke for this capability going forward.
#[derive(Debug, Clone)]
pub struct CapabilityGrantResponse {
    pub grant_id: String,
    pub bearer_token: String,
    pub invoke_url: String,
}

impl CapabilityBroker {
    pub fn new(grant_ttl: Duration) -> Self {
        CapabilityBroker {
            handlers: HashMap::new(),
            tokens: TokenStore::new(),
            grants: DashMap::new(),
            grant_ttl,
        }
    }

    /// Register a capability, making it requestable by its type name.
    pub fn register_capability(&mut self, capability_type: &str, handler: Arc<dyn CapabilityHandler>) {
        self.handlers.insert(capability_type.to_string(), handler);
    }

    /// `RequestCapability`: mint a grant for `capability_type`, owned by
    /// `runtime_id`. Unknown capability types are rejected as not-found.
    pub async fn request_capability(
        &self,
        runtime_id: &str,
        capability_type: &str,
    ) -> Result<CapabilityGrantResponse, RuntimeError> {
        if !self.handlers.contains_key(capability_type) {
            return Err(RuntimeError::NotFound(format!(
                "unknown capability type '{capability_type}'"
            )));
        }

        let grant_id = pluginhost_crypto::random_id()?;
        let bearer_token = pluginhost_crypto::random_token()?;
        self.tokens.issue(&grant_id, bearer_token.clone(), self.grant_ttl).await;
        self.grants.insert(
            grant_id.clone(),
            Grant {
                capability_type: capability_type.to_string(),
                owner_runtime_id: runtime_id.to_string(),
            },
        );

        Ok(CapabilityGrantResponse {
            invoke_url: format!("/capabilities/{capability_type}/{grant_id}/"),
            grant_id,
            bearer_token,
        })
    }

    /// Validate a grant's bearer token (constant-time, lazily evicting
    /// expired entries) and dispatch the invocation to its handler.
    pub async fn invoke(&self, grant_id: &str, bearer_token: &str, body: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        if !self.tokens.validate(grant_id, bearer_token).await {
            return Err(RuntimeError::Unauthenticated("invalid or expired capability grant".into()));
        }
        let capability_type = self
            .grants
            .get(grant_id)
            .map(|g| g.capability_type.clone())
            .ok_or_else(|| RuntimeError::NotFound("unknown grant".into()))?;
        let handler = self
            .handlers
            .get(&capability_type)
            .ok_or_else(|| RuntimeError::NotFound(format!("capability '{capability_type}' no longer registered")))?;
        handler.invoke(body)
    }

    /// Revoke every grant owned by `runtime_id` (plugin removal).
    pub async fn revoke_runtime(&self, runtime_id: &str) {
        let to_revoke: Vec<String> = self
            .grants
            .iter()
            .filter(|entry| entry.value().owner_runtime_id == runtime_id)
            .map(|entry| entry.key().clone())
            .collect();
        for grant_id in to_revoke {
            self.tokens.revoke(&grant_id).await;
            self.grants.remove(&grant_id);
        }
    }

    #[cfg(test)]
    async fn live_grant_count(&self) -> usize {
        self.tokens.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoCapability;

    impl CapabilityHandler for EchoCapability {
        fn name(&self) -> &str {
            "logger"
        }

        fn invoke(&self, body: &[u8]) -> Result<Vec<u8>, RuntimeError> {
            Ok(body.to_vec())
        }
    }

    fn broker() -> CapabilityBroker {
        let mut broker = CapabilityBroker::new(Duration::from_secs(3600));
        broker.register_capability("logger", Arc::new(EchoCapability));
        broker
    }

    #[tokio::test]
    async fn unknown_capability_type_is_not_found() {
        let broker = broker();
        let err = broker.request_capability("r1", "secrets").await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[tokio::test]
    async fn grant_then_invoke_round_trips_body() {
        let broker = broker();
        let grant = broker.request_capability("r1", "logger").await.unwrap();
        assert_eq!(grant.invoke_url, format!("/capabilities/logger/{}/", grant.grant_id));
        let out = broker
            .invoke(&grant.grant_id, &grant.bearer_token, b"hello")
            .await
            .unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn invoke_with_wrong_token_is_unauthenticated() {
        let broker = broker();
        let grant = broker.request_capability("r1", "logger").await.unwrap();
        let err = broker.invoke(&grant.grant_id, "wrong", b"hi").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn revoke_runtime_removes_its_grants_only() {
        let broker = broker();
        let grant_a = broker.request_capability("r1", "logger").await.unwrap();
        let grant_b = broker.request_capability("r2", "logger").await.unwrap();
        broker.revoke_runtime("r1").await;
        assert!(broker.invoke(&grant_a.grant_id, &grant_a.bearer_token, b"x").await.is_err());
        assert!(broker.invoke(&grant_b.grant_id, &grant_b.bearer_token, b"x").await.is_ok());
        assert_eq!(broker.live_grant_count().await, 1);
    }
}
