//! Handshake RPC: magic-cookie/version negotiation and runtime-identity
//! issuance. The resulting `(runtime_id, runtime_token)` pair is the
//! credential every other component validates on every subsequent call.

use std::time::{Duration, SystemTime};

use pluginhost_core::{validate_self_id, RuntimeConfig, RuntimeError, TokenStore};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeRequest {
    pub core_protocol_version: u32,
    pub app_protocol_version: u32,
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
    #[serde(default)]
    pub requested_plugins: Vec<String>,
    #[serde(default)]
    pub self_id: String,
    #[serde(default)]
    pub self_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandshakeResponse {
    pub supported_plugins: Vec<String>,
    pub server_metadata: String,
    pub runtime_id: String,
    pub runtime_token: String,
    pub expires_at: u64,
}

/// The handshake server. Holds the expected magic cookie and protocol
/// versions, and owns the runtime-identity token store.
pub struct HandshakeServer {
    magic_cookie_key: String,
    magic_cookie_value: String,
    core_protocol_version: u32,
    app_protocol_version: u32,
    supported_plugins: Vec<String>,
    server_metadata: String,
    token_ttl: Duration,
    tokens: TokenStore,
}

impl HandshakeServer {
    pub fn new(
        config: &RuntimeConfig,
        app_protocol_version: u32,
        supported_plugins: Vec<String>,
        server_metadata: String,
    ) -> Self {
        HandshakeServer {
            magic_cookie_key: config.magic_cookie_key.clone(),
            magic_cookie_value: config.magic_cookie_value.clone(),
            core_protocol_version: config.protocol_version,
            app_protocol_version,
            supported_plugins,
            server_metadata,
            token_ttl: config.token_ttl,
            tokens: TokenStore::new(),
        }
    }

    /// A reference to the underlying token store, for the router/registry to
    /// validate bearer tokens against.
    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub async fn handshake(
        &self,
        req: HandshakeRequest,
    ) -> Result<HandshakeResponse, RuntimeError> {
        if !pluginhost_crypto::constant_time_eq(
            req.magic_cookie_key.as_bytes(),
            self.magic_cookie_key.as_bytes(),
        ) || !pluginhost_crypto::constant_time_eq(
            req.magic_cookie_value.as_bytes(),
            self.magic_cookie_value.as_bytes(),
        ) {
            return Err(RuntimeError::InvalidArgument(
                "magic cookie mismatch".into(),
            ));
        }

        if req.core_protocol_version != self.core_protocol_version {
            return Err(RuntimeError::InvalidArgument(format!(
                "unsupported core_protocol_version {}",
                req.core_protocol_version
            )));
        }
        if req.app_protocol_version != self.app_protocol_version {
            return Err(RuntimeError::InvalidArgument(format!(
                "unsupported app_protocol_version {}",
                req.app_protocol_version
            )));
        }

        let runtime_id = if req.self_id.is_empty() {
            pluginhost_crypto::derive_runtime_id("")?
        } else {
            validate_self_id(&req.self_id)?;
            let normalized = pluginhost_crypto::normalize_label(&req.self_id);
            pluginhost_crypto::derive_runtime_id(&normalized)?
        };

        let runtime_token = pluginhost_crypto::random_token()?;
        self.tokens
            .issue(&runtime_id, runtime_token.clone(), self.token_ttl)
            .await;

        let expires_at = SystemTime::now()
            .checked_add(self.token_ttl)
            .unwrap_or(SystemTime::now())
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Ok(HandshakeResponse {
            supported_plugins: self.supported_plugins.clone(),
            server_metadata: self.server_metadata.clone(),
            runtime_id,
            runtime_token,
            expires_at,
        })
    }

    /// Validate a caller's `(runtime_id, token)` pair against the store.
    pub async fn validate_token(&self, runtime_id: &str, token: &str) -> bool {
        self.tokens.validate(runtime_id, token).await
    }

    /// Revoke a runtime identity's token (plugin removal).
    pub async fn revoke(&self, runtime_id: &str) {
        self.tokens.revoke(runtime_id).await;
    }
}
