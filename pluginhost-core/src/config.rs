//! Layered runtime configuration: environment variables, optionally overlaid
//! by a `.env` file (via `dotenvy`), falling back to hardcoded defaults.
//!
//! There is no YAML profile layer here — unlike the wider codebase family
//! this runtime descends from, there is no per-environment controller
//! surface to template, so the three-tier env/file/default precedence is
//! scaled down to the handful of knobs this system actually needs.

use std::time::Duration;

/// All tunables for one runtime host, loaded once at startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Expected magic cookie key/value pair, compared constant-time against
    /// the one presented at handshake.
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
    /// Highest protocol version this host speaks.
    pub protocol_version: u32,
    /// TTL for a runtime identity token minted at handshake.
    pub token_ttl: Duration,
    /// TTL for a capability grant minted by the broker.
    pub capability_grant_ttl: Duration,
    /// How long a registration may go without a `ReportHealth` call before
    /// the liveness sweep treats its `runtime_id` as dead.
    pub health_liveness_window: Duration,
    /// Interval between liveness/rate-limit sweeps.
    pub sweep_interval: Duration,
    /// Bound on how long the platform waits for a single required
    /// dependency to become ready during startup.
    pub readiness_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL when stopping an
    /// out-of-process plugin.
    pub shutdown_grace: Duration,
    /// Default token-bucket capacity and refill rate for the rate limiter.
    pub rate_limit_capacity: f64,
    pub rate_limit_refill_per_sec: f64,
    /// `base_url` values an unmanaged plugin may self-report; empty disables
    /// the unmanaged path entirely.
    pub unmanaged_base_url_allowlist: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            magic_cookie_key: "PLUGINHOST_MAGIC_COOKIE_KEY".to_string(),
            magic_cookie_value: "pluginhost".to_string(),
            protocol_version: 1,
            token_ttl: Duration::from_secs(24 * 3600),
            capability_grant_ttl: Duration::from_secs(3600),
            health_liveness_window: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(30),
            readiness_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            rate_limit_capacity: 100.0,
            rate_limit_refill_per_sec: 50.0,
            unmanaged_base_url_allowlist: Vec::new(),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_secs(key: &str, default: Duration) -> Duration {
    env_var(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl RuntimeConfig {
    /// Load configuration: try to overlay a `.env` file first (missing file
    /// is not an error), then read each knob from the environment, falling
    /// back to [`RuntimeConfig::default`] for anything unset.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = RuntimeConfig::default();

        let allowlist = env_var("PLUGINHOST_UNMANAGED_BASE_URL_ALLOWLIST")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.unmanaged_base_url_allowlist);

        RuntimeConfig {
            magic_cookie_key: env_var("PLUGINHOST_MAGIC_COOKIE_KEY")
                .unwrap_or(defaults.magic_cookie_key),
            magic_cookie_value: env_var("PLUGINHOST_MAGIC_COOKIE_VALUE")
                .unwrap_or(defaults.magic_cookie_value),
            protocol_version: parse_env("PLUGINHOST_PROTOCOL_VERSION", defaults.protocol_version),
            token_ttl: parse_env_secs("PLUGINHOST_TOKEN_TTL_SECS", defaults.token_ttl),
            capability_grant_ttl: parse_env_secs(
                "PLUGINHOST_CAPABILITY_GRANT_TTL_SECS",
                defaults.capability_grant_ttl,
            ),
            health_liveness_window: parse_env_secs(
                "PLUGINHOST_HEALTH_LIVENESS_WINDOW_SECS",
                defaults.health_liveness_window,
            ),
            sweep_interval: parse_env_secs("PLUGINHOST_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            readiness_timeout: parse_env_secs(
                "PLUGINHOST_READINESS_TIMEOUT_SECS",
                defaults.readiness_timeout,
            ),
            shutdown_grace: parse_env_secs("PLUGINHOST_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace),
            rate_limit_capacity: parse_env("PLUGINHOST_RATE_LIMIT_CAPACITY", defaults.rate_limit_capacity),
            rate_limit_refill_per_sec: parse_env(
                "PLUGINHOST_RATE_LIMIT_REFILL_PER_SEC",
                defaults.rate_limit_refill_per_sec,
            ),
            unmanaged_base_url_allowlist: allowlist,
        }
    }
}

/// Install a `tracing` subscriber reading its filter from `RUST_LOG`,
/// defaulting to `info` when unset. Mirrors the layered env/file/default
/// precedence used for the rest of configuration.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
