use pluginhost::{build_router, AppState};
use pluginhost_core::RuntimeConfig;

#[tokio::main]
async fn main() {
    pluginhost_core::init_tracing();

    let config = RuntimeConfig::from_env();
    let bind_addr = std::env::var("PLUGINHOST_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:7070".to_string());

    warn_if_tls_posture_unset();

    let state = AppState::new(&config, vec![], format!("pluginhost/{}", env!("CARGO_PKG_VERSION")));
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {bind_addr}: {e}"));
    tracing::info!(addr = %bind_addr, "pluginhost listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| tracing::error!(error = %e, "server exited with error"));

    state.close();
}

/// Warn once at startup that plugin traffic is unauthenticated in transit
/// unless the operator fronts this host with TLS — unless explicitly
/// suppressed, since some deployments terminate TLS at a sidecar the host
/// itself never sees.
fn warn_if_tls_posture_unset() {
    let suppressed = std::env::var("PLUGRT_SUPPRESS_TLS_WARNING")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    if !suppressed {
        tracing::warn!(
            "pluginhost is serving plain HTTP; front it with TLS or set \
             PLUGRT_SUPPRESS_TLS_WARNING=1 once a terminating proxy is in place"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
