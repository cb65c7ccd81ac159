//! Plugin launcher strategies: bring a plugin's HTTP endpoint online either
//! as a child process or as an in-process task, and report it back to the
//! platform as `(endpoint_url, cleanup)`.
//!
//! Both strategies expose the same [`Launch`] operation; the platform
//! doesn't care which one produced a given [`LaunchedPlugin`].

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use pluginhost_core::RuntimeError;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Environment variables always passed through to an out-of-process child
/// regardless of the caller's allowlist — without `PATH` the child's own
/// exec would fail to resolve shared libraries and helper binaries.
const ALWAYS_PASSTHROUGH: &[&str] = &["PATH"];

/// What to launch and how to tell it's ready.
pub struct LaunchSpec {
    pub self_id: String,
    pub port: u16,
    pub host_url: String,
    /// Path polled (against `http://localhost:{port}`) until it returns a
    /// successful status, or `readiness_timeout` elapses.
    pub readiness_path: String,
    pub readiness_timeout: Duration,
    pub kind: LaunchKind,
}

/// The two built-in launch strategies.
pub enum LaunchKind {
    /// Spawn `program args...` as a child process.
    OutOfProcess {
        program: String,
        args: Vec<String>,
        /// Extra env vars (beyond `PORT`/`HOST_URL`/[`ALWAYS_PASSTHROUGH`])
        /// the operator explicitly allowlisted for passthrough.
        passthrough_env: Vec<String>,
        shutdown_grace: Duration,
    },
    /// Run `router` on a `tokio::spawn`ed task bound to `localhost:{port}`.
    InProcess { router: axum::Router },
}

/// A running plugin endpoint plus its teardown handle.
pub struct LaunchedPlugin {
    pub endpoint_url: String,
    cleanup: Cleanup,
}

enum Cleanup {
    OutOfProcess {
        child: Arc<Mutex<Option<Child>>>,
        grace: Duration,
    },
    InProcess {
        cancel: CancellationToken,
    },
}

impl LaunchedPlugin {
    /// Tear down the launched plugin. Safe to call more than once: a second
    /// call observes the cleanup has already run and is a no-op.
    pub async fn cleanup(&self) {
        match &self.cleanup {
            Cleanup::OutOfProcess { child, grace } => {
                let mut guard = child.lock().await;
                let Some(mut child) = guard.take() else { return };
                terminate_gracefully(&mut child, *grace).await;
            }
            Cleanup::InProcess { cancel } => {
                cancel.cancel();
            }
        }
    }
}

#[cfg(unix)]
async fn terminate_gracefully(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(not(unix))]
async fn terminate_gracefully(child: &mut Child, grace: Duration) {
    let _ = grace;
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Bring `spec` online and wait for it to answer its readiness path, under
/// `spec.readiness_timeout` and observing `cancel`.
///
/// On a readiness failure the partially-started plugin (child process or
/// in-process task) is torn down before the error is returned — callers
/// never get back a `LaunchedPlugin` for something that never came up.
pub async fn launch(spec: LaunchSpec, cancel: CancellationToken) -> Result<LaunchedPlugin, RuntimeError> {
    let readiness_url = format!("http://localhost:{}{}", spec.port, spec.readiness_path);

    match spec.kind {
        LaunchKind::OutOfProcess {
            program,
            args,
            passthrough_env,
            shutdown_grace,
        } => {
            let mut cmd = Command::new(&program);
            cmd.args(&args)
                .env_clear()
                .env("PORT", spec.port.to_string())
                .env("HOST_URL", &spec.host_url)
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());

            let mut passthrough: Vec<&str> = ALWAYS_PASSTHROUGH.to_vec();
            passthrough.extend(passthrough_env.iter().map(String::as_str));
            for key in passthrough {
                if let Ok(value) = std::env::var(key) {
                    cmd.env(key, value);
                }
            }

            let mut child = cmd
                .spawn()
                .map_err(|e| RuntimeError::Internal(format!("failed to spawn plugin '{}': {e}", spec.self_id)))?;

            if let Err(err) = wait_ready(&readiness_url, spec.readiness_timeout, &cancel).await {
                terminate_gracefully(&mut child, shutdown_grace).await;
                return Err(err);
            }

            Ok(LaunchedPlugin {
                endpoint_url: format!("http://localhost:{}", spec.port),
                cleanup: Cleanup::OutOfProcess {
                    child: Arc::new(Mutex::new(Some(child))),
                    grace: shutdown_grace,
                },
            })
        }
        LaunchKind::InProcess { router } => {
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", spec.port))
                .await
                .map_err(|e| RuntimeError::Internal(format!("failed to bind in-process plugin port: {e}")))?;

            let serve_cancel = CancellationToken::new();
            let shutdown_signal = serve_cancel.clone();
            tokio::spawn(async move {
                let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                    shutdown_signal.cancelled().await;
                });
                if let Err(err) = server.await {
                    tracing::warn!(error = %err, "in-process plugin server exited with error");
                }
            });

            if let Err(err) = wait_ready(&readiness_url, spec.readiness_timeout, &cancel).await {
                serve_cancel.cancel();
                return Err(err);
            }

            Ok(LaunchedPlugin {
                endpoint_url: format!("http://localhost:{}", spec.port),
                cleanup: Cleanup::InProcess { cancel: serve_cancel },
            })
        }
    }
}

async fn wait_ready(url: &str, timeout: Duration, cancel: &CancellationToken) -> Result<(), RuntimeError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let client = reqwest::Client::new();
    loop {
        if cancel.is_cancelled() {
            return Err(RuntimeError::DeadlineExceeded("plugin launch cancelled".into()));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RuntimeError::DeadlineExceeded(format!(
                "plugin did not become ready within {:?}",
                timeout
            )));
        }
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(RuntimeError::DeadlineExceeded("plugin launch cancelled".into())),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

/// Build an explicit passthrough env allowlist from a comma-separated
/// configuration value, trimming blanks.
pub fn parse_passthrough_env(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
