//! Edge server assembly and lifecycle.
//!
//! Wires the control API and the gateway passthrough into one router, then
//! owns startup (directories, supervisor, CLI runners) and shutdown. The
//! wrapper only exits after the signal has been forwarded to the gateway
//! child and the supervisor has reaped it.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{self, AppState, SharedState};
use crate::config::Config;
use crate::envfile::EnvFile;
use crate::exec::{AgentCli, CommandRunner};
use crate::proxy;
use crate::supervisor::{Supervisor, SupervisorHandle};

/// Build the full application router: control routes first, everything
/// else falls through to the gateway proxy.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .fallback(proxy::proxy_fallback)
        .with_state(state)
}

/// Start the wrapper: spawn the gateway supervisor and serve the edge
/// until a shutdown signal arrives.
pub async fn start_server(config: Config) -> Result<()> {
    config.ensure_directories()?;
    let env_file = EnvFile::new(config.env_file());

    let (supervisor, supervisor_task) = Supervisor::new(config.clone(), env_file.clone()).spawn();

    let agent: Arc<dyn CommandRunner> =
        Arc::new(AgentCli::new(&config.agent_bin, config.agent_env()).with_env_file(env_file));
    let google: Arc<dyn CommandRunner> =
        Arc::new(AgentCli::new(&config.google_bin, config.google_env()));

    let port = config.port;
    let dev_cors = config.dev_cors;
    let state = Arc::new(AppState::new(config, supervisor.clone(), agent, google));

    let mut app = build_router(state);
    if dev_cors {
        info!("dev mode, permissive CORS enabled");
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("gatehouse listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await
        .context("Server error")?;

    // The shutdown future has already passed the signal on; wait for the
    // supervisor to reap the gateway child before exiting.
    let _ = supervisor_task.await;
    info!("gatehouse stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM and forward that same signal to the
/// supervised gateway.
async fn shutdown_signal(supervisor: SupervisorHandle) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    let sig = tokio::select! {
        _ = ctrl_c => Signal::SIGINT,
        _ = terminate => Signal::SIGTERM,
    };
    info!("received {sig}, shutting down");
    supervisor.shutdown(sig).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockRunner;
    use crate::supervisor::GatewayPhase;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn test_router(root: &std::path::Path, phase: GatewayPhase) -> Router {
        let config = Config::new(root.join("home"), root.join("setup"), 3000, false);
        config.ensure_directories().unwrap();
        let agent: Arc<dyn CommandRunner> = Arc::new(MockRunner::new());
        let google: Arc<dyn CommandRunner> = Arc::new(MockRunner::new());
        let state = Arc::new(AppState::new(
            config,
            SupervisorHandle::fixed(phase),
            agent,
            google,
        ));
        build_router(state)
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let dir = tempdir().unwrap();
        let app = test_router(dir.path(), GatewayPhase::NotStarted);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "starting");
        assert_eq!(body["gateway"], "not_started");
    }

    #[tokio::test]
    async fn test_control_routes_win_over_passthrough() {
        // Served locally even though the gateway is down.
        let dir = tempdir().unwrap();
        let app = test_router(dir.path(), GatewayPhase::NotStarted);
        let req = Request::builder()
            .uri("/api/onboard/status")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["onboarded"], false);
    }

    #[tokio::test]
    async fn test_unclaimed_routes_fall_through_to_proxy() {
        let dir = tempdir().unwrap();
        let app = test_router(dir.path(), GatewayPhase::NotStarted);
        let req = Request::builder()
            .uri("/webhook/telegram")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "Gateway unavailable");
        assert_eq!(body["starting"], false);
    }

    #[tokio::test]
    async fn test_unknown_api_paths_also_proxied() {
        // Only the declared control routes are claimed; the gateway keeps
        // its own /api namespace.
        let dir = tempdir().unwrap();
        let app = test_router(dir.path(), GatewayPhase::Starting);
        let req = Request::builder()
            .uri("/api/sessions/list")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(resp).await;
        assert_eq!(body["starting"], true);
    }
}
