//! Control API for the setup surface.
//!
//! A fixed set of local routes covers health, onboarding, pairing and
//! device approvals, and the Google account flow. Every other path is
//! left to the fallback, which pipes it through to the gateway.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::{error, warn};

use crate::config::Config;
use crate::envfile::EnvFile;
use crate::errors::{OauthError, OnboardError};
use crate::exec::{CmdOutput, CommandRunner, ExecOpts};
use crate::oauth::{GoogleOauth, GoogleStatus};
use crate::onboarding::{OnboardRequest, Onboarder, VarPair};
use crate::pairing::{PAIRING_CHANNELS, PairingGate, PendingPairing};
use crate::supervisor::{GatewayPhase, SupervisorHandle};

/// Connects are bounded so a dead gateway turns into a synthetic reply
/// instead of a hang; the overall exchange is not, because the gateway
/// streams long-lived responses.
const PROXY_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub config: Config,
    pub supervisor: SupervisorHandle,
    pub agent: Arc<dyn CommandRunner>,
    pub pairing: PairingGate,
    pub onboarder: Onboarder,
    pub oauth: GoogleOauth,
    /// Shared by the proxy and anything else talking HTTP out of process.
    pub http: reqwest::Client,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        config: Config,
        supervisor: SupervisorHandle,
        agent: Arc<dyn CommandRunner>,
        google: Arc<dyn CommandRunner>,
    ) -> Self {
        let env_file = EnvFile::new(config.env_file());
        let http = reqwest::Client::builder()
            .connect_timeout(PROXY_CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            pairing: PairingGate::new(config.clone(), agent.clone()),
            onboarder: Onboarder::new(
                config.clone(),
                env_file,
                agent.clone(),
                supervisor.clone(),
            ),
            oauth: GoogleOauth::new(config.clone(), google),
            config,
            supervisor,
            agent,
            http,
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ChannelBody {
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_channel() -> String {
    "telegram".to_string()
}

#[derive(Deserialize)]
pub struct OnboardBody {
    #[serde(default)]
    pub vars: Vec<VarPair>,
    #[serde(default, alias = "modelKey")]
    pub model_key: String,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct CredentialsBody {
    #[serde(alias = "clientId")]
    pub client_id: String,
    #[serde(alias = "clientSecret")]
    pub client_secret: String,
    pub email: String,
}

#[derive(Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub email: String,
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub error: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"ok": false, "error": message}))).into_response()
    }
}

impl From<OnboardError> for ApiError {
    fn from(e: OnboardError) -> Self {
        let message = e.to_string();
        match e {
            OnboardError::Validation(_) | OnboardError::Github(_) => ApiError::BadRequest(message),
            OnboardError::AlreadyOnboarded | OnboardError::InFlight => ApiError::Conflict(message),
            OnboardError::Provision(_)
            | OnboardError::ModelSelection { .. }
            | OnboardError::Workspace(_)
            | OnboardError::Other(_) => ApiError::Internal(message),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/setup", get(setup_page))
        .route("/api/status", get(status))
        .route("/api/gateway-status", get(gateway_status))
        .route("/api/pairings", get(list_pairings))
        .route("/api/pairings/{id}/approve", post(approve_pairing))
        .route("/api/pairings/{id}/reject", post(reject_pairing))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{id}/approve", post(approve_device))
        .route("/api/devices/{id}/reject", post(reject_device))
        .route("/api/onboard/status", get(onboard_status))
        .route("/api/onboard", post(onboard))
        .route("/api/google/status", get(google_status))
        .route("/api/google/credentials", post(google_credentials))
        .route("/auth/google/start", get(google_start))
        .route("/auth/google/callback", get(google_callback))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let status = state.supervisor.status();
    let healthy = status.phase == GatewayPhase::Running;
    Json(serde_json::json!({
        "status": if healthy { "healthy" } else { "starting" },
        "gateway": status.label(),
    }))
}

async fn setup_page() -> Html<&'static str> {
    Html(SETUP_PAGE)
}

async fn status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "gateway": state.supervisor.status().label(),
        "config_exists": state.config.is_onboarded(),
        "channels": channel_status(&state.config),
    }))
}

/// Deeper probe through the agent CLI, surfaced verbatim.
async fn gateway_status(State(state): State<SharedState>) -> Json<CmdOutput> {
    Json(state.agent.run(&["status"], ExecOpts::default()).await)
}

async fn list_pairings(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let pending: Vec<PendingPairing> = state.pairing.pending_pairings().await;
    Json(serde_json::json!({ "pending": pending }))
}

async fn approve_pairing(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Option<Json<ChannelBody>>,
) -> Json<CmdOutput> {
    let channel = channel_from(body);
    Json(state.pairing.approve_pairing(&channel, &id).await)
}

async fn reject_pairing(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Option<Json<ChannelBody>>,
) -> Json<CmdOutput> {
    let channel = channel_from(body);
    Json(state.pairing.reject_pairing(&channel, &id).await)
}

async fn list_devices(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let pending = state.pairing.pending_devices().await;
    Json(serde_json::json!({ "pending": pending }))
}

async fn approve_device(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Json<CmdOutput> {
    Json(state.pairing.approve_device(&id).await)
}

async fn reject_device(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Json<CmdOutput> {
    Json(state.pairing.reject_device(&id).await)
}

async fn onboard_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "onboarded": state.config.is_onboarded() }))
}

async fn onboard(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<OnboardBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = state
        .onboarder
        .run(OnboardRequest {
            vars: body.vars,
            model_key: body.model_key,
            base_url: request_origin(&headers),
        })
        .await?;
    Ok(Json(serde_json::json!({ "ok": true, "steps": report.steps })))
}

async fn google_status(State(state): State<SharedState>) -> Json<GoogleStatus> {
    Json(state.oauth.status().await)
}

async fn google_credentials(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<CredentialsBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (client_id, client_secret, email) = (
        body.client_id.trim(),
        body.client_secret.trim(),
        body.email.trim(),
    );
    if client_id.is_empty() || client_secret.is_empty() || email.is_empty() {
        return Err(ApiError::BadRequest("Missing fields".to_string()));
    }
    state
        .oauth
        .save_credentials(&request_origin(&headers), client_id, client_secret, email)
        .await
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn google_start(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<StartQuery>,
) -> Redirect {
    let email = query.email.trim();
    let email = (!email.is_empty()).then_some(email);
    match state.oauth.start_url(&request_origin(&headers), email) {
        Ok(url) => Redirect::to(&url),
        Err(e) => {
            warn!("google auth start failed: {e}");
            oauth_error_redirect(&e.to_string())
        }
    }
}

async fn google_callback(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Redirect {
    if !query.error.is_empty() {
        return oauth_error_redirect(&query.error);
    }
    if query.code.is_empty() {
        return oauth_error_redirect(&OauthError::MissingCode.to_string());
    }
    match state
        .oauth
        .complete(&request_origin(&headers), &query.code, &query.state)
        .await
    {
        Ok(_) => Redirect::to("/setup?google=success"),
        Err(e) => {
            error!("google oauth callback failed: {e}");
            oauth_error_redirect(&e.to_string())
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Public origin of the request: a fronting proxy hands us forwarded
/// headers, a direct client the Host it dialed.
fn request_origin(headers: &HeaderMap) -> String {
    let proto = header_str(headers, "x-forwarded-proto").unwrap_or("http");
    let host = header_str(headers, "x-forwarded-host")
        .or_else(|| headers.get(header::HOST).and_then(|v| v.to_str().ok()))
        .unwrap_or("localhost");
    format!("{proto}://{host}")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn channel_from(body: Option<Json<ChannelBody>>) -> String {
    body.map(|Json(b)| b.channel)
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(default_channel)
}

/// Channels the backend currently has enabled, keyed for the setup UI.
fn channel_status(config: &Config) -> serde_json::Map<String, serde_json::Value> {
    let mut channels = serde_json::Map::new();
    let Ok(raw) = std::fs::read_to_string(config.agent_config_file()) else {
        return channels;
    };
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return channels;
    };
    for channel in PAIRING_CHANNELS {
        if parsed["channels"][channel]["enabled"]
            .as_bool()
            .unwrap_or(false)
        {
            channels.insert(channel.to_string(), "configured".into());
        }
    }
    channels
}

fn oauth_error_redirect(message: &str) -> Redirect {
    Redirect::to(&format!(
        "/setup?google=error&message={}",
        urlencoding::encode(message)
    ))
}

/// Inline setup shell. The real UI lives behind the gateway once the
/// system is onboarded; this page only has to cover first boot.
const SETUP_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Gatehouse setup</title>
<style>
  body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 40rem; padding: 0 1rem; }
  code { background: #f2f2f2; padding: 0.1rem 0.3rem; border-radius: 3px; }
  .muted { color: #666; }
</style>
</head>
<body>
<h1>Gatehouse</h1>
<p id="gateway" class="muted">Checking gateway&hellip;</p>
<p>Control endpoints: <code>/api/status</code>, <code>/api/onboard</code>,
<code>/api/pairings</code>, <code>/api/devices</code>, <code>/api/google/status</code>.</p>
<script>
  fetch('/health').then(function (r) { return r.json(); }).then(function (h) {
    document.getElementById('gateway').textContent = 'Gateway: ' + h.gateway;
  }).catch(function () {});
  var q = new URLSearchParams(location.search);
  if (q.get('google')) {
    var p = document.createElement('p');
    p.textContent = q.get('google') === 'success'
      ? 'Google account connected.'
      : 'Google error: ' + (q.get('message') || 'unknown');
    document.body.appendChild(p);
  }
</script>
</body>
</html>
"#;

// ── Tests ─────────────────────────────────────────────────────────────
