//! Google authorization-code flow for the workspace account.
//!
//! The wrapper never holds Google tokens long term: the exchanged refresh
//! token is handed to the `gwc` CLI through a transient file, with a
//! direct token-file write as fallback when the import fails. Every
//! failure in the flow carries a user-facing message the API layer folds
//! into an error-page redirect.

use crate::config::Config;
use crate::errors::OauthError;
use crate::exec::{CommandRunner, ExecOpts};
use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use serde_json::Value;
use std::io::Write as _;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

/// Scopes requested for the workspace account.
const SCOPES: &[&str] = &[
    "openid",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/calendar",
    "https://www.googleapis.com/auth/drive",
    "https://www.googleapis.com/auth/contacts",
    "https://www.googleapis.com/auth/spreadsheets",
];

/// Provider endpoints, injectable so tests can stand in for Google.
#[derive(Debug, Clone)]
pub struct OauthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

impl Default for OauthEndpoints {
    fn default() -> Self {
        Self {
            auth_url: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            userinfo_url: "https://www.googleapis.com/oauth2/v2/userinfo".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Google connection state surfaced to the setup UI.
#[derive(Debug, serde::Serialize)]
pub struct GoogleStatus {
    pub has_credentials: bool,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

struct Credentials {
    client_id: String,
    client_secret: String,
}

pub struct GoogleOauth {
    config: Config,
    google: Arc<dyn CommandRunner>,
    http: reqwest::Client,
    endpoints: OauthEndpoints,
}

impl GoogleOauth {
    pub fn new(config: Config, google: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            google,
            http: reqwest::Client::new(),
            endpoints: OauthEndpoints::default(),
        }
    }

    #[cfg(test)]
    pub fn with_endpoints(mut self, endpoints: OauthEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Build the consent-screen URL for a flow anchored at `base_url`.
    /// `access_type=offline` with `prompt=consent` forces Google to mint a
    /// refresh token even for repeat authorizations.
    pub fn start_url(&self, base_url: &str, email: Option<&str>) -> Result<String, OauthError> {
        let credentials = self.load_credentials()?;
        let email = email.unwrap_or_default().trim();
        let mut url = Url::parse(&self.endpoints.auth_url)
            .map_err(|e| OauthError::Provider(format!("bad auth endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &credentials.client_id)
            .append_pair("redirect_uri", &redirect_uri(base_url))
            .append_pair("response_type", "code")
            .append_pair("scope", &SCOPES.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", &encode_state(email));
        if !email.is_empty() {
            url.query_pairs_mut().append_pair("login_hint", email);
        }
        Ok(url.into())
    }

    /// Exchange the authorization code and hand the refresh token to the
    /// CLI. Returns the connected account email.
    pub async fn complete(
        &self,
        base_url: &str,
        code: &str,
        state: &str,
    ) -> Result<String, OauthError> {
        let credentials = self.load_credentials()?;
        let token = self.exchange_code(&credentials, base_url, code).await?;
        let access_token = token
            .access_token
            .as_deref()
            .ok_or_else(|| OauthError::Exchange("response carried no access token".to_string()))?;
        let refresh_token = token
            .refresh_token
            .as_deref()
            .ok_or(OauthError::NoRefreshToken)?;

        let mut email = decode_state_email(state);
        if email.is_empty() {
            email = self.fetch_email(access_token).await.unwrap_or_default();
        }
        if email.is_empty() {
            return Err(OauthError::Provider(
                "could not determine the account email".to_string(),
            ));
        }

        if let Err(detail) = self.import_token(&email, refresh_token).await {
            warn!("token import failed, writing token file directly: {detail}");
            self.write_token_fallback(&email, refresh_token, token.expires_in)
                .map_err(OauthError::Other)?;
        }
        self.update_state(&email).map_err(OauthError::Other)?;
        info!("google account {email} connected");
        Ok(email)
    }

    /// Connection state for the setup UI. Account listing goes through the
    /// CLI; the persisted state file only backfills the email.
    pub async fn status(&self) -> GoogleStatus {
        let has_credentials = self.config.google_credentials_file().exists();
        if !has_credentials {
            return GoogleStatus {
                has_credentials: false,
                authenticated: false,
                email: None,
            };
        }
        let output = self
            .google
            .run(&["auth", "list", "--plain"], ExecOpts::default())
            .await;
        let mut authenticated = false;
        let mut email = None;
        if output.ok
            && !output.stdout.is_empty()
            && !output.stdout.to_lowercase().contains("no accounts")
        {
            authenticated = true;
            email = output
                .stdout
                .lines()
                .next()
                .and_then(|line| line.split('\t').next())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
        }
        if email.is_none() {
            email = self.state_email();
        }
        GoogleStatus {
            has_credentials,
            authenticated,
            email,
        }
    }

    /// Persist OAuth client credentials in Google's `web` shape, register
    /// them with the CLI, and remember which account they belong to. The
    /// written file is the source of truth; a failed CLI registration is
    /// logged but does not undo the save.
    pub async fn save_credentials(
        &self,
        base_url: &str,
        client_id: &str,
        client_secret: &str,
        email: &str,
    ) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.config.google_dir())
            .context("failed to create google config directory")?;
        let payload = serde_json::json!({
            "web": {
                "client_id": client_id,
                "client_secret": client_secret,
                "auth_uri": "https://accounts.google.com/o/oauth2/auth",
                "token_uri": "https://oauth2.googleapis.com/token",
                "redirect_uris": [redirect_uri(base_url)],
            }
        });
        let path = self.config.google_credentials_file();
        std::fs::write(&path, serde_json::to_string_pretty(&payload)?)
            .with_context(|| format!("failed to write {}", path.display()))?;

        let path_arg = path.to_string_lossy().to_string();
        let registered = self
            .google
            .run(&["auth", "credentials", "set", &path_arg], ExecOpts::default())
            .await;
        if !registered.ok {
            warn!(
                "credential registration with the cli failed: {}",
                if registered.stderr.is_empty() {
                    &registered.stdout
                } else {
                    &registered.stderr
                }
            );
        }

        let state = serde_json::json!({ "email": email, "client_id": client_id });
        std::fs::write(
            self.config.google_state_file(),
            serde_json::to_string_pretty(&state)?,
        )
        .context("failed to write google state")?;
        info!("google credentials saved for {email}");
        Ok(())
    }

    fn load_credentials(&self) -> Result<Credentials, OauthError> {
        let path = self.config.google_credentials_file();
        let raw = std::fs::read_to_string(&path).map_err(|_| {
            OauthError::MissingCredentials("save them from the setup page first".to_string())
        })?;
        parse_credentials(&raw)
    }

    async fn exchange_code(
        &self,
        credentials: &Credentials,
        base_url: &str,
        code: &str,
    ) -> Result<TokenResponse, OauthError> {
        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&[
                ("code", code),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("redirect_uri", redirect_uri(base_url).as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .map_err(|e| OauthError::Exchange(format!("token request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(OauthError::Exchange(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| OauthError::Exchange(format!("unreadable token response: {e}")))
    }

    async fn fetch_email(&self, access_token: &str) -> Option<String> {
        #[derive(Deserialize)]
        struct UserInfo {
            email: Option<String>,
        }
        let response = self
            .http
            .get(&self.endpoints.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            warn!("userinfo probe returned {}", response.status());
            return None;
        }
        response.json::<UserInfo>().await.ok()?.email
    }

    /// Hand the refresh token to the CLI through a transient file. The
    /// file is removed when this returns, on either path.
    async fn import_token(&self, email: &str, refresh_token: &str) -> Result<(), String> {
        let mut file = tempfile::NamedTempFile::new().map_err(|e| e.to_string())?;
        let payload = serde_json::json!({
            "email": email,
            "refresh_token": refresh_token,
            "client": "default",
        });
        file.write_all(payload.to_string().as_bytes())
            .map_err(|e| e.to_string())?;
        let path = file.path().to_string_lossy().to_string();
        let output = self
            .google
            .run(&["auth", "tokens", "import", &path], ExecOpts::default().quiet())
            .await;
        if output.ok {
            Ok(())
        } else if output.stderr.is_empty() {
            Err(format!("exit code {:?}", output.code))
        } else {
            Err(output.stderr)
        }
    }

    fn write_token_fallback(
        &self,
        email: &str,
        refresh_token: &str,
        expires_in: Option<i64>,
    ) -> anyhow::Result<()> {
        let expiry = chrono::Utc::now() + chrono::Duration::seconds(expires_in.unwrap_or(3600));
        let payload = serde_json::json!({
            "refresh_token": refresh_token,
            "token_type": "Bearer",
            "expiry": expiry.to_rfc3339(),
        });
        let path = self.config.google_token_file(email);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&payload)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn update_state(&self, email: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.config.google_dir())?;
        let payload = serde_json::json!({ "email": email, "authenticated": true });
        std::fs::write(
            self.config.google_state_file(),
            serde_json::to_string_pretty(&payload)?,
        )
        .context("failed to write google state")?;
        Ok(())
    }

    fn state_email(&self) -> Option<String> {
        let raw = std::fs::read_to_string(self.config.google_state_file()).ok()?;
        let value: Value = serde_json::from_str(&raw).ok()?;
        value
            .get("email")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

fn redirect_uri(base_url: &str) -> String {
    format!("{}/auth/google/callback", base_url.trim_end_matches('/'))
}

/// Credentials files come in Google's `web`/`installed` wrapping or flat.
fn parse_credentials(raw: &str) -> Result<Credentials, OauthError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| OauthError::Provider(format!("credentials file unreadable: {e}")))?;
    let node = value
        .get("web")
        .or_else(|| value.get("installed"))
        .unwrap_or(&value);
    let client_id = node.get("client_id").and_then(Value::as_str).unwrap_or("");
    let client_secret = node
        .get("client_secret")
        .and_then(Value::as_str)
        .unwrap_or("");
    if client_id.is_empty() || client_secret.is_empty() {
        return Err(OauthError::Provider(
            "credentials file lacks client_id or client_secret".to_string(),
        ));
    }
    Ok(Credentials {
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
    })
}

/// The state round-trips the email through the consent screen.
fn encode_state(email: &str) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::json!({ "email": email }).to_string())
}

fn decode_state_email(state: &str) -> String {
    URL_SAFE_NO_PAD
        .decode(state)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .and_then(|value| {
            value
                .get("email")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default()
}
