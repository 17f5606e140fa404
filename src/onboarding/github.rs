//! Workspace repository checks against the GitHub API.

use crate::errors::OnboardError;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::info;

pub const API_BASE: &str = "https://api.github.com";

const USER_AGENT: &str = "gatehouse";

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

/// Verify the workspace repository is reachable with the supplied token,
/// creating it as a private repository when it does not exist yet.
pub async fn ensure_repo(
    client: &reqwest::Client,
    api_base: &str,
    repo: &str,
    token: &str,
) -> Result<(), OnboardError> {
    let check = client
        .get(format!("{api_base}/repos/{repo}"))
        .header("Authorization", format!("token {token}"))
        .header("Accept", "application/vnd.github+json")
        .header("User-Agent", USER_AGENT)
        .send()
        .await
        .map_err(transport)?;

    if check.status() == StatusCode::NOT_FOUND {
        return create_repo(client, api_base, repo, token).await;
    }
    if check.status().is_success() {
        return Ok(());
    }
    Err(OnboardError::Github(format!(
        "Cannot access repo \"{repo}\" - check your token has the \"repo\" scope"
    )))
}

async fn create_repo(
    client: &reqwest::Client,
    api_base: &str,
    repo: &str,
    token: &str,
) -> Result<(), OnboardError> {
    let name = repo.split('/').nth(1).unwrap_or(repo);
    info!("workspace repo {repo} not found, creating it");
    let response = client
        .post(format!("{api_base}/user/repos"))
        .header("Authorization", format!("token {token}"))
        .header("Accept", "application/vnd.github+json")
        .header("User-Agent", USER_AGENT)
        .json(&serde_json::json!({ "name": name, "private": true, "auto_init": false }))
        .send()
        .await
        .map_err(transport)?;

    if !response.status().is_success() {
        let fallback = response
            .status()
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string();
        let message = response
            .json::<ApiErrorBody>()
            .await
            .ok()
            .and_then(|body| body.message)
            .unwrap_or(fallback);
        return Err(OnboardError::Github(format!(
            "Failed to create repo: {message}"
        )));
    }
    info!("created private repo {repo}");
    Ok(())
}

fn transport(e: reqwest::Error) -> OnboardError {
    OnboardError::Github(format!("GitHub error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_existing_repo_is_accepted() {
        let router = Router::new().route(
            "/repos/{owner}/{repo}",
            get(|| async { Json(serde_json::json!({"full_name": "acme/agent-data"})) }),
        );
        let base = serve(router).await;

        let client = reqwest::Client::new();
        ensure_repo(&client, &base, "acme/agent-data", "ghp_token")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_repo_is_created_private() {
        let captured: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
        let router = Router::new()
            .route("/repos/{owner}/{repo}", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/user/repos",
                post(
                    |State(captured): State<Arc<Mutex<Option<serde_json::Value>>>>,
                     Json(body): Json<serde_json::Value>| async move {
                        *captured.lock().unwrap() = Some(body);
                        (StatusCode::CREATED, Json(serde_json::json!({})))
                    },
                ),
            )
            .with_state(captured.clone());
        let base = serve(router).await;

        let client = reqwest::Client::new();
        ensure_repo(&client, &base, "acme/agent-data", "ghp_token")
            .await
            .unwrap();

        let body = captured.lock().unwrap().take().unwrap();
        assert_eq!(body["name"], "agent-data");
        assert_eq!(body["private"], true);
        assert_eq!(body["auto_init"], false);
    }

    #[tokio::test]
    async fn test_create_failure_reports_api_message() {
        let router = Router::new()
            .route("/repos/{owner}/{repo}", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/user/repos",
                post(|| async {
                    (
                        StatusCode::UNPROCESSABLE_ENTITY,
                        Json(serde_json::json!({"message": "name already exists on this account"})),
                    )
                }),
            );
        let base = serve(router).await;

        let client = reqwest::Client::new();
        let err = ensure_repo(&client, &base, "acme/agent-data", "ghp_token")
            .await
            .unwrap_err();
        assert!(matches!(err, OnboardError::Github(_)));
        assert_eq!(
            err.to_string(),
            "Failed to create repo: name already exists on this account"
        );
    }

    #[tokio::test]
    async fn test_inaccessible_repo_mentions_token_scope() {
        let router = Router::new()
            .route("/repos/{owner}/{repo}", get(|| async { StatusCode::FORBIDDEN }));
        let base = serve(router).await;

        let client = reqwest::Client::new();
        let err = ensure_repo(&client, &base, "acme/agent-data", "ghp_token")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("\"repo\" scope"));
    }

    #[tokio::test]
    async fn test_unreachable_api_is_transport_error() {
        let client = reqwest::Client::new();
        let err = ensure_repo(&client, "http://127.0.0.1:1", "acme/agent-data", "ghp_token")
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("GitHub error:"));
    }
}
