//! Up-front validation of the onboarding request.
//!
//! Everything that can be rejected cheaply is rejected here, before any
//! file is written or any network call is made. The returned
//! [`ValidatedInput`] carries the extracted values the later steps need,
//! with the workspace repository already normalized to `owner/repo`.

use crate::config::Config;
use crate::errors::OnboardError;
use std::collections::HashMap;

use super::VarPair;

/// Submitted variables, extracted and normalized for the pipeline.
#[derive(Debug, Clone)]
pub struct ValidatedInput {
    pub var_map: HashMap<String, String>,
    pub github_token: String,
    /// Normalized `owner/repo` reference.
    pub repo: String,
    /// Provider prefix of the selected model key.
    pub provider: String,
    pub has_codex_oauth: bool,
}

/// Check the submitted variables against the selected model's provider and
/// the structural requirements of the pipeline.
pub fn validate(
    config: &Config,
    vars: &[VarPair],
    model_key: &str,
) -> Result<ValidatedInput, OnboardError> {
    let model_key = model_key.trim();
    if model_key.is_empty() || !model_key.contains('/') {
        return Err(OnboardError::Validation(
            "A model selection is required".to_string(),
        ));
    }

    let var_map: HashMap<String, String> = vars
        .iter()
        .map(|v| (v.key.clone(), v.value.clone()))
        .collect();
    let has = |key: &str| var_map.get(key).is_some_and(|v| !v.trim().is_empty());

    let provider = model_provider(model_key);
    let has_codex_oauth = config.codex_auth_file().exists();
    let provider_satisfied = match provider.as_str() {
        "anthropic" => has("ANTHROPIC_API_KEY") || has("ANTHROPIC_TOKEN"),
        "openai" => has("OPENAI_API_KEY"),
        "openai-codex" => has_codex_oauth || has("OPENAI_API_KEY"),
        "google" => has("GEMINI_API_KEY"),
        // Unknown providers accept whatever credential is configured.
        _ => {
            has("ANTHROPIC_API_KEY")
                || has("ANTHROPIC_TOKEN")
                || has("OPENAI_API_KEY")
                || has("GEMINI_API_KEY")
                || has_codex_oauth
        }
    };
    if !provider_satisfied {
        if provider == "openai-codex" {
            return Err(OnboardError::Validation(
                "Connect OpenAI Codex OAuth or provide OPENAI_API_KEY before continuing"
                    .to_string(),
            ));
        }
        return Err(OnboardError::Validation(format!(
            "Missing credentials for selected provider \"{provider}\""
        )));
    }

    let github_token = var_map
        .get("GITHUB_TOKEN")
        .map(|v| v.trim().to_string())
        .unwrap_or_default();
    let repo_input = var_map
        .get("GITHUB_WORKSPACE_REPO")
        .map(|v| v.trim())
        .unwrap_or_default();
    if github_token.is_empty() || repo_input.is_empty() {
        return Err(OnboardError::Validation(
            "GitHub token and workspace repo are required".to_string(),
        ));
    }
    let repo = normalize_repo(repo_input).ok_or_else(|| {
        OnboardError::Validation(format!(
            "Workspace repo \"{repo_input}\" is not an owner/repo reference"
        ))
    })?;

    if !has("TELEGRAM_BOT_TOKEN") && !has("DISCORD_BOT_TOKEN") {
        return Err(OnboardError::Validation(
            "At least one channel token is required".to_string(),
        ));
    }

    Ok(ValidatedInput {
        var_map,
        github_token,
        repo,
        provider,
        has_codex_oauth,
    })
}

/// Provider is the prefix of a `provider/model` key.
pub fn model_provider(model_key: &str) -> String {
    model_key.split('/').next().unwrap_or_default().to_string()
}

/// Reduce a repository reference (bare `owner/repo`, HTTPS or SSH remote
/// URL) to `owner/repo`. `None` when the shape is unrecognizable.
pub fn normalize_repo(input: &str) -> Option<String> {
    let mut rest = input.trim();
    for prefix in [
        "https://github.com/",
        "http://github.com/",
        "git@github.com:",
        "github.com/",
    ] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    let rest = rest.trim_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    let mut parts = rest.split('/');
    let owner = parts.next()?;
    let name = parts.next()?;
    if owner.is_empty() || name.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(format!("{owner}/{name}"))
}
