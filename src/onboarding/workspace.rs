//! Filesystem and git steps of the onboarding pipeline.
//!
//! The data directory is the durable unit: it becomes a git repository on
//! `main` whose `origin` remote embeds the GitHub token, and the agent's
//! workspace lives inside it. Templates come from the read-only setup
//! directory.

use crate::config::Config;
use crate::exec;
use anyhow::{Context, Result, anyhow, bail};
use git2::{Repository, RepositoryInitOptions};
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Commit identity for the data repository.
const GIT_USER_EMAIL: &str = "agent@heron.local";
const GIT_USER_NAME: &str = "Heron Agent";

/// Hard cap on the initial push; a wedged remote must not stall onboarding.
const GIT_PUSH_TIMEOUT: Duration = Duration::from_secs(30);

static SECRET_KEY_REGEX: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"(?i)(token|key|secret|password)").unwrap());

/// Remote URL with the token embedded as a credential. Never log this raw.
pub fn remote_url(repo: &str, token: &str) -> String {
    format!("https://{token}@github.com/{repo}.git")
}

/// Initialize the data directory as a git repository on `main` with an
/// `origin` remote and a local commit identity. An already-initialized
/// repository is left untouched.
pub fn init_data_repo(config: &Config, remote: &str) -> Result<()> {
    std::fs::create_dir_all(&config.workspace_dir)
        .with_context(|| format!("failed to create {}", config.workspace_dir.display()))?;
    if config.data_dir.join(".git").exists() {
        debug!("data repository already initialized");
        return Ok(());
    }
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(&config.data_dir, &opts)
        .with_context(|| format!("failed to init repository in {}", config.data_dir.display()))?;
    repo.remote("origin", remote)
        .context("failed to add origin remote")?;
    let mut git_config = repo.config().context("failed to open repository config")?;
    git_config.set_str("user.email", GIT_USER_EMAIL)?;
    git_config.set_str("user.name", GIT_USER_NAME)?;
    info!("initialized data repository at {}", config.data_dir.display());
    Ok(())
}

/// Copy the default ignore file into the data repository if none exists.
/// Without it the initial commit would pick up `.env` and friends.
pub fn copy_gitignore_template(config: &Config) -> Result<()> {
    let target = config.data_dir.join(".gitignore");
    if target.exists() {
        return Ok(());
    }
    let template = config.template("gitignore");
    std::fs::copy(&template, &target)
        .with_context(|| format!("failed to copy {}", template.display()))?;
    Ok(())
}

/// Append a template to a workspace document when its marker section is
/// missing. Returns whether content was appended.
pub fn append_template_if_missing(
    config: &Config,
    file_name: &str,
    template_name: &str,
    marker: &str,
) -> Result<bool> {
    let target = config.workspace_dir.join(file_name);
    let current = match std::fs::read_to_string(&target) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", target.display()));
        }
    };
    if current.contains(marker) {
        return Ok(false);
    }
    let template = config.template(template_name);
    let addition = std::fs::read_to_string(&template)
        .with_context(|| format!("failed to read {}", template.display()))?;
    let mut updated = current;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&addition);
    std::fs::write(&target, updated)
        .with_context(|| format!("failed to write {}", target.display()))?;
    info!("appended {template_name} section to {file_name}");
    Ok(true)
}

/// Render the control-UI skill with the public base URL substituted.
pub fn install_skill(config: &Config, base_url: &str) -> Result<()> {
    let template = config.template("skills/control-ui/SKILL.md");
    let body = std::fs::read_to_string(&template)
        .with_context(|| format!("failed to read {}", template.display()))?;
    let skill_file = config.skill_file();
    if let Some(parent) = skill_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&skill_file, body.replace("{{BASE_URL}}", base_url))
        .with_context(|| format!("failed to write {}", skill_file.display()))?;
    info!("installed control-ui skill");
    Ok(())
}

/// Drop scratch git metadata the provisioner may have left in the
/// workspace. History is tracked by the data repository above it.
pub fn clean_workspace_git(config: &Config) -> Result<()> {
    let scratch = config.workspace_dir.join(".git");
    match std::fs::remove_dir_all(&scratch) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", scratch.display())),
    }
}

/// Write a secrets-free copy of the agent configuration next to the real
/// one. String values under secret-named keys, and any string equal to a
/// submitted secret value, are replaced with `***`.
pub fn write_sanitized_config(config: &Config, var_map: &HashMap<String, String>) -> Result<()> {
    let source = config.agent_config_file();
    let raw = std::fs::read_to_string(&source)
        .with_context(|| format!("failed to read {}", source.display()))?;
    let mut value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", source.display()))?;
    let secret_values: HashSet<&str> = var_map
        .iter()
        .filter(|(key, value)| SECRET_KEY_REGEX.is_match(key) && !value.is_empty())
        .map(|(_, value)| value.as_str())
        .collect();
    mask_secrets(&mut value, &secret_values);
    let target = config.sanitized_config_file();
    std::fs::write(&target, serde_json::to_string_pretty(&value)?)
        .with_context(|| format!("failed to write {}", target.display()))?;
    Ok(())
}

fn mask_secrets(value: &mut Value, secret_values: &HashSet<&str>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                let hit = matches!(
                    child,
                    Value::String(s)
                        if SECRET_KEY_REGEX.is_match(key) || secret_values.contains(s.as_str())
                );
                if hit {
                    *child = Value::String("***".to_string());
                } else {
                    mask_secrets(child, secret_values);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                mask_secrets(item, secret_values);
            }
        }
        Value::String(s) => {
            if secret_values.contains(s.as_str()) {
                *value = Value::String("***".to_string());
            }
        }
        _ => {}
    }
}

/// Ensure the agent configuration carries the gateway's public base URL.
/// Rewrites the file only when the value actually changes.
pub fn ensure_gateway_base_url(config: &Config, base_url: &str) -> Result<()> {
    let path = config.agent_config_file();
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let root = value
        .as_object_mut()
        .ok_or_else(|| anyhow!("agent configuration is not a JSON object"))?;
    let gateway = root
        .entry("gateway")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let gateway = gateway
        .as_object_mut()
        .ok_or_else(|| anyhow!("gateway section is not a JSON object"))?;
    if gateway.get("base_url").and_then(Value::as_str) == Some(base_url) {
        return Ok(());
    }
    gateway.insert("base_url".to_string(), Value::String(base_url.to_string()));
    std::fs::write(&path, serde_json::to_string_pretty(&value)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!("gateway base url set to {base_url}");
    Ok(())
}

/// Commit everything in the data repository and force-push `main`.
pub async fn commit_and_push(config: &Config) -> Result<()> {
    run_git(config, &["add", "-A"], None).await?;
    run_git(config, &["commit", "-m", "initial setup"], None).await?;
    run_git(
        config,
        &["push", "-u", "--force", "origin", "main"],
        Some(GIT_PUSH_TIMEOUT),
    )
    .await?;
    info!("pushed initial workspace state");
    Ok(())
}

async fn run_git(config: &Config, args: &[&str], limit: Option<Duration>) -> Result<()> {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(&config.data_dir).args(args).kill_on_drop(true);
    let output = match limit {
        Some(limit) => tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| anyhow!("git {} timed out after {}s", args.join(" "), limit.as_secs()))?
            .context("failed to run git")?,
        None => cmd.output().await.context("failed to run git")?,
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // The remote URL may appear here with its embedded token.
        bail!("git {} failed: {}", args.join(" "), exec::redact(stderr.trim()));
    }
    Ok(())
}
