//! The onboarding pipeline.
//!
//! A single request turns a blank container into a provisioned agent:
//! validate, persist variables, make the workspace repository reachable,
//! turn the data directory into a git repository, provision the backend,
//! select a model, then a tail of best-effort finishing steps. Steps run
//! strictly in order. Failures up to and including model selection abort
//! the run with a typed error; the finishing steps record a degraded
//! result and keep going. At most one run may be in flight.

pub mod cron;
pub mod github;
pub mod validation;
pub mod workspace;

use crate::config::Config;
use crate::envfile::EnvFile;
use crate::errors::OnboardError;
use crate::exec::{CmdOutput, CommandRunner, ExecOpts};
use crate::supervisor::SupervisorHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Provisioning may install packages and fetch models.
pub const PROVISION_TIMEOUT: Duration = Duration::from_secs(120);
/// Model selection only talks to the local gateway.
pub const MODEL_SET_TIMEOUT: Duration = Duration::from_secs(30);

/// One submitted environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarPair {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Degraded,
}

/// Typed outcome of one pipeline step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: &'static str,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Ordered per-step report returned on success. Fatal failures never
/// produce a report; they surface as an [`OnboardError`] instead.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OnboardReport {
    pub steps: Vec<StepResult>,
}

impl OnboardReport {
    fn ok(&mut self, step: &'static str) {
        self.steps.push(StepResult {
            step,
            status: StepStatus::Ok,
            detail: None,
        });
    }

    fn degraded(&mut self, step: &'static str, detail: impl Into<String>) {
        let detail = detail.into();
        warn!("onboarding step {step} degraded: {detail}");
        self.steps.push(StepResult {
            step,
            status: StepStatus::Degraded,
            detail: Some(detail),
        });
    }

    fn record(&mut self, step: &'static str, result: anyhow::Result<()>) {
        match result {
            Ok(()) => self.ok(step),
            Err(e) => self.degraded(step, format!("{e:#}")),
        }
    }
}

pub struct OnboardRequest {
    pub vars: Vec<VarPair>,
    pub model_key: String,
    /// Public origin of the request, rendered into the skill and the
    /// gateway configuration.
    pub base_url: String,
}

/// Runs the pipeline against one [`Config`].
pub struct Onboarder {
    config: Config,
    env_file: EnvFile,
    agent: Arc<dyn CommandRunner>,
    supervisor: SupervisorHandle,
    http: reqwest::Client,
    github_api_base: String,
    in_flight: Mutex<()>,
}

impl Onboarder {
    pub fn new(
        config: Config,
        env_file: EnvFile,
        agent: Arc<dyn CommandRunner>,
        supervisor: SupervisorHandle,
    ) -> Self {
        Self {
            config,
            env_file,
            agent,
            supervisor,
            http: reqwest::Client::new(),
            github_api_base: github::API_BASE.to_string(),
            in_flight: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn with_github_api_base(mut self, base: &str) -> Self {
        self.github_api_base = base.to_string();
        self
    }

    /// Run the pipeline once. A second request while one is in flight
    /// fails fast instead of queueing, and a completed system conflicts.
    pub async fn run(&self, request: OnboardRequest) -> Result<OnboardReport, OnboardError> {
        let _guard = self
            .in_flight
            .try_lock()
            .map_err(|_| OnboardError::InFlight)?;
        if self.config.is_onboarded() {
            return Err(OnboardError::AlreadyOnboarded);
        }

        info!("onboarding started");
        let mut report = OnboardReport::default();

        let input = validation::validate(&self.config, &request.vars, &request.model_key)?;
        report.ok("validate");

        self.persist_vars(&request.vars, &input.repo)
            .map_err(OnboardError::Other)?;
        report.ok("persist_vars");

        github::ensure_repo(
            &self.http,
            &self.github_api_base,
            &input.repo,
            &input.github_token,
        )
        .await?;
        report.ok("ensure_repo");

        let remote = workspace::remote_url(&input.repo, &input.github_token);
        workspace::init_data_repo(&self.config, &remote)
            .and_then(|()| workspace::copy_gitignore_template(&self.config))
            .map_err(|e| OnboardError::Workspace(format!("{e:#}")))?;
        report.ok("init_workspace");

        let args = build_onboard_args(&self.config, &input);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .agent
            .run(&arg_refs, ExecOpts::with_timeout(PROVISION_TIMEOUT))
            .await;
        if !output.ok {
            return Err(OnboardError::Provision(describe_failure(&output)));
        }
        report.ok("provision");

        let output = self
            .agent
            .run(
                &["models", "set", &request.model_key],
                ExecOpts::with_timeout(MODEL_SET_TIMEOUT),
            )
            .await;
        if !output.ok {
            return Err(OnboardError::ModelSelection {
                model: request.model_key.clone(),
                detail: describe_failure(&output),
            });
        }
        report.ok("select_model");

        report.record("clean_workspace", workspace::clean_workspace_git(&self.config));

        // The backend wrote its configuration during provisioning; a
        // missing file here means provisioning lied about succeeding.
        workspace::write_sanitized_config(&self.config, &input.var_map)
            .and_then(|()| workspace::ensure_gateway_base_url(&self.config, &request.base_url))
            .map_err(OnboardError::Other)?;
        report.ok("sanitize_config");

        let mut doc_errors = Vec::new();
        for (file, marker) in [("AGENTS.md", "Operating Rules"), ("TOOLS.md", "Git Discipline")] {
            if let Err(e) = workspace::append_template_if_missing(&self.config, file, file, marker)
            {
                doc_errors.push(format!("{file}: {e:#}"));
            }
        }
        if doc_errors.is_empty() {
            report.ok("workspace_docs");
        } else {
            report.degraded("workspace_docs", doc_errors.join("; "));
        }

        report.record(
            "control_ui_skill",
            workspace::install_skill(&self.config, &request.base_url),
        );

        report.record("commit_push", workspace::commit_and_push(&self.config).await);

        report.record(
            "sync_cron",
            cron::install_sync_script(&self.config)
                .and_then(|()| cron::install_sync_cron(&self.config)),
        );

        self.supervisor.restart().await;
        report.ok("restart_gateway");

        info!("onboarding finished");
        Ok(report)
    }

    /// Persist non-empty submitted variables plus the normalized repo
    /// reference. The raw repo input never lands in the file.
    fn persist_vars(&self, vars: &[VarPair], repo: &str) -> anyhow::Result<()> {
        let mut entries: Vec<(String, String)> = vars
            .iter()
            .filter(|v| !v.value.trim().is_empty() && v.key != "GITHUB_WORKSPACE_REPO")
            .map(|v| (v.key.clone(), v.value.clone()))
            .collect();
        entries.push(("GITHUB_WORKSPACE_REPO".to_string(), repo.to_string()));
        self.env_file.merge(&entries)
    }
}

/// Arguments for the backend provisioning command. Secrets ride in flag
/// values, which the exec logger masks.
fn build_onboard_args(config: &Config, input: &validation::ValidatedInput) -> Vec<String> {
    let mut args = vec![
        "onboard".to_string(),
        "--non-interactive".to_string(),
        "--workspace".to_string(),
        config.workspace_dir.display().to_string(),
        "--provider".to_string(),
        input.provider.clone(),
    ];
    for (flag, key) in [
        ("--anthropic-key", "ANTHROPIC_API_KEY"),
        ("--anthropic-token", "ANTHROPIC_TOKEN"),
        ("--openai-key", "OPENAI_API_KEY"),
        ("--gemini-key", "GEMINI_API_KEY"),
        ("--telegram-token", "TELEGRAM_BOT_TOKEN"),
        ("--discord-token", "DISCORD_BOT_TOKEN"),
    ] {
        if let Some(value) = input.var_map.get(key).filter(|v| !v.trim().is_empty()) {
            args.push(flag.to_string());
            args.push(value.clone());
        }
    }
    if input.provider == "openai-codex" && input.has_codex_oauth {
        args.push("--codex-oauth".to_string());
    }
    args
}

fn describe_failure(output: &CmdOutput) -> String {
    if !output.stderr.is_empty() {
        output.stderr.clone()
    } else if !output.stdout.is_empty() {
        output.stdout.clone()
    } else {
        match output.code {
            Some(code) => format!("exit code {code}"),
            None => "no output".to_string(),
        }
    }
}
