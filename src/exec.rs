//! Agent CLI subprocess execution.
//!
//! Every interaction with the backend CLIs goes through [`CommandRunner`]:
//! arguments are passed as vectors (never a shell string), each invocation
//! carries a hard timeout, and the normalized [`CmdOutput`] never panics the
//! caller. Logged command lines and output previews are redacted so tokens
//! and API keys stay out of the logs.

use crate::envfile::EnvFile;
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default timeout for status-class commands (listings, probes).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest output prefix echoed into the logs.
const LOG_PREVIEW_CHARS: usize = 200;

static SK_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sk-[A-Za-z0-9_-]{8,}").unwrap());

static GITHUB_TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(gh[pousr]_[A-Za-z0-9]{16,}|github_pat_[A-Za-z0-9_]{16,})").unwrap());

static BOT_TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{8,10}:[A-Za-z0-9_-]{30,}\b").unwrap());

static REMOTE_CREDENTIAL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://[^@/\s]+@").unwrap());

/// Normalized result of one subprocess invocation.
///
/// `ok` is true iff the process exited zero within its timeout. Spawn
/// failures and timeouts fold into `ok = false` with a synthetic stderr so
/// callers handle exactly one shape.
#[derive(Debug, Clone, Serialize)]
pub struct CmdOutput {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "exitCode")]
    pub code: Option<i32>,
}

impl CmdOutput {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            stdout: String::new(),
            stderr: message.into(),
            code: None,
        }
    }
}

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct ExecOpts {
    pub timeout: Duration,
    pub extra_env: Vec<(String, String)>,
    /// Suppress the output preview (used where stdout may carry secrets).
    pub quiet: bool,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            extra_env: Vec::new(),
            quiet: false,
        }
    }
}

impl ExecOpts {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((key.into(), value.into()));
        self
    }
}

/// Seam for invoking an external CLI.
///
/// Production uses [`AgentCli`]; tests swap in a scripted mock so handler
/// and orchestrator behavior can be exercised without real binaries.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[&str], opts: ExecOpts) -> CmdOutput;
}

/// Runs a named binary with a fixed environment overlay.
///
/// When an [`EnvFile`] is attached, its current contents are applied before
/// the fixed overlay on every spawn, so variables persisted mid-flight (by
/// onboarding) reach the very next invocation. Fixed entries always win.
pub struct AgentCli {
    bin: String,
    base_env: Vec<(String, String)>,
    env_file: Option<EnvFile>,
}

impl AgentCli {
    pub fn new(bin: impl Into<String>, base_env: Vec<(String, String)>) -> Self {
        Self {
            bin: bin.into(),
            base_env,
            env_file: None,
        }
    }

    pub fn with_env_file(mut self, env_file: EnvFile) -> Self {
        self.env_file = Some(env_file);
        self
    }
}

#[async_trait]
impl CommandRunner for AgentCli {
    async fn run(&self, args: &[&str], opts: ExecOpts) -> CmdOutput {
        info!(target: "exec", "{} {}", self.bin, redact_args(args).join(" "));

        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env_file) = &self.env_file {
            for (key, value) in env_file.load() {
                cmd.env(key, value);
            }
        }
        for (key, value) in self.base_env.iter().chain(opts.extra_env.iter()) {
            cmd.env(key, value);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(target: "exec", "failed to spawn {}: {e}", self.bin);
                return CmdOutput::failure(format!("failed to spawn {}: {e}", self.bin));
            }
        };

        // Dropping the in-flight future on timeout kills the child via
        // kill_on_drop.
        let output = match timeout(opts.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(target: "exec", "failed to collect output from {}: {e}", self.bin);
                return CmdOutput::failure(format!("failed to collect output: {e}"));
            }
            Err(_) => {
                warn!(
                    target: "exec",
                    "{} timed out after {}s", self.bin, opts.timeout.as_secs()
                );
                return CmdOutput::failure(format!(
                    "timed out after {}s",
                    opts.timeout.as_secs()
                ));
            }
        };

        let result = CmdOutput {
            ok: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            code: output.status.code(),
        };

        if !opts.quiet {
            if !result.stdout.is_empty() {
                debug!(target: "exec", "stdout: {}", preview(&redact(&result.stdout)));
            }
            if !result.stderr.is_empty() {
                debug!(target: "exec", "stderr: {}", preview(&redact(&result.stderr)));
            }
        }
        if !result.ok {
            warn!(
                target: "exec",
                "{} exited with {:?}: {}", self.bin, result.code, preview(&redact(&result.stderr))
            );
        }

        result
    }
}

/// Replace known secret shapes with placeholders.
pub fn redact(text: &str) -> String {
    let text = SK_KEY_REGEX.replace_all(text, "sk-***");
    let text = GITHUB_TOKEN_REGEX.replace_all(&text, "gh***");
    let text = BOT_TOKEN_REGEX.replace_all(&text, "***");
    REMOTE_CREDENTIAL_REGEX
        .replace_all(&text, "https://***@")
        .to_string()
}

/// Redact an argument vector for logging. Values following `--*-token`,
/// `--*-key`, and `--*-secret` flags are masked wholesale.
pub fn redact_args(args: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            out.push("***".to_string());
            mask_next = false;
            continue;
        }
        if arg.starts_with("--")
            && (arg.ends_with("-token") || arg.ends_with("-key") || arg.ends_with("-secret"))
        {
            mask_next = true;
            out.push(arg.to_string());
            continue;
        }
        out.push(redact(arg));
    }
    out
}

fn preview(s: &str) -> String {
    let mut out: String = s.chars().take(LOG_PREVIEW_CHARS).collect();
    if s.chars().count() > LOG_PREVIEW_CHARS {
        out.push_str("…[truncated]");
    }
    out
}

#[cfg(test)]
struct MockRule {
    prefix: String,
    output: CmdOutput,
    delay: Option<Duration>,
    effect: Option<Box<dyn Fn() + Send + Sync>>,
}

/// Scripted runner for exercising CLI-driven paths without real binaries.
/// Rules are matched against the joined argument vector by prefix, first
/// match wins; unknown invocations succeed with empty JSON output. A rule
/// may carry a side effect (run when matched) to simulate files the real
/// CLI would write, and a delay to hold an invocation in flight.
#[cfg(test)]
pub struct MockRunner {
    calls: std::sync::Mutex<Vec<String>>,
    rules: Vec<MockRule>,
}

#[cfg(test)]
impl MockRunner {
    pub fn new() -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
            rules: Vec::new(),
        }
    }

    pub fn respond(mut self, prefix: &str, output: CmdOutput) -> Self {
        self.rules.push(MockRule {
            prefix: prefix.to_string(),
            output,
            delay: None,
            effect: None,
        });
        self
    }

    pub fn respond_ok(self, prefix: &str, stdout: &str) -> Self {
        self.respond(prefix, Self::ok_output(stdout))
    }

    pub fn respond_err(self, prefix: &str, stderr: &str) -> Self {
        self.respond(
            prefix,
            CmdOutput {
                ok: false,
                stdout: String::new(),
                stderr: stderr.to_string(),
                code: Some(1),
            },
        )
    }

    pub fn respond_ok_with(
        mut self,
        prefix: &str,
        stdout: &str,
        effect: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.rules.push(MockRule {
            prefix: prefix.to_string(),
            output: Self::ok_output(stdout),
            delay: None,
            effect: Some(Box::new(effect)),
        });
        self
    }

    pub fn respond_ok_after(mut self, prefix: &str, stdout: &str, delay: Duration) -> Self {
        self.rules.push(MockRule {
            prefix: prefix.to_string(),
            output: Self::ok_output(stdout),
            delay: Some(delay),
            effect: None,
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn ok_output(stdout: &str) -> CmdOutput {
        CmdOutput {
            ok: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
            code: Some(0),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, args: &[&str], _opts: ExecOpts) -> CmdOutput {
        let key = args.join(" ");
        self.calls.lock().unwrap().push(key.clone());
        match self.rules.iter().find(|r| key.starts_with(&r.prefix)) {
            Some(rule) => {
                if let Some(delay) = rule.delay {
                    tokio::time::sleep(delay).await;
                }
                if let Some(effect) = &rule.effect {
                    effect();
                }
                rule.output.clone()
            }
            None => Self::ok_output("{}"),
        }
    }
}
