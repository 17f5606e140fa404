//! Channel pairing and device-request listing.
//!
//! Listing hits the agent CLI, which is expensive enough that the setup UI
//! polling it every few seconds would hurt: results are cached behind a
//! short TTL and refreshed as one snapshot. The refresh also carries the
//! one-time auto-trust decision for the first CLI device request, gated on
//! a persisted marker file so it can never fire twice.

use crate::config::Config;
use crate::exec::{CmdOutput, CommandRunner, ExecOpts};
use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a listing snapshot stays fresh.
pub const CACHE_TTL: Duration = Duration::from_secs(10);

/// Channels whose pairing queues are scanned, in order.
pub const PAIRING_CHANNELS: &[&str] = &["telegram", "discord"];

static PAIRING_CODE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z0-9]{8}").unwrap());

/// One outstanding channel pairing, identified by its 8-character code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingPairing {
    pub id: String,
    pub code: String,
    pub channel: String,
}

/// One outstanding device approval request as reported by the agent CLI.
///
/// Parsed from the CLI's camelCase JSON; serialized back out with the
/// request id exposed as `id` for the setup UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    #[serde(rename(serialize = "id", deserialize = "requestId"))]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<serde_json::Value>,
}

impl DeviceRequest {
    fn is_cli(&self) -> bool {
        self.client_mode.as_deref() == Some("cli")
    }
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    pending: Vec<DeviceRequest>,
}

#[derive(Clone)]
struct Snapshot {
    pairings: Vec<PendingPairing>,
    devices: Vec<DeviceRequest>,
    fetched_at: Instant,
}

/// Caches pending pairings and device requests, and owns the one-time CLI
/// device auto-approval.
pub struct PairingGate {
    config: Config,
    agent: Arc<dyn CommandRunner>,
    ttl: Duration,
    cache: Mutex<Option<Snapshot>>,
}

impl PairingGate {
    pub fn new(config: Config, agent: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            agent,
            ttl: CACHE_TTL,
            cache: Mutex::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn pending_pairings(&self) -> Vec<PendingPairing> {
        self.snapshot().await.pairings
    }

    pub async fn pending_devices(&self) -> Vec<DeviceRequest> {
        self.snapshot().await.devices
    }

    pub async fn approve_pairing(&self, channel: &str, id: &str) -> CmdOutput {
        let result = self
            .agent
            .run(&["pairing", "approve", channel, id], ExecOpts::default())
            .await;
        self.invalidate().await;
        result
    }

    pub async fn reject_pairing(&self, channel: &str, id: &str) -> CmdOutput {
        let result = self
            .agent
            .run(&["pairing", "reject", channel, id], ExecOpts::default())
            .await;
        self.invalidate().await;
        result
    }

    pub async fn approve_device(&self, id: &str) -> CmdOutput {
        let result = self
            .agent
            .run(&["devices", "approve", id], ExecOpts::default())
            .await;
        self.invalidate().await;
        result
    }

    pub async fn reject_device(&self, id: &str) -> CmdOutput {
        let result = self
            .agent
            .run(&["devices", "reject", id], ExecOpts::default())
            .await;
        self.invalidate().await;
        result
    }

    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    /// Return the cached snapshot, refreshing it when stale. The lock is
    /// held across the refresh so concurrent misses trigger one query
    /// round, not several.
    async fn snapshot(&self) -> Snapshot {
        let mut cache = self.cache.lock().await;
        if let Some(snap) = cache.as_ref() {
            if snap.fetched_at.elapsed() < self.ttl {
                return snap.clone();
            }
        }
        let snap = self.refresh().await;
        *cache = Some(snap.clone());
        snap
    }

    async fn refresh(&self) -> Snapshot {
        // Before onboarding there is no configured backend to ask.
        if !self.config.is_onboarded() {
            return Snapshot {
                pairings: Vec::new(),
                devices: Vec::new(),
                fetched_at: Instant::now(),
            };
        }

        let pairings = self.fetch_pairings().await;
        let devices = self.fetch_devices().await;
        if !pairings.is_empty() || !devices.is_empty() {
            info!(
                "{} pending pairing(s), {} pending device request(s)",
                pairings.len(),
                devices.len()
            );
        }
        Snapshot {
            pairings,
            devices,
            fetched_at: Instant::now(),
        }
    }

    async fn fetch_pairings(&self) -> Vec<PendingPairing> {
        let mut pending = Vec::new();
        for channel in PAIRING_CHANNELS {
            if !self.channel_enabled(channel) {
                continue;
            }
            let result = self
                .agent
                .run(&["pairing", "list", channel], ExecOpts::default())
                .await;
            if !result.ok || result.stdout.is_empty() {
                continue;
            }
            for line in result.stdout.lines().filter(|l| !l.trim().is_empty()) {
                if let Some(code) = PAIRING_CODE_REGEX.find(line) {
                    pending.push(PendingPairing {
                        id: code.as_str().to_string(),
                        code: code.as_str().to_string(),
                        channel: channel.to_string(),
                    });
                }
            }
        }
        pending
    }

    async fn fetch_devices(&self) -> Vec<DeviceRequest> {
        let result = self
            .agent
            .run(&["devices", "list", "--json"], ExecOpts::default())
            .await;
        if !result.ok || result.stdout.is_empty() {
            return Vec::new();
        }
        let mut devices = match serde_json::from_str::<DeviceList>(&result.stdout) {
            Ok(list) => list.pending,
            Err(e) => {
                warn!("unparseable device list: {e}");
                return Vec::new();
            }
        };

        if !self.config.auto_approval_marker().exists() {
            if let Some(pos) = devices.iter().position(DeviceRequest::is_cli) {
                let request_id = devices[pos].request_id.clone();
                if self.auto_approve(&request_id).await {
                    devices.remove(pos);
                }
            }
        }
        devices
    }

    /// Approve the first CLI device request and persist the marker that
    /// makes this a once-ever decision. The marker is only written when the
    /// approval command succeeded, so a transient CLI failure leaves the
    /// request pending for manual handling.
    async fn auto_approve(&self, request_id: &str) -> bool {
        let result = self
            .agent
            .run(
                &["devices", "approve", request_id],
                ExecOpts::default().quiet(),
            )
            .await;
        if !result.ok {
            warn!("auto-approval of cli device request {request_id} failed: {}", result.stderr);
            return false;
        }
        if let Err(e) = self.write_marker(request_id) {
            warn!("failed to persist auto-approval marker: {e:#}");
        }
        info!("auto-approved first cli device request {request_id}");
        true
    }

    fn write_marker(&self, request_id: &str) -> Result<()> {
        let marker = self.config.auto_approval_marker();
        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::json!({
            "approvedAt": Utc::now().to_rfc3339(),
            "requestId": request_id,
        });
        std::fs::write(&marker, content.to_string())
            .with_context(|| format!("Failed to write {}", marker.display()))
    }

    fn channel_enabled(&self, channel: &str) -> bool {
        let raw = match std::fs::read_to_string(self.config.agent_config_file()) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        let config: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                debug!("unparseable agent config: {e}");
                return false;
            }
        };
        config["channels"][channel]["enabled"]
            .as_bool()
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockRunner;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    fn test_config(home: &Path) -> Config {
        Config::new(home.to_path_buf(), PathBuf::from("/app/setup"), 3000, false)
    }

    fn write_agent_config(config: &Config, telegram: bool, discord: bool) {
        config.ensure_directories().unwrap();
        let body = serde_json::json!({
            "channels": {
                "telegram": { "enabled": telegram },
                "discord": { "enabled": discord },
            }
        });
        std::fs::write(config.agent_config_file(), body.to_string()).unwrap();
    }

    fn device_json(entries: serde_json::Value) -> String {
        serde_json::json!({ "pending": entries }).to_string()
    }

    #[tokio::test]
    async fn test_not_onboarded_lists_empty_without_cli_calls() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let gate = PairingGate::new(test_config(dir.path()), runner.clone());

        assert!(gate.pending_pairings().await.is_empty());
        assert!(gate.pending_devices().await.is_empty());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_parses_codes_from_enabled_channels_only() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        write_agent_config(&config, true, false);
        let runner = Arc::new(MockRunner::new().respond_ok(
            "pairing list telegram",
            "Pairing request ABCD1234 from @alice\nno code on this line\nEFGH5678 waiting\n",
        ));
        let gate = PairingGate::new(config, runner.clone());

        let pending = gate.pending_pairings().await;
        assert_eq!(
            pending,
            vec![
                PendingPairing {
                    id: "ABCD1234".to_string(),
                    code: "ABCD1234".to_string(),
                    channel: "telegram".to_string(),
                },
                PendingPairing {
                    id: "EFGH5678".to_string(),
                    code: "EFGH5678".to_string(),
                    channel: "telegram".to_string(),
                },
            ]
        );
        assert_eq!(runner.call_count("pairing list telegram"), 1);
        assert_eq!(runner.call_count("pairing list discord"), 0);
    }

    #[tokio::test]
    async fn test_cache_serves_within_ttl_and_expires_after() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        write_agent_config(&config, true, false);
        let runner = Arc::new(MockRunner::new().respond_ok("pairing list telegram", "ABCD1234"));
        let gate =
            PairingGate::new(config, runner.clone()).with_ttl(Duration::from_millis(50));

        gate.pending_pairings().await;
        gate.pending_pairings().await;
        assert_eq!(runner.call_count("pairing list telegram"), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        gate.pending_pairings().await;
        assert_eq!(runner.call_count("pairing list telegram"), 2);
    }

    #[tokio::test]
    async fn test_auto_approves_first_cli_request_when_marker_absent() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        write_agent_config(&config, false, false);
        let runner = Arc::new(
            MockRunner::new()
                .respond_ok(
                    "devices list --json",
                    &device_json(serde_json::json!([{
                        "requestId": "req-cli-1",
                        "clientId": "cli",
                        "clientMode": "cli",
                        "platform": "darwin",
                        "role": "user",
                        "scopes": ["chat"],
                        "ts": "2026-02-22T00:00:00.000Z",
                    }])),
                )
                .respond_ok("devices approve req-cli-1", ""),
        );
        let gate = PairingGate::new(config.clone(), runner.clone());

        let pending = gate.pending_devices().await;

        assert!(pending.is_empty());
        assert_eq!(runner.call_count("devices approve req-cli-1"), 1);
        let marker = std::fs::read_to_string(config.auto_approval_marker()).unwrap();
        assert!(marker.contains("approvedAt"));
        assert!(marker.contains("req-cli-1"));
    }

    #[tokio::test]
    async fn test_marker_present_surfaces_request_untouched() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        write_agent_config(&config, false, false);
        std::fs::write(config.auto_approval_marker(), "{}").unwrap();
        let runner = Arc::new(MockRunner::new().respond_ok(
            "devices list --json",
            &device_json(serde_json::json!([{
                "requestId": "req-cli-2",
                "clientId": "cli",
                "clientMode": "cli",
                "platform": "linux",
            }])),
        ));
        let gate = PairingGate::new(config, runner.clone());

        let pending = gate.pending_devices().await;

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, "req-cli-2");
        assert_eq!(pending[0].client_mode.as_deref(), Some("cli"));
        assert_eq!(runner.call_count("devices approve req-cli-2"), 0);
    }

    #[tokio::test]
    async fn test_non_cli_requests_are_never_auto_approved() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        write_agent_config(&config, false, false);
        let runner = Arc::new(MockRunner::new().respond_ok(
            "devices list --json",
            &device_json(serde_json::json!([{
                "requestId": "req-web-1",
                "clientMode": "web",
            }])),
        ));
        let gate = PairingGate::new(config.clone(), runner.clone());

        let pending = gate.pending_devices().await;

        assert_eq!(pending.len(), 1);
        assert!(!config.auto_approval_marker().exists());
        assert!(
            runner
                .calls()
                .iter()
                .all(|c| !c.starts_with("devices approve"))
        );
    }

    #[tokio::test]
    async fn test_failed_auto_approval_keeps_request_and_no_marker() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        write_agent_config(&config, false, false);
        let runner = Arc::new(
            MockRunner::new()
                .respond_ok(
                    "devices list --json",
                    &device_json(serde_json::json!([{
                        "requestId": "req-cli-3",
                        "clientMode": "cli",
                    }])),
                )
                .respond_err("devices approve req-cli-3", "backend unavailable"),
        );
        let gate = PairingGate::new(config.clone(), runner.clone());

        let pending = gate.pending_devices().await;

        assert_eq!(pending.len(), 1);
        assert!(!config.auto_approval_marker().exists());
    }

    #[tokio::test]
    async fn test_approve_pairing_runs_cli_and_invalidates_cache() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        write_agent_config(&config, true, false);
        let runner = Arc::new(MockRunner::new().respond_ok("pairing list telegram", "ABCD1234"));
        let gate = PairingGate::new(config, runner.clone());

        gate.pending_pairings().await;
        let result = gate.approve_pairing("telegram", "ABCD1234").await;
        assert!(result.ok);
        assert_eq!(runner.call_count("pairing approve telegram ABCD1234"), 1);

        gate.pending_pairings().await;
        assert_eq!(runner.call_count("pairing list telegram"), 2);
    }

    #[test]
    fn test_device_request_serializes_request_id_as_id() {
        let request = DeviceRequest {
            request_id: "req-9".to_string(),
            client_id: Some("cli".to_string()),
            client_mode: Some("cli".to_string()),
            platform: None,
            role: None,
            scopes: None,
            ts: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["id"], "req-9");
        assert_eq!(value["clientMode"], "cli");
        assert!(value.get("platform").is_none());
    }
}
