use anyhow::{Context, Result};
use std::path::PathBuf;

/// TCP port the supervised gateway listens on (loopback only).
pub const GATEWAY_PORT: u16 = 18789;

/// Stdout markers that flip the gateway to Running when no override is set.
pub const DEFAULT_READY_MARKERS: &[&str] = &["Gateway listening", "ready"];

/// Runtime configuration for gatehouse.
///
/// Bridges CLI flags and environment fallbacks into the concrete paths and
/// constants the rest of the system works with. All durable state lives
/// under `data_dir`; provisioning templates are read from `setup_dir`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Home directory handed to the gateway child (`HERON_HOME`).
    pub home_dir: PathBuf,
    /// Root for every file gatehouse persists (`<home>/.heron`).
    pub data_dir: PathBuf,
    /// Git-backed workspace provisioned during onboarding.
    pub workspace_dir: PathBuf,
    /// Read-only template directory shipped with the image.
    pub setup_dir: PathBuf,
    /// System crontab drop-in directory.
    pub cron_dir: PathBuf,
    /// Port the wrapper's edge server binds on.
    pub port: u16,
    /// Loopback port of the supervised gateway.
    pub gateway_port: u16,
    /// Binary name (or path) of the agent CLI.
    pub agent_bin: String,
    /// Binary name (or path) of the Google workspace CLI.
    pub google_bin: String,
    /// Stdout substrings that signal gateway readiness.
    pub readiness_markers: Vec<String>,
    /// Attach a permissive CORS layer (development only).
    pub dev_cors: bool,
}

impl Config {
    pub fn new(home_dir: PathBuf, setup_dir: PathBuf, port: u16, dev_cors: bool) -> Self {
        let data_dir = home_dir.join(".heron");
        let workspace_dir = data_dir.join("workspace");
        let agent_bin = std::env::var("HERON_BIN").unwrap_or_else(|_| "heron".to_string());
        let google_bin = std::env::var("GWC_BIN").unwrap_or_else(|_| "gwc".to_string());
        let readiness_markers = std::env::var("GATEHOUSE_READY_MARKERS")
            .map(|raw| parse_markers(&raw))
            .unwrap_or_else(|_| DEFAULT_READY_MARKERS.iter().map(|m| m.to_string()).collect());

        Self {
            home_dir,
            data_dir,
            workspace_dir,
            setup_dir,
            cron_dir: PathBuf::from("/etc/cron.d"),
            port,
            gateway_port: GATEWAY_PORT,
            agent_bin,
            google_bin,
            readiness_markers,
            dev_cors,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.home_dir).context("Failed to create home directory")?;
        std::fs::create_dir_all(&self.data_dir).context("Failed to create data directory")?;
        std::fs::create_dir_all(&self.workspace_dir)
            .context("Failed to create workspace directory")?;
        std::fs::create_dir_all(self.google_dir())
            .context("Failed to create google config directory")?;
        Ok(())
    }

    /// Persisted environment variables merged into every agent spawn.
    pub fn env_file(&self) -> PathBuf {
        self.data_dir.join(".env")
    }

    /// Backend-owned configuration; its existence means onboarding completed.
    pub fn agent_config_file(&self) -> PathBuf {
        self.data_dir.join("heron.json")
    }

    pub fn sanitized_config_file(&self) -> PathBuf {
        self.data_dir.join("heron.sanitized.json")
    }

    pub fn auto_approval_marker(&self) -> PathBuf {
        self.data_dir.join(".cli-device-auto-approved")
    }

    pub fn codex_auth_file(&self) -> PathBuf {
        self.data_dir.join("auth").join("openai-codex.json")
    }

    pub fn google_dir(&self) -> PathBuf {
        self.data_dir.join("gwc")
    }

    pub fn google_credentials_file(&self) -> PathBuf {
        self.google_dir().join("credentials.json")
    }

    pub fn google_state_file(&self) -> PathBuf {
        self.google_dir().join("state.json")
    }

    pub fn google_token_file(&self, email: &str) -> PathBuf {
        self.google_dir().join(format!("token-{email}.json"))
    }

    pub fn skill_file(&self) -> PathBuf {
        self.data_dir.join("skills").join("control-ui").join("SKILL.md")
    }

    pub fn sync_script_path(&self) -> PathBuf {
        self.data_dir.join("hourly-git-sync.sh")
    }

    pub fn cron_descriptor_file(&self) -> PathBuf {
        self.data_dir.join("cron").join("system-sync.json")
    }

    pub fn cron_entry_file(&self) -> PathBuf {
        self.cron_dir.join("gatehouse-hourly-sync")
    }

    pub fn template(&self, name: &str) -> PathBuf {
        self.setup_dir.join(name)
    }

    /// Base URL of the supervised gateway, proxy target for passthrough traffic.
    pub fn gateway_origin(&self) -> String {
        format!("http://127.0.0.1:{}", self.gateway_port)
    }

    pub fn is_onboarded(&self) -> bool {
        self.agent_config_file().exists()
    }

    /// Environment overrides applied to every agent CLI and gateway spawn.
    pub fn agent_env(&self) -> Vec<(String, String)> {
        vec![
            ("HERON_HOME".to_string(), self.home_dir.display().to_string()),
            (
                "HERON_CONFIG_PATH".to_string(),
                self.agent_config_file().display().to_string(),
            ),
            (
                "XDG_CONFIG_HOME".to_string(),
                self.data_dir.display().to_string(),
            ),
        ]
    }

    /// Environment overrides for the Google workspace CLI, pinning its
    /// config root under the data directory.
    pub fn google_env(&self) -> Vec<(String, String)> {
        vec![(
            "XDG_CONFIG_HOME".to_string(),
            self.data_dir.display().to_string(),
        )]
    }
}

fn parse_markers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(home: &std::path::Path) -> Config {
        Config::new(home.to_path_buf(), PathBuf::from("/app/setup"), 3000, false)
    }

    #[test]
    fn test_paths_derive_from_home() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        assert_eq!(config.data_dir, dir.path().join(".heron"));
        assert_eq!(config.workspace_dir, dir.path().join(".heron/workspace"));
        assert_eq!(config.env_file(), dir.path().join(".heron/.env"));
        assert_eq!(
            config.agent_config_file(),
            dir.path().join(".heron/heron.json")
        );
        assert_eq!(
            config.auto_approval_marker(),
            dir.path().join(".heron/.cli-device-auto-approved")
        );
    }

    #[test]
    fn test_google_paths_under_data_dir() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        assert_eq!(
            config.google_credentials_file(),
            dir.path().join(".heron/gwc/credentials.json")
        );
        assert_eq!(
            config.google_token_file("a@b.com"),
            dir.path().join(".heron/gwc/token-a@b.com.json")
        );
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        config.ensure_directories().unwrap();
        assert!(config.data_dir.exists());
        assert!(config.workspace_dir.exists());
        assert!(config.google_dir().exists());
    }

    #[test]
    fn test_default_readiness_markers() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        assert!(
            config
                .readiness_markers
                .iter()
                .any(|m| m == "Gateway listening")
        );
        assert!(config.readiness_markers.iter().any(|m| m == "ready"));
    }

    #[test]
    fn test_parse_markers_trims_and_drops_empty() {
        let markers = parse_markers("listening on, ,ready,");
        assert_eq!(markers, vec!["listening on", "ready"]);
    }

    #[test]
    fn test_agent_env_pins_config_root() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let env = config.agent_env();
        let xdg = env.iter().find(|(k, _)| k == "XDG_CONFIG_HOME").unwrap();
        assert_eq!(xdg.1, config.data_dir.display().to_string());
        let cfg = env.iter().find(|(k, _)| k == "HERON_CONFIG_PATH").unwrap();
        assert!(cfg.1.ends_with("heron.json"));
    }

    #[test]
    fn test_is_onboarded_tracks_config_file() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        assert!(!config.is_onboarded());
        config.ensure_directories().unwrap();
        std::fs::write(config.agent_config_file(), "{}").unwrap();
        assert!(config.is_onboarded());
    }

    #[test]
    fn test_gateway_origin_is_loopback() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        assert_eq!(config.gateway_origin(), "http://127.0.0.1:18789");
    }
}
