//! Hourly workspace sync installation.
//!
//! Two artifacts: a sync script copied from the setup templates into the
//! data directory, and a system crontab drop-in that runs it every hour.
//! A JSON descriptor records the job so the agent can surface it.

use crate::config::Config;
use anyhow::{Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::info;

/// Schedule for the hourly sync job.
pub const SYNC_SCHEDULE: &str = "0 * * * *";

const SYNC_LOG_FILE: &str = "/var/log/gatehouse-hourly-sync.log";

/// Install the sync script from the setup templates, executable.
pub fn install_sync_script(config: &Config) -> Result<()> {
    let template = config.template("hourly-git-sync.sh");
    let content = std::fs::read_to_string(&template)
        .with_context(|| format!("failed to read {}", template.display()))?;
    let target = config.sync_script_path();
    std::fs::write(&target, content)
        .with_context(|| format!("failed to write {}", target.display()))?;
    set_mode(&target, 0o755)?;
    info!("installed sync script at {}", target.display());
    Ok(())
}

/// Write the job descriptor and the system crontab entry.
pub fn install_sync_cron(config: &Config) -> Result<()> {
    let descriptor_path = config.cron_descriptor_file();
    if let Some(parent) = descriptor_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let descriptor = serde_json::json!({ "enabled": true, "schedule": SYNC_SCHEDULE });
    std::fs::write(&descriptor_path, serde_json::to_string_pretty(&descriptor)?)
        .with_context(|| format!("failed to write {}", descriptor_path.display()))?;

    std::fs::create_dir_all(&config.cron_dir)
        .with_context(|| format!("failed to create {}", config.cron_dir.display()))?;
    let entry_path = config.cron_entry_file();
    std::fs::write(&entry_path, render_cron_entry(config))
        .with_context(|| format!("failed to write {}", entry_path.display()))?;
    // cron rejects group-writable drop-ins.
    set_mode(&entry_path, 0o644)?;
    info!("installed hourly sync cron entry");
    Ok(())
}

fn render_cron_entry(config: &Config) -> String {
    [
        "SHELL=/bin/bash".to_string(),
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        format!(
            "{SYNC_SCHEDULE} root bash \"{}\" >> {SYNC_LOG_FILE} 2>&1",
            config.sync_script_path().display()
        ),
        String::new(),
    ]
    .join("\n")
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("failed to set mode on {}", path.display()))?;
    Ok(())
}
