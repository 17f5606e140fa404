//! Persisted environment overlay.
//!
//! Onboarding variables live in a dotenv-style file under the data
//! directory and are merged into every gateway and CLI spawn. Merges
//! replace same-key lines in place and append new keys; unrelated lines
//! (comments, unknown keys) survive untouched.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct EnvFile {
    path: PathBuf,
}

impl EnvFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents as key/value pairs. A missing file is an empty
    /// overlay, and unparseable entries are skipped.
    pub fn load(&self) -> Vec<(String, String)> {
        if !self.path.exists() {
            return Vec::new();
        }
        match dotenvy::from_path_iter(&self.path) {
            Ok(iter) => iter.filter_map(|item| item.ok()).collect(),
            Err(e) => {
                warn!("failed to parse env file {}: {e}", self.path.display());
                Vec::new()
            }
        }
    }

    /// Merge `vars` into the file: existing keys are rewritten in place,
    /// new keys appended. Within `vars`, a later duplicate wins.
    pub fn merge(&self, vars: &[(String, String)]) -> Result<()> {
        let mut wanted: Vec<(String, String)> = Vec::new();
        for (key, value) in vars {
            if let Some(slot) = wanted.iter_mut().find(|(k, _)| k == key) {
                slot.1 = value.clone();
            } else {
                wanted.push((key.clone(), value.clone()));
            }
        }

        let existing = if self.path.exists() {
            std::fs::read_to_string(&self.path)
                .with_context(|| format!("Failed to read {}", self.path.display()))?
        } else {
            String::new()
        };

        let mut replaced: Vec<String> = Vec::new();
        let mut lines: Vec<String> = existing.lines().map(|l| l.to_string()).collect();
        for line in lines.iter_mut() {
            if line.trim_start().starts_with('#') {
                continue;
            }
            if let Some((key, _)) = line.split_once('=') {
                let key = key.trim().to_string();
                if let Some((_, value)) = wanted.iter().find(|(k, _)| *k == key) {
                    *line = format!("{key}={value}");
                    replaced.push(key);
                }
            }
        }
        for (key, value) in &wanted {
            if !replaced.contains(key) {
                lines.push(format!("{key}={value}"));
            }
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut content = lines.join("\n");
        content.push('\n');
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let env = EnvFile::new(dir.path().join(".env"));
        assert!(env.load().is_empty());
    }

    #[test]
    fn test_merge_creates_file_and_round_trips() {
        let dir = tempdir().unwrap();
        let env = EnvFile::new(dir.path().join("nested/.env"));
        env.merge(&[
            ("GITHUB_TOKEN".to_string(), "ghp_abc".to_string()),
            ("TELEGRAM_BOT_TOKEN".to_string(), "123:xyz".to_string()),
        ])
        .unwrap();

        let loaded = env.load();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&("GITHUB_TOKEN".to_string(), "ghp_abc".to_string())));
    }

    #[test]
    fn test_merge_replaces_existing_key_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "# managed\nGITHUB_TOKEN=old\nOTHER=keep\n").unwrap();

        let env = EnvFile::new(path.clone());
        env.merge(&[("GITHUB_TOKEN".to_string(), "new".to_string())])
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "# managed\nGITHUB_TOKEN=new\nOTHER=keep\n");
    }

    #[test]
    fn test_merge_appends_new_keys_after_existing_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "FIRST=1\n").unwrap();

        let env = EnvFile::new(path.clone());
        env.merge(&[("SECOND".to_string(), "2".to_string())]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "FIRST=1\nSECOND=2\n");
    }

    #[test]
    fn test_merge_last_duplicate_wins() {
        let dir = tempdir().unwrap();
        let env = EnvFile::new(dir.path().join(".env"));
        env.merge(&[
            ("KEY".to_string(), "first".to_string()),
            ("KEY".to_string(), "second".to_string()),
        ])
        .unwrap();

        let loaded = env.load();
        assert_eq!(loaded, vec![("KEY".to_string(), "second".to_string())]);
    }
}
