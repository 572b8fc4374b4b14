use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Remote API ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotionConfig {
    /// Integration token.  Overridden at runtime by the `NOTION_TOKEN`
    /// environment variable when set.
    pub token: String,
    pub api_base_url: String,
    pub api_version: String,
    /// Pause between two consecutive remote calls.  The default keeps the
    /// daemon just under three requests per second.
    pub request_interval_ms: u64,
    /// Total attempts for a rate-limited call, including the first one.
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * retry_base_delay_ms`.
    pub retry_base_delay_ms: u64,
    pub page_size: usize,
    /// Largest block batch accepted by a single create/append request.
    pub max_batch_blocks: usize,
    pub timeout_secs: u64,
}

impl Default for NotionConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base_url: "https://api.notion.com/v1".to_string(),
            api_version: "2022-06-28".to_string(),
            request_interval_ms: 334,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            page_size: 100,
            max_batch_blocks: 100,
            timeout_secs: 30,
        }
    }
}

impl NotionConfig {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ── Sync behaviour ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tracked document extension, without the leading dot.
    pub extension: String,
    /// Directory or file names skipped during scans and by the watcher.
    /// Matched exactly against each path component.
    pub ignore: Vec<String>,
    /// Quiet window a path must observe before a local change is pushed.
    pub debounce_ms: u64,
    /// How long a pull-originated write is hidden from the watcher.  Should
    /// be at least `debounce_ms`.
    pub pull_suppress_ms: u64,
    pub poll_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            extension: "md".to_string(),
            ignore: vec![
                "node_modules".to_string(),
                ".git".to_string(),
                ".notesync".to_string(),
            ],
            debounce_ms: 1000,
            pull_suppress_ms: 2000,
            poll_interval_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn pull_suppress(&self) -> Duration {
        Duration::from_millis(self.pull_suppress_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:8787".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Holds state, pid, lock and log files for every sync target.
    pub state_dir: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: ".notesync".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.state_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub notion: NotionConfig,
    pub sync: SyncConfig,
    pub webhook: WebhookConfig,
    pub daemon: DaemonConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(token) = env::var("NOTION_TOKEN") {
            if !token.trim().is_empty() {
                config.notion.token = token;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn has_token(&self) -> bool {
        !self.notion.token.trim().is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // Pacing and suppression windows are load-bearing for the sync engine;
    // changing any of them should be deliberate.

    #[test]
    fn pacing_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.notion.request_interval(), Duration::from_millis(334));
        assert_eq!(cfg.notion.max_attempts, 3);
        assert_eq!(cfg.notion.retry_base_delay(), Duration::from_secs(1));
        assert_eq!(cfg.notion.page_size, 100);
        assert_eq!(cfg.notion.max_batch_blocks, 100);
        assert_eq!(cfg.sync.debounce(), Duration::from_secs(1));
        assert_eq!(cfg.sync.pull_suppress(), Duration::from_secs(2));
        assert!(cfg.sync.pull_suppress() >= cfg.sync.debounce());
    }

    #[test]
    fn misc_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.sync.extension, "md");
        assert_eq!(cfg.sync.ignore, vec!["node_modules", ".git", ".notesync"]);
        assert!(!cfg.webhook.enabled);
        assert_eq!(cfg.webhook.bind, "127.0.0.1:8787");
        assert_eq!(cfg.daemon.state_dir(), PathBuf::from(".notesync"));
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    #[test]
    fn poll_interval_never_zero() {
        let mut sync = SyncConfig::default();
        sync.poll_interval_secs = 0;
        assert_eq!(sync.poll_interval(), Duration::from_secs(1));
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.notion.api_version, "2022-06-28");
        assert_eq!(cfg.sync.poll_interval_secs, 30);
    }

    #[test]
    fn load_from_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[sync]
debounce_ms = 250
ignore = ["node_modules", ".git"]

[webhook]
enabled = true
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.sync.debounce_ms, 250);
        assert_eq!(cfg.sync.ignore.len(), 2);
        assert!(cfg.webhook.enabled);
        // Unspecified keys and sections keep their defaults.
        assert_eq!(cfg.sync.pull_suppress_ms, 2000);
        assert_eq!(cfg.webhook.bind, "127.0.0.1:8787");
        assert_eq!(cfg.notion.request_interval_ms, 334);
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[notion\ntoken = ").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut cfg = AppConfig::default();
        cfg.notion.max_attempts = 5;
        cfg.sync.extension = "markdown".to_string();
        cfg.daemon.state_dir = "/var/lib/notesync".to_string();

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.notion.max_attempts, 5);
        assert_eq!(loaded.sync.extension, "markdown");
        assert_eq!(loaded.daemon.state_dir, "/var/lib/notesync");
    }

    // ── Env var overrides ──────────────────────────────────────────────────

    #[test]
    fn env_token_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token.toml");
        fs::write(
            &path,
            r#"
[notion]
token = "from-file"
"#,
        )
        .unwrap();

        // SAFETY: test is single-threaded for this env var.
        unsafe { env::set_var("NOTION_TOKEN", "from-env") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.notion.token, "from-env");
        assert!(cfg.has_token());
        unsafe { env::remove_var("NOTION_TOKEN") };
    }
}
