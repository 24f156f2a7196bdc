//! Pipeline configuration.
//!
//! [`SyncConfig`] is plain serde data: load it from JSON with
//! [`SyncConfig::from_json_file`], layer `VAULTSYNC_*` overrides with
//! [`SyncConfig::apply_env`], then [`validate`](SyncConfig::validate) before
//! handing it to the orchestrator builder. Durations are integer milliseconds
//! on the wire.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Result, SyncError};
use crate::normalize::NormalizeOptions;
use crate::resilience::{CircuitBreakerConfig, RetryOptions};

/// `Duration` <-> integer milliseconds.
pub mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub const DEFAULT_COMMIT_TEMPLATE: &str = "vault sync: {count} file(s) at {timestamp}\n\n{files}";

/// Everything the orchestrator needs to run one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root of the git working tree being synchronized.
    pub root: PathBuf,
    #[serde(with = "serde_millis")]
    pub debounce: Duration,
    #[serde(with = "serde_millis")]
    pub batch_window: Duration,
    pub max_batch_size: usize,
    #[serde(with = "serde_millis")]
    pub drain_timeout: Duration,
    /// Consecutive failed batches before a critical shutdown.
    pub max_consecutive_failures: u32,
    pub auto_commit: bool,
    pub auto_push: bool,
    pub pull_before_sync: bool,
    /// Supports `{count}`, `{files}` and `{timestamp}`.
    pub commit_message_template: String,
    /// Extensions (without the dot) considered content. Empty matches everything.
    pub include_extensions: Vec<String>,
    pub ignore_hidden: bool,
    #[serde(with = "serde_millis")]
    pub git_timeout: Duration,
    pub event_history_capacity: usize,
    #[serde(with = "serde_millis")]
    pub maintenance_interval: Duration,
    pub retry: RetryOptions,
    pub circuit_breaker: CircuitBreakerConfig,
    pub normalize: NormalizeOptions,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            debounce: Duration::from_millis(300),
            batch_window: Duration::from_millis(2000),
            max_batch_size: 50,
            drain_timeout: Duration::from_secs(30),
            max_consecutive_failures: 5,
            auto_commit: true,
            auto_push: false,
            pull_before_sync: false,
            commit_message_template: DEFAULT_COMMIT_TEMPLATE.to_string(),
            include_extensions: vec!["md".to_string()],
            ignore_hidden: true,
            git_timeout: Duration::from_secs(60),
            event_history_capacity: crate::events::DEFAULT_HISTORY_CAPACITY,
            maintenance_interval: Duration::from_secs(30),
            retry: RetryOptions::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            normalize: NormalizeOptions::default(),
        }
    }
}

impl SyncConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(SyncError::MissingField("root"));
        }
        if self.debounce.is_zero() {
            return Err(SyncError::InvalidConfig("debounce must be non-zero".into()));
        }
        if self.batch_window < self.debounce {
            return Err(SyncError::InvalidConfig(format!(
                "batch_window ({:?}) is shorter than debounce ({:?})",
                self.batch_window, self.debounce
            )));
        }
        if self.max_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "max_batch_size must be at least 1".into(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(SyncError::InvalidConfig(
                "max_consecutive_failures must be at least 1".into(),
            ));
        }
        if self.git_timeout.is_zero() {
            return Err(SyncError::InvalidConfig("git_timeout must be non-zero".into()));
        }
        if self.maintenance_interval.is_zero() {
            return Err(SyncError::InvalidConfig(
                "maintenance_interval must be non-zero".into(),
            ));
        }
        if self.commit_message_template.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "commit_message_template is empty".into(),
            ));
        }
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        Ok(())
    }

    /// Apply `VAULTSYNC_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (tests pass a map).
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("VAULTSYNC_ROOT") {
            self.root = PathBuf::from(root);
        }
        if let Some(ms) = env_parse::<u64>(&lookup, "VAULTSYNC_DEBOUNCE_MS")? {
            self.debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>(&lookup, "VAULTSYNC_BATCH_WINDOW_MS")? {
            self.batch_window = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse(&lookup, "VAULTSYNC_MAX_BATCH_SIZE")? {
            self.max_batch_size = n;
        }
        if let Some(ms) = env_parse::<u64>(&lookup, "VAULTSYNC_DRAIN_TIMEOUT_MS")? {
            self.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse(&lookup, "VAULTSYNC_MAX_CONSECUTIVE_FAILURES")? {
            self.max_consecutive_failures = n;
        }
        if let Some(ms) = env_parse::<u64>(&lookup, "VAULTSYNC_GIT_TIMEOUT_MS")? {
            self.git_timeout = Duration::from_millis(ms);
        }
        if let Some(flag) = env_bool(&lookup, "VAULTSYNC_AUTO_COMMIT")? {
            self.auto_commit = flag;
        }
        if let Some(flag) = env_bool(&lookup, "VAULTSYNC_AUTO_PUSH")? {
            self.auto_push = flag;
        }
        if let Some(flag) = env_bool(&lookup, "VAULTSYNC_PULL_BEFORE_SYNC")? {
            self.pull_before_sync = flag;
        }
        if let Some(template) = lookup("VAULTSYNC_COMMIT_TEMPLATE") {
            self.commit_message_template = template;
        }
        if let Some(exts) = lookup("VAULTSYNC_EXTENSIONS") {
            self.include_extensions = exts
                .split(',')
                .map(|e| e.trim().trim_start_matches('.').to_string())
                .filter(|e| !e.is_empty())
                .collect();
        }
        Ok(())
    }

    /// Render the commit message for a batch of files.
    pub fn render_commit_message(&self, files: &[String], timestamp: DateTime<Utc>) -> String {
        let list = files
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n");
        self.commit_message_template
            .replace("{count}", &files.len().to_string())
            .replace("{timestamp}", &timestamp.to_rfc3339_opts(SecondsFormat::Secs, true))
            .replace("{files}", &list)
            .trim_end()
            .to_string()
    }

    pub fn path_filter(&self) -> PathFilter {
        PathFilter::new(&self.root, &self.include_extensions, self.ignore_hidden)
    }
}

fn env_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SyncError::InvalidConfig(format!("{key}={raw:?}: {e}"))),
    }
}

fn env_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    match lookup(key).as_deref().map(str::trim) {
        None => Ok(None),
        Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some("0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(other) => Err(SyncError::InvalidConfig(format!(
            "{key}={other:?}: expected a boolean"
        ))),
    }
}

/// Decides which paths are synchronized content.
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    extensions: Vec<String>,
    ignore_hidden: bool,
}

impl PathFilter {
    pub fn new(root: &Path, extensions: &[String], ignore_hidden: bool) -> Self {
        Self {
            root: root.to_path_buf(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            ignore_hidden,
        }
    }

    /// `path` relative to the root when it lies under it, otherwise unchanged.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    pub fn is_relevant(&self, path: &Path) -> bool {
        let rel = self.relative(path);
        if self.ignore_hidden && is_hidden(rel) {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        rel.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .is_some_and(|e| self.extensions.iter().any(|x| *x == e))
    }
}

fn is_hidden(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(part) => part.to_str().is_some_and(|s| s.starts_with('.')),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        let config = SyncConfig::new("/vault");
        config.validate().unwrap();
        assert_eq!(config.max_consecutive_failures, 5);
        assert_eq!(config.debounce, Duration::from_millis(300));
        assert!(config.auto_commit);
        assert!(!config.auto_push);
    }

    #[test]
    fn validate_rejects_bad_thresholds() {
        let mut config = SyncConfig::new("/vault");
        config.max_batch_size = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));

        let mut config = SyncConfig::new("/vault");
        config.retry.base_delay = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = SyncConfig::new("/vault");
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::new("");
        config.root = PathBuf::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingField("root"))));
    }

    #[test]
    fn json_uses_millis_and_fills_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"root": "/notes", "debounce": 150, "auto_push": true, "retry": {"max_attempts": 4}}"#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/notes"));
        assert_eq!(config.debounce, Duration::from_millis(150));
        assert!(config.auto_push);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.batch_window, Duration::from_secs(2));

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["drain_timeout"], 30_000);
    }

    #[test]
    fn from_json_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vaultsync.json");
        std::fs::write(&path, r#"{"max_batch_size": 7}"#).unwrap();
        let config = SyncConfig::from_json_file(&path).unwrap();
        assert_eq!(config.max_batch_size, 7);
    }

    #[test]
    fn env_overrides_apply_and_reject_garbage() {
        let vars: HashMap<&str, &str> = [
            ("VAULTSYNC_ROOT", "/srv/vault"),
            ("VAULTSYNC_DEBOUNCE_MS", "100"),
            ("VAULTSYNC_AUTO_PUSH", "yes"),
            ("VAULTSYNC_EXTENSIONS", "md, .markdown"),
        ]
        .into_iter()
        .collect();
        let mut config = SyncConfig::default();
        config
            .apply_env_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/vault"));
        assert_eq!(config.debounce, Duration::from_millis(100));
        assert!(config.auto_push);
        assert_eq!(config.include_extensions, vec!["md", "markdown"]);

        let mut config = SyncConfig::default();
        let err = config
            .apply_env_from(|k| (k == "VAULTSYNC_MAX_BATCH_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("VAULTSYNC_MAX_BATCH_SIZE"));
    }

    #[test]
    fn commit_message_fills_placeholders() {
        let config = SyncConfig {
            commit_message_template: "sync {count}: {timestamp}\n\n{files}".into(),
            ..SyncConfig::default()
        };
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let msg = config.render_commit_message(&["a.md".into(), "b/c.md".into()], ts);
        assert_eq!(msg, "sync 2: 2024-05-01T12:00:00Z\n\n- a.md\n- b/c.md");
    }

    #[test]
    fn path_filter_checks_extension_and_hidden_components() {
        let filter = PathFilter::new(Path::new("/vault"), &["md".into()], true);
        assert!(filter.is_relevant(Path::new("/vault/notes/today.md")));
        assert!(filter.is_relevant(Path::new("notes/Today.MD")));
        assert!(!filter.is_relevant(Path::new("/vault/notes/image.png")));
        assert!(!filter.is_relevant(Path::new("/vault/.obsidian/workspace.md")));
        assert!(!filter.is_relevant(Path::new(".git/COMMIT_EDITMSG")));

        let everything = PathFilter::new(Path::new("/vault"), &[], false);
        assert!(everything.is_relevant(Path::new("/vault/.hidden/data.bin")));
    }
}
