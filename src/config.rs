//! Unified configuration for taskpulse.
//!
//! Settings are read from `taskpulse.toml` and layered file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! dev_mode = false
//!
//! [database]
//! path = ".taskpulse/taskpulse.db"
//!
//! [websocket]
//! ping_interval_secs = 30
//! pong_timeout_secs = 60
//! channel_capacity = 256
//!
//! [logging]
//! format = "text"
//!
//! [tabs]
//! base = ["task-center"]
//!
//! [[tabs.unlock]]
//! task_type = "company_kyb"
//! tabs = ["file-vault"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::progress::models::TaskType;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "taskpulse.toml";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: text, json", s),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a local front-end dev server.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".taskpulse/taskpulse.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Real-time channel tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketSection {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
    /// Frames buffered per subscriber before it is considered lagged.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_timeout() -> u64 {
    60
}

fn default_channel_capacity() -> usize {
    256
}

impl WebSocketSection {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
}

/// A tab unlocked once a task of `task_type` has been submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabUnlockRule {
    pub task_type: TaskType,
    pub tabs: Vec<String>,
}

/// Tab availability rules.
///
/// A company's `available_tabs` is always `base` followed by the tabs of every
/// rule whose task type has a submitted task, in rule order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabsSection {
    #[serde(default = "default_base_tabs")]
    pub base: Vec<String>,
    #[serde(default = "default_unlock_rules")]
    pub unlock: Vec<TabUnlockRule>,
}

fn default_base_tabs() -> Vec<String> {
    vec!["task-center".to_string()]
}

fn default_unlock_rules() -> Vec<TabUnlockRule> {
    vec![
        TabUnlockRule {
            task_type: TaskType::CompanyKyb,
            tabs: vec!["file-vault".to_string()],
        },
        TabUnlockRule {
            task_type: TaskType::OpenBanking,
            tabs: vec!["dashboard".to_string(), "insights".to_string()],
        },
    ]
}

impl Default for TabsSection {
    fn default() -> Self {
        Self {
            base: default_base_tabs(),
            unlock: default_unlock_rules(),
        }
    }
}

impl TabsSection {
    /// Derive the ordered tab list from the set of submitted task types.
    ///
    /// `extra` carries tabs granted outside the rule table (e.g. an explicit
    /// file-vault unlock) and is appended after rule-derived tabs.
    pub fn derive(&self, submitted: &[TaskType], extra: &[String]) -> Vec<String> {
        let mut tabs: Vec<String> = Vec::new();
        let mut push = |tab: &String| {
            if !tabs.contains(tab) {
                tabs.push(tab.clone());
            }
        };
        self.base.iter().for_each(&mut push);
        for rule in &self.unlock {
            if submitted.contains(&rule.task_type) {
                rule.tabs.iter().for_each(&mut push);
            }
        }
        extra.iter().for_each(&mut push);
        tabs
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskpulseConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub websocket: WebSocketSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub tabs: TabsSection,
}

/// Overrides supplied on the command line. `None` keeps the lower layer.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev_mode: bool,
    pub log_format: Option<LogFormat>,
}

impl TaskpulseConfig {
    /// Parse a config file. A missing file yields defaults.
    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid taskpulse.toml")
    }

    /// Load the file layer, then environment, then CLI overrides.
    pub fn load(path: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        let mut config = Self::load_file(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_cli(cli);
        Ok(config)
    }

    /// Apply environment overrides through a lookup function (testable
    /// without touching the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.path =
                database_path_from_url(&url).context("DATABASE_URL is not a SQLite location")?;
        }
        if let Some(host) = lookup("TASKPULSE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("TASKPULSE_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("TASKPULSE_PORT is not a valid port: {}", port))?;
        }
        if let Some(format) = lookup("TASKPULSE_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(path) = &cli.db_path {
            self.database.path = path.clone();
        }
        if cli.dev_mode {
            self.server.dev_mode = true;
        }
        if let Some(format) = cli.log_format {
            self.logging.format = format;
        }
    }
}

/// Accept `sqlite://path`, `sqlite:path`, `file://path`, `file:path` or a
/// bare path. Any other `scheme://` is an error.
pub fn database_path_from_url(url: &str) -> Result<PathBuf> {
    let trimmed = url.trim();
    let path = trimmed
        .strip_prefix("sqlite://")
        .or_else(|| trimmed.strip_prefix("sqlite:"))
        .or_else(|| trimmed.strip_prefix("file://"))
        .or_else(|| trimmed.strip_prefix("file:"));
    match path {
        Some(path) => Ok(PathBuf::from(path)),
        None => {
            if let Some((scheme, _)) = trimmed.split_once("://") {
                // Only the scheme is echoed; the rest may carry credentials.
                anyhow::bail!("unsupported database scheme '{}'", scheme);
            }
            Ok(PathBuf::from(trimmed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = TaskpulseConfig::default();
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(
            config.database.path,
            PathBuf::from(".taskpulse/taskpulse.db")
        );
        assert_eq!(config.websocket.ping_interval(), Duration::from_secs(30));
        assert!(config.websocket.pong_timeout() > config.websocket.ping_interval());
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.tabs.base, vec!["task-center"]);
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = TaskpulseConfig::parse(
            r#"
            [server]
            port = 8080

            [tabs]
            base = ["task-center", "network"]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.tabs.base, vec!["task-center", "network"]);
        // unlock rules were not given, so the defaults remain
        assert_eq!(config.tabs.unlock.len(), 2);
    }

    #[test]
    fn test_parse_unlock_rules() {
        let config = TaskpulseConfig::parse(
            r#"
            [[tabs.unlock]]
            task_type = "ky3p"
            tabs = ["risk-score"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.tabs.unlock,
            vec![TabUnlockRule {
                task_type: TaskType::Ky3p,
                tabs: vec!["risk-score".to_string()],
            }]
        );
    }

    #[test]
    fn test_parse_rejects_unknown_log_format() {
        let result = TaskpulseConfig::parse(
            r#"
            [logging]
            format = "xml"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = TaskpulseConfig::load_file(Path::new("/nonexistent/taskpulse.toml")).unwrap();
        assert_eq!(config.server.port, 3141);
    }

    #[test]
    fn test_env_layer_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "sqlite:///var/lib/taskpulse.db"),
            ("TASKPULSE_PORT", "9000"),
            ("TASKPULSE_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();
        let mut config = TaskpulseConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/taskpulse.db"));
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_rejects_bad_port() {
        let mut config = TaskpulseConfig::default();
        let result = config.apply_env(|k| (k == "TASKPULSE_PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_env_rejects_non_sqlite_database_url() {
        let mut config = TaskpulseConfig::default();
        let result = config.apply_env(|k| {
            (k == "DATABASE_URL").then(|| "postgres://app:pw@db:5432/invela".to_string())
        });
        let err = result.unwrap_err();
        let chain = format!("{:#}", err);
        assert!(chain.contains("postgres"));
        assert!(!chain.contains("pw@db"));
        assert_eq!(config.database.path, TaskpulseConfig::default().database.path);
    }

    #[test]
    fn test_cli_layer_wins() {
        let mut config = TaskpulseConfig::default();
        config.server.port = 9000;
        config.apply_cli(&CliOverrides {
            port: Some(4000),
            dev_mode: true,
            ..Default::default()
        });
        assert_eq!(config.server.port, 4000);
        assert!(config.server.dev_mode);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_database_path_from_url_variants() {
        let path = |url: &str| database_path_from_url(url).unwrap();
        assert_eq!(path("sqlite://data/a.db"), PathBuf::from("data/a.db"));
        assert_eq!(path("sqlite:b.db"), PathBuf::from("b.db"));
        assert_eq!(path("file:c.db"), PathBuf::from("c.db"));
        assert_eq!(path("file:///srv/e.db"), PathBuf::from("/srv/e.db"));
        assert_eq!(path(" d.db "), PathBuf::from("d.db"));
        assert!(database_path_from_url("mysql://root@localhost/app").is_err());
    }

    #[test]
    fn test_derive_tabs_from_submitted_types() {
        let tabs = TabsSection::default();
        assert_eq!(tabs.derive(&[], &[]), vec!["task-center"]);
        assert_eq!(
            tabs.derive(&[TaskType::CompanyKyb], &[]),
            vec!["task-center", "file-vault"]
        );
        assert_eq!(
            tabs.derive(&[TaskType::OpenBanking, TaskType::CompanyKyb], &[]),
            vec!["task-center", "file-vault", "dashboard", "insights"]
        );
    }

    #[test]
    fn test_derive_tabs_deduplicates_extra() {
        let tabs = TabsSection::default();
        let extra = vec!["file-vault".to_string(), "network".to_string()];
        assert_eq!(
            tabs.derive(&[TaskType::CompanyKyb], &extra),
            vec!["task-center", "file-vault", "network"]
        );
    }
}
