//! Configuration file parser for `letterbox.toml`.
//!
//! The config file is optional. A missing or empty file yields
//! `Config::default()`, after which `LETTERBOX_*` environment variables
//! override individual fields. Unknown keys are accepted but logged as a
//! warning, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("hostname is required (set it in the config file or LETTERBOX_HOSTNAME)")]
    MissingHostname,

    #[error("{0} must be at least 1")]
    ZeroWorkers(&'static str),

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

// ============================================================================
// Configuration Structs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Development,
}

impl std::str::FromStr for Environment {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "production" => Ok(Environment::Production),
            "development" => Ok(Environment::Development),
            _ => Err(()),
        }
    }
}

/// Which components this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    All,
    Server,
    Email,
    Background,
}

impl RunType {
    pub fn runs_http(self) -> bool {
        matches!(self, RunType::All | RunType::Server)
    }

    pub fn runs_smtp(self) -> bool {
        matches!(self, RunType::All | RunType::Email)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, RunType::All | RunType::Background)
    }
}

impl std::str::FromStr for RunType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(RunType::All),
            "server" => Ok(RunType::Server),
            "email" => Ok(RunType::Email),
            "background" => Ok(RunType::Background),
            _ => Err(()),
        }
    }
}

/// Background worker tuning, the `[workers]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent verification workers.
    pub verify: usize,
    /// Concurrent dispatch workers.
    pub dispatch: usize,
    /// Sleep between empty dequeues.
    pub poll_interval_ms: u64,
    pub cleanup_interval_secs: u64,
    /// Timeout for every outbound HTTP request.
    pub request_timeout_secs: u64,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            verify: 8,
            dispatch: 4,
            poll_interval_ms: 50,
            cleanup_interval_secs: 60,
            request_timeout_secs: 30,
            shutdown_timeout_secs: 5,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Top-level service configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Public hostname: feed addresses are `<id>@hostname`, URLs are
    /// `https://hostname/...`.
    pub hostname: String,

    /// Holds the SQLite database and the `files/` blob tree.
    pub data_directory: PathBuf,

    pub environment: Environment,

    /// SMTP listen port. Defaults depend on `environment`, see [`Config::smtp_port`].
    pub smtp_port: Option<u16>,

    pub http_addr: String,

    pub run_type: RunType,

    pub workers: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            data_directory: PathBuf::from("./data"),
            environment: Environment::Production,
            smtp_port: None,
            http_addr: "0.0.0.0:8080".to_string(),
            run_type: RunType::All,
            workers: WorkerConfig::default(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 7] = [
        "hostname",
        "data_directory",
        "environment",
        "smtp_port",
        "http_addr",
        "run_type",
        "workers",
    ];

    const KNOWN_WORKER_KEYS: [&'static str; 6] = [
        "verify",
        "dispatch",
        "poll_interval_ms",
        "cleanup_interval_secs",
        "request_timeout_secs",
        "shutdown_timeout_secs",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to bound memory use
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
            if let Some(workers) = raw.get("workers").and_then(|w| w.as_table()) {
                for key in workers.keys() {
                    if !Self::KNOWN_WORKER_KEYS.contains(&key.as_str()) {
                        tracing::warn!(key = %key, "Unknown key in [workers], ignoring");
                    }
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), hostname = %config.hostname, "Loaded configuration");
        Ok(config)
    }

    /// Apply `LETTERBOX_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LETTERBOX_HOSTNAME") {
            self.hostname = v;
        }
        if let Some(v) = lookup("LETTERBOX_DATA_DIRECTORY") {
            self.data_directory = PathBuf::from(v);
        }
        if let Some(v) = lookup("LETTERBOX_ENVIRONMENT") {
            self.environment = v.parse().map_err(|()| ConfigError::InvalidValue {
                key: "LETTERBOX_ENVIRONMENT",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("LETTERBOX_SMTP_PORT") {
            let port = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "LETTERBOX_SMTP_PORT",
                value: v.clone(),
            })?;
            self.smtp_port = Some(port);
        }
        if let Some(v) = lookup("LETTERBOX_HTTP_ADDR") {
            self.http_addr = v;
        }
        if let Some(v) = lookup("LETTERBOX_RUN_TYPE") {
            self.run_type = v.parse().map_err(|()| ConfigError::InvalidValue {
                key: "LETTERBOX_RUN_TYPE",
                value: v.clone(),
            })?;
        }
        Ok(())
    }

    /// Reject configurations the service cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::MissingHostname);
        }
        if self.workers.verify == 0 {
            return Err(ConfigError::ZeroWorkers("workers.verify"));
        }
        if self.workers.dispatch == 0 {
            return Err(ConfigError::ZeroWorkers("workers.dispatch"));
        }
        if self.workers.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("workers.poll_interval_ms"));
        }
        if self.workers.cleanup_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("workers.cleanup_interval_secs"));
        }
        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    /// Configured port, else 25 in production and 2525 in development.
    pub fn smtp_port(&self) -> u16 {
        self.smtp_port
            .unwrap_or(if self.is_development() { 2525 } else { 25 })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_directory.join("letterbox.sqlite")
    }

    pub fn files_directory(&self) -> PathBuf {
        self.data_directory.join("files")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("letterbox.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.hostname, "");
        assert_eq!(config.data_directory, PathBuf::from("./data"));
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.smtp_port(), 25);
        assert_eq!(config.http_addr, "0.0.0.0:8080");
        assert_eq!(config.run_type, RunType::All);
        assert_eq!(config.workers.verify, 8);
        assert_eq!(config.workers.dispatch, 4);
        assert_eq!(config.workers.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.workers.cleanup_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_empty_file_returns_default() {
        let (_dir, path) = write_config("   \n  \n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.workers.verify, 8);
    }

    #[test]
    fn test_full_config() {
        let (_dir, path) = write_config(
            r#"
hostname = "mail.example.com"
data_directory = "/var/lib/letterbox"
environment = "development"
http_addr = "127.0.0.1:3000"
run_type = "background"

[workers]
verify = 2
dispatch = 1
poll_interval_ms = 10
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.hostname, "mail.example.com");
        assert_eq!(config.data_directory, PathBuf::from("/var/lib/letterbox"));
        assert!(config.is_development());
        assert_eq!(config.smtp_port(), 2525);
        assert_eq!(config.http_addr, "127.0.0.1:3000");
        assert_eq!(config.run_type, RunType::Background);
        assert_eq!(config.workers.verify, 2);
        assert_eq!(config.workers.dispatch, 1);
        assert_eq!(config.workers.poll_interval_ms, 10);
        // Unset worker keys keep their defaults
        assert_eq!(config.workers.shutdown_timeout_secs, 5);
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/letterbox/letterbox.sqlite")
        );
    }

    #[test]
    fn test_explicit_smtp_port_wins() {
        let (_dir, path) = write_config("environment = \"development\"\nsmtp_port = 587\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.smtp_port(), 587);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (_dir, path) = write_config("this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_environment_rejected() {
        let (_dir, path) = write_config("environment = \"staging\"\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (_dir, path) = write_config(
            "hostname = \"a.example\"\ntotally_fake_key = 1\n[workers]\nverfy = 3\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.hostname, "a.example");
        assert_eq!(config.workers.verify, 8);
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (_dir, path) = write_config(&"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LETTERBOX_HOSTNAME", "feeds.example.net"),
            ("LETTERBOX_ENVIRONMENT", "Development"),
            ("LETTERBOX_SMTP_PORT", "2626"),
            ("LETTERBOX_RUN_TYPE", "email"),
        ]);
        let mut config = Config::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.hostname, "feeds.example.net");
        assert!(config.is_development());
        assert_eq!(config.smtp_port(), 2626);
        assert_eq!(config.run_type, RunType::Email);
        assert_eq!(config.http_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_env_override_bad_port() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|k| (k == "LETTERBOX_SMTP_PORT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "LETTERBOX_SMTP_PORT",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_requires_hostname() {
        let mut config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingHostname)));

        config.hostname = "mail.example.com".to_string();
        assert!(config.validate().is_ok());

        config.workers.dispatch = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWorkers(_))));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = Config {
            hostname: "mail.example.com".to_string(),
            ..Config::default()
        };
        config.workers.cleanup_interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroInterval("workers.cleanup_interval_secs"))
        ));

        config.workers.cleanup_interval_secs = 60;
        config.workers.poll_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroInterval("workers.poll_interval_ms"))
        ));

        config.workers.poll_interval_ms = 50;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_run_type_components() {
        assert!(RunType::All.runs_http() && RunType::All.runs_smtp() && RunType::All.runs_workers());
        assert!(RunType::Server.runs_http() && !RunType::Server.runs_smtp());
        assert!(RunType::Email.runs_smtp() && !RunType::Email.runs_workers());
        assert!(RunType::Background.runs_workers() && !RunType::Background.runs_http());
    }
}
