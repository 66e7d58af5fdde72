//! Boardflow configuration types and loading
//!
//! YAML file with kebab-case keys, loaded from `.boardflow.yml` then
//! `~/.config/boardflow/boardflow.yml`, then defaults. Environment
//! variables override the orchestrator limits and credentials afterwards.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main boardflow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Board API settings
    pub board: BoardConfig,

    /// Code host settings
    pub codehost: CodeHostConfig,

    /// LLM provider settings
    pub llm: LlmConfig,

    /// Orchestrator limits and timeouts
    pub orchestrator: OrchestratorConfig,

    /// Storage settings
    pub storage: StorageConfig,

    /// Commands executed by the test / qa stages
    pub commands: CommandsConfig,
}

impl Config {
    /// Load configuration with fallback chain, then apply env overrides
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file_chain(config_path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_file_chain(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".boardflow.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("boardflow").join("boardflow.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply the recognized environment-variable overrides
    pub fn apply_env_overrides(&mut self) {
        fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        if let Some(v) = env_parse("MAX_CONCURRENT_RUNS") {
            self.orchestrator.max_concurrent_runs = v;
        }
        if let Some(v) = env_parse("WORKFLOW_TIMEOUT_SECONDS") {
            self.orchestrator.workflow_timeout_secs = v;
        }
        if let Some(v) = env_parse("VALIDATION_TIMEOUT_SECONDS") {
            self.orchestrator.validation_timeout_secs = v;
        }
        if let Some(v) = env_parse("VALIDATION_POLL_INTERVAL_SECONDS") {
            self.orchestrator.validation_poll_interval_secs = v;
        }
        if let Some(v) = env_parse("MAX_REJECTIONS") {
            self.orchestrator.max_rejections = v;
        }
        if let Some(v) = env_parse("MAX_DEBUG_ATTEMPTS") {
            self.orchestrator.max_debug_attempts = v;
        }
        if let Some(v) = env_parse("REACTIVATION_CONFIDENCE_THRESHOLD") {
            self.orchestrator.reactivation_confidence_threshold = v;
        }
        if let Some(v) = env_parse("QUEUE_RECOVERY_WINDOW_HOURS") {
            self.orchestrator.queue_recovery_window_hours = v;
        }
        if let Ok(v) = std::env::var("BOARD_API_URL") {
            self.board.base_url = v;
        }
        if let Ok(v) = std::env::var("CODEHOST_API_URL") {
            self.codehost.api_base_url = v;
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the webhook ingress
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Board API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Board API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Environment variable containing the API token
    #[serde(rename = "api-token-env")]
    pub api_token_env: String,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Status column labels written back to the board
    #[serde(rename = "status-working")]
    pub status_working: String,
    #[serde(rename = "status-done")]
    pub status_done: String,
    #[serde(rename = "status-failed")]
    pub status_failed: String,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.board.example.com/v2".to_string(),
            api_token_env: "BOARD_API_TOKEN".to_string(),
            timeout_ms: 30_000,
            status_working: "Working on it".to_string(),
            status_done: "Done".to_string(),
            status_failed: "Stuck".to_string(),
        }
    }
}

/// Code host settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeHostConfig {
    /// REST API base for pull-request operations
    #[serde(rename = "api-base-url")]
    pub api_base_url: String,

    /// Environment variable containing the API token
    #[serde(rename = "api-token-env")]
    pub api_token_env: String,

    /// Directory where repositories are cloned
    #[serde(rename = "workdir-base")]
    pub workdir_base: PathBuf,

    /// Branch prefix for feature branches
    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,

    /// Per-call timeout in milliseconds (clone can be slow)
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for CodeHostConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.github.com".to_string(),
            api_token_env: "CODEHOST_API_TOKEN".to_string(),
            workdir_base: PathBuf::from("/tmp/boardflow/workdirs"),
            branch_prefix: "boardflow".to_string(),
            timeout_ms: 120_000,
        }
    }
}

/// LLM provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 4096,
            timeout_ms: 120_000,
        }
    }
}

/// Orchestrator limits and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Cap on simultaneously running runs, system-wide
    #[serde(rename = "max-concurrent-runs")]
    pub max_concurrent_runs: usize,

    /// Maximum wall time for a running workflow
    #[serde(rename = "workflow-timeout-secs")]
    pub workflow_timeout_secs: u64,

    /// Maximum wait for a human validation reply
    #[serde(rename = "validation-timeout-secs")]
    pub validation_timeout_secs: u64,

    /// Steady polling interval while waiting for replies
    #[serde(rename = "validation-poll-interval-secs")]
    pub validation_poll_interval_secs: u64,

    /// Rejections allowed before the chain is forced to abandon
    #[serde(rename = "max-rejections")]
    pub max_rejections: u32,

    /// Debug/test loop attempts before proceeding to qa
    #[serde(rename = "max-debug-attempts")]
    pub max_debug_attempts: u32,

    /// Minimum intent confidence to reactivate a finished task
    #[serde(rename = "reactivation-confidence-threshold")]
    pub reactivation_confidence_threshold: f64,

    /// How far back to reload queue entries on startup
    #[serde(rename = "queue-recovery-window-hours")]
    pub queue_recovery_window_hours: i64,

    /// How often the queue sweeper runs
    #[serde(rename = "queue-sweep-interval-secs")]
    pub queue_sweep_interval_secs: u64,

    /// Budget for a single stage, wrapping adapter time plus retries
    #[serde(rename = "stage-timeout-secs")]
    pub stage_timeout_secs: u64,

    /// Retry backoff base and cap, in seconds
    #[serde(rename = "retry-backoff-base-secs")]
    pub retry_backoff_base_secs: u64,
    #[serde(rename = "retry-backoff-cap-secs")]
    pub retry_backoff_cap_secs: u64,

    /// Webhook log retention, months
    #[serde(rename = "webhook-retention-months")]
    pub webhook_retention_months: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 10,
            workflow_timeout_secs: 1800,
            validation_timeout_secs: 3600,
            validation_poll_interval_secs: 5,
            max_rejections: 3,
            max_debug_attempts: 3,
            reactivation_confidence_threshold: 0.2,
            queue_recovery_window_hours: 24,
            queue_sweep_interval_secs: 300,
            stage_timeout_secs: 600,
            retry_backoff_base_secs: 5,
            retry_backoff_cap_secs: 60,
            webhook_retention_months: 6,
        }
    }
}

impl OrchestratorConfig {
    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    pub fn validation_poll_interval(&self) -> Duration {
        Duration::from_secs(self.validation_poll_interval_secs)
    }

    pub fn queue_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.queue_sweep_interval_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the boardstore database
    #[serde(rename = "store-dir")]
    pub store_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(".boardstore"),
        }
    }
}

/// Commands run by the test and qa stages inside the working directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Project test suite command; empty means the stage is skipped
    #[serde(rename = "test-command")]
    pub test_command: String,

    /// Quality scan command; empty means the stage is skipped
    #[serde(rename = "qa-command")]
    pub qa_command: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.orchestrator.max_concurrent_runs, 10);
        assert_eq!(config.orchestrator.workflow_timeout_secs, 1800);
        assert_eq!(config.orchestrator.validation_timeout_secs, 3600);
        assert_eq!(config.orchestrator.max_rejections, 3);
        assert_eq!(config.orchestrator.max_debug_attempts, 3);
        assert_eq!(config.orchestrator.reactivation_confidence_threshold, 0.2);
        assert_eq!(config.orchestrator.queue_recovery_window_hours, 24);
        assert_eq!(config.server.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
server:
  bind: "127.0.0.1:9000"

orchestrator:
  max-concurrent-runs: 3
  workflow-timeout-secs: 900
  max-rejections: 2

commands:
  test-command: "make test"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.orchestrator.max_concurrent_runs, 3);
        assert_eq!(config.orchestrator.workflow_timeout_secs, 900);
        assert_eq!(config.orchestrator.max_rejections, 2);
        assert_eq!(config.commands.test_command, "make test");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
board:
  base-url: "https://board.internal/v2"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.board.base_url, "https://board.internal/v2");
        assert_eq!(config.board.api_token_env, "BOARD_API_TOKEN");
        assert_eq!(config.orchestrator.validation_poll_interval_secs, 5);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        // SAFETY: serialized test, restored below
        unsafe {
            std::env::set_var("MAX_CONCURRENT_RUNS", "2");
            std::env::set_var("VALIDATION_TIMEOUT_SECONDS", "120");
            std::env::set_var("REACTIVATION_CONFIDENCE_THRESHOLD", "0.5");
        }

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.orchestrator.max_concurrent_runs, 2);
        assert_eq!(config.orchestrator.validation_timeout_secs, 120);
        assert_eq!(config.orchestrator.reactivation_confidence_threshold, 0.5);

        unsafe {
            std::env::remove_var("MAX_CONCURRENT_RUNS");
            std::env::remove_var("VALIDATION_TIMEOUT_SECONDS");
            std::env::remove_var("REACTIVATION_CONFIDENCE_THRESHOLD");
        }
    }

    #[test]
    #[serial]
    fn test_env_overrides_ignore_garbage() {
        unsafe { std::env::set_var("MAX_CONCURRENT_RUNS", "not-a-number") };

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.orchestrator.max_concurrent_runs, 10);

        unsafe { std::env::remove_var("MAX_CONCURRENT_RUNS") };
    }
}
