//! Unified configuration for leadboard.
//!
//! Settings are layered: built-in defaults, then `.leadboard/leadboard.toml`,
//! then environment variables (a `.env` file is loaded first), then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! db_path = ".leadboard/leadboard.db"
//! allowed_origins = ["http://localhost:3000"]
//! session_ttl_hours = 336
//!
//! [assistant]
//! model = "gpt-4-1106-preview"
//! base_url = "https://api.openai.com/v1"
//! temperature = 0.1
//! context_messages = 10
//!
//! [tasks]
//! workers = 4
//! queue_capacity = 256
//! result_ttl_hours = 24
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Values shipped in example `.env` files that mean "not configured".
const PLACEHOLDER_KEYS: &[&str] = &["", "placeholder-key", "your-openai-api-key"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Browser origins allowed to make credentialed requests.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".leadboard/leadboard.db")
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
    ]
}

fn default_session_ttl_hours() -> i64 {
    24 * 14
}

fn default_bcrypt_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            allowed_origins: default_allowed_origins(),
            session_ttl_hours: default_session_ttl_hours(),
            bcrypt_cost: default_bcrypt_cost(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantSection {
    /// API key for the chat completions endpoint. Usually supplied via `OPENAI_API_KEY`.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// How many user/assistant messages of session context are replayed to the model.
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String {
    "gpt-4-1106-preview".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_context_messages() -> usize {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for AssistantSection {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            base_url: default_base_url(),
            temperature: default_temperature(),
            context_messages: default_context_messages(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl AssistantSection {
    /// The API key, if one is set and is not a known placeholder.
    pub fn effective_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !PLACEHOLDER_KEYS.contains(k))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksSection {
    /// Maximum chat tasks processed concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Finished tasks older than this are pruned.
    #[serde(default = "default_result_ttl_hours")]
    pub result_ttl_hours: i64,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_result_ttl_hours() -> i64 {
    24
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            result_ttl_hours: default_result_ttl_hours(),
        }
    }
}

/// Root of `leadboard.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrmConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub assistant: AssistantSection,
    #[serde(default)]
    pub tasks: TasksSection,
}

impl CrmConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse leadboard.toml")
    }

    /// Load `leadboard.toml` from the config directory, or defaults if it doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join("leadboard.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// File → `.env` → process environment.
    pub fn resolve(config_dir: &Path) -> Result<Self> {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();
        let mut config = Self::load_or_default(config_dir)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("LEADBOARD_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(host) = lookup("LEADBOARD_HOST") {
            self.server.host = host;
        }
        if let Some(path) = lookup("LEADBOARD_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(origins) = lookup("LEADBOARD_ALLOWED_ORIGINS") {
            self.server.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.assistant.api_key = Some(key);
        }
        if let Some(model) = lookup("LEADBOARD_MODEL") {
            self.assistant.model = model;
        }
        if let Some(url) = lookup("LEADBOARD_OPENAI_BASE_URL") {
            self.assistant.base_url = url;
        }
        if let Some(workers) = lookup("LEADBOARD_WORKERS").and_then(|v| v.parse().ok()) {
            self.tasks.workers = workers;
        }
    }

    /// Save configuration to a TOML file. The API key is never written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize leadboard.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Human-readable problems with the configuration. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.tasks.workers == 0 {
            problems.push("tasks.workers must be at least 1".to_string());
        }
        if self.tasks.queue_capacity == 0 {
            problems.push("tasks.queue_capacity must be at least 1".to_string());
        }
        if self.server.session_ttl_hours <= 0 {
            problems.push("server.session_ttl_hours must be positive".to_string());
        }
        if !(4..=31).contains(&self.server.bcrypt_cost) {
            problems.push("server.bcrypt_cost must be between 4 and 31".to_string());
        }
        if !(0.0..=2.0).contains(&self.assistant.temperature) {
            problems.push("assistant.temperature must be between 0.0 and 2.0".to_string());
        }
        if self.assistant.context_messages == 0 {
            problems.push("assistant.context_messages must be at least 1".to_string());
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = CrmConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.db_path, PathBuf::from(".leadboard/leadboard.db"));
        assert_eq!(config.assistant.context_messages, 10);
        assert_eq!(config.tasks.workers, 4);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = CrmConfig::parse(
            r#"
            [server]
            port = 9100

            [tasks]
            workers = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.tasks.workers, 2);
        assert_eq!(config.tasks.result_ttl_hours, 24);
        assert_eq!(config.assistant.model, "gpt-4-1106-preview");
    }

    #[test]
    fn test_parse_rejects_malformed_toml() {
        assert!(CrmConfig::parse("[server\nport = ").is_err());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = TempDir::new().unwrap();
        let config = CrmConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_save_then_load_omits_api_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("leadboard.toml");
        let mut config = CrmConfig::default();
        config.server.port = 8123;
        config.assistant.api_key = Some("sk-secret".into());
        config.save(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("sk-secret"));

        let loaded = CrmConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 8123);
        assert!(loaded.assistant.api_key.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LEADBOARD_PORT", "9000"),
            ("LEADBOARD_DB_PATH", "/tmp/crm.db"),
            ("LEADBOARD_ALLOWED_ORIGINS", "https://crm.example.com, ,http://localhost:5173"),
            ("OPENAI_API_KEY", "sk-live"),
            ("LEADBOARD_WORKERS", "not-a-number"),
        ]);
        let mut config = CrmConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.db_path, PathBuf::from("/tmp/crm.db"));
        assert_eq!(
            config.server.allowed_origins,
            vec!["https://crm.example.com", "http://localhost:5173"]
        );
        assert_eq!(config.assistant.effective_api_key(), Some("sk-live"));
        // Unparseable values leave the default in place.
        assert_eq!(config.tasks.workers, 4);
    }

    #[test]
    fn test_placeholder_api_key_is_unconfigured() {
        let mut assistant = AssistantSection::default();
        assert_eq!(assistant.effective_api_key(), None);
        assistant.api_key = Some("placeholder-key".into());
        assert_eq!(assistant.effective_api_key(), None);
        assistant.api_key = Some("  ".into());
        assert_eq!(assistant.effective_api_key(), None);
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = CrmConfig::default();
        config.tasks.workers = 0;
        config.server.bcrypt_cost = 2;
        let problems = config.validate();
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.contains("workers")));
        assert!(problems.iter().any(|p| p.contains("bcrypt_cost")));
    }
}
