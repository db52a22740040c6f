//! Package manager configuration (config.toml)
//!
//! ```toml
//! base_repository_url = "https://dc.ameko.moe/base.json"
//! repository_urls = ["https://example.com/my-scripts.json"]
//! workers = 4
//! request_timeout_secs = 30
//! ```
//!
//! Every key is optional.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading or saving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read or write the config file
    #[error("Failed to access config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize TOML
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Home directory unknown
    #[error("Could not determine home directory")]
    NoHomeDir,

    /// Validation error
    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Repository every installation starts from
pub const DEFAULT_BASE_REPOSITORY: &str = "https://dc.ameko.moe/base.json";

/// Package manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root repository resolved before the user's own
    pub base_repository_url: String,

    /// Additional root repositories
    pub repository_urls: Vec<String>,

    /// Where installed scripts are stored (defaults to `~/.scriptpm/scripts`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scripts_dir: Option<PathBuf>,

    /// Maximum concurrent manifest fetches
    pub workers: usize,

    pub request_timeout_secs: u64,

    pub connect_timeout_secs: u64,

    /// Maximum accepted response size in bytes
    pub max_content_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_repository_url: DEFAULT_BASE_REPOSITORY.to_string(),
            repository_urls: Vec::new(),
            scripts_dir: None,
            workers: num_cpus::get().clamp(1, 8),
            request_timeout_secs: crate::fetch::REQUEST_TIMEOUT.as_secs(),
            connect_timeout_secs: crate::fetch::CONNECT_TIMEOUT.as_secs(),
            max_content_size: crate::fetch::MAX_CONTENT_SIZE,
        }
    }
}

impl Config {
    /// Parse configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load `~/.scriptpm/config.toml`
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(&Self::default_path()?)
    }

    /// Write configuration to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_repository_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "base_repository_url cannot be empty".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::ValidationError(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// `~/.scriptpm`
    pub fn home() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".scriptpm"))
    }

    /// `~/.scriptpm/config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::home()?.join("config.toml"))
    }

    /// Configured scripts directory, or `~/.scriptpm/scripts`
    pub fn scripts_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.scripts_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::home()?.join("scripts")),
        }
    }

    /// Root URLs to resolve: base repository first, then user URLs, no duplicates
    pub fn root_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::with_capacity(self.repository_urls.len() + 1);
        for url in std::iter::once(&self.base_repository_url).chain(&self.repository_urls) {
            let url = url.trim();
            if !url.is_empty() && !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        }
        urls
    }

    /// Remember an additional repository URL; returns `false` if already present
    pub fn add_repository_url(&mut self, url: &str) -> bool {
        let url = url.trim();
        if url == self.base_repository_url || self.repository_urls.iter().any(|u| u == url) {
            return false;
        }
        self.repository_urls.push(url.to_string());
        true
    }

    /// Forget an additional repository URL; returns `false` if it was not present
    pub fn remove_repository_url(&mut self, url: &str) -> bool {
        let before = self.repository_urls.len();
        self.repository_urls.retain(|u| u != url.trim());
        self.repository_urls.len() != before
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.base_repository_url, DEFAULT_BASE_REPOSITORY);
        assert!(config.repository_urls.is_empty());
        assert!(config.workers >= 1);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
repository_urls = ["https://a.example/repo.json", "https://b.example/repo.json"]
workers = 2
scripts_dir = "/tmp/scripts"
"#;
        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.repository_urls.len(), 2);
        assert_eq!(config.workers, 2);
        assert_eq!(config.scripts_dir().unwrap(), PathBuf::from("/tmp/scripts"));
    }

    #[test]
    fn test_rejects_zero_workers() {
        assert!(matches!(
            Config::from_str("workers = 0"),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_root_urls_dedup() {
        let mut config = Config::default();
        config.repository_urls = vec![
            "https://a.example/repo.json".to_string(),
            DEFAULT_BASE_REPOSITORY.to_string(),
            " https://a.example/repo.json ".to_string(),
        ];
        assert_eq!(
            config.root_urls(),
            vec![DEFAULT_BASE_REPOSITORY, "https://a.example/repo.json"]
        );
    }

    #[test]
    fn test_add_remove_repository_url() {
        let mut config = Config::default();
        assert!(config.add_repository_url("https://a.example/repo.json"));
        assert!(!config.add_repository_url("https://a.example/repo.json"));
        assert!(!config.add_repository_url(DEFAULT_BASE_REPOSITORY));
        assert!(config.remove_repository_url("https://a.example/repo.json"));
        assert!(!config.remove_repository_url("https://a.example/repo.json"));
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.add_repository_url("https://a.example/repo.json");
        config.workers = 3;
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
