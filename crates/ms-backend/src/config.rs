use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// API key given directly. Prefer `api_key_cmd` or the environment.
    pub api_key: Option<String>,
    /// Command to run to get the API key (e.g., "pass show anthropic").
    /// The command is run via `sh -c`.
    pub api_key_cmd: Option<String>,
    pub base_url: String,
    /// Path segment before `/messages`.
    pub api_version: String,
    /// Value of the `anthropic-version` header.
    pub anthropic_version: String,
    /// Model used when a request names none.
    pub default_model: String,
    pub max_tokens: u32,
    pub connect_timeout_secs: u64,
    /// Longest gap allowed between two reads of the response body. A stream
    /// that keeps delivering data is never cut off by it.
    pub read_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_cmd: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_version: "v1".to_string(),
            anthropic_version: "2023-06-01".to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            connect_timeout_secs: 10,
            read_timeout_secs: 120,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load the user config, falling back to defaults when it is missing or broken.
    pub fn load_or_default() -> Self {
        let path = config_path();
        match Self::load(&path) {
            Ok(config) => config,
            Err(ConfigError::Io(_)) => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring config file");
                Self::default()
            }
        }
    }

    /// Resolve the API key: explicit key, then `api_key_cmd`, then ANTHROPIC_API_KEY.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = self.api_key.as_deref().map(str::trim) {
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }

        if let Some(cmd) = &self.api_key_cmd {
            let output = Command::new("sh").arg("-c").arg(cmd).output()?;

            if output.status.success() {
                let key = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !key.is_empty() {
                    return Ok(key);
                }
            }
            warn!("api_key_cmd produced no key, trying environment");
        }

        std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                ConfigError::Invalid(
                    "ANTHROPIC_API_KEY not set and no api_key or api_key_cmd configured"
                        .to_string(),
                )
            })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            return Err(ConfigError::Invalid(format!(
                "base_url must be an http(s) URL, got {:?}",
                self.base_url
            )));
        }
        if self.api_version.trim().is_empty() {
            return Err(ConfigError::Invalid("api_version is empty".to_string()));
        }
        if self.anthropic_version.trim().is_empty() {
            return Err(ConfigError::Invalid("anthropic_version is empty".to_string()));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be positive".to_string()));
        }
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    /// Full URL of the messages endpoint.
    pub fn messages_url(&self) -> String {
        format!(
            "{}/{}/messages",
            self.base_url.trim_end_matches('/'),
            self.api_version.trim_matches('/')
        )
    }
}

fn config_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("mstream").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.base_url, "https://api.anthropic.com/");
        assert_eq!(cfg.anthropic_version, "2023-06-01");
        assert_eq!(cfg.default_model, DEFAULT_MODEL);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parse_toml() {
        let toml_str = r#"
api_key_cmd = "pass show anthropic"
default_model = "claude-opus-4-20250514"
max_tokens = 1024
"#;
        let cfg: ClientConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.api_key_cmd.as_deref(), Some("pass show anthropic"));
        assert_eq!(cfg.default_model, "claude-opus-4-20250514");
        assert_eq!(cfg.max_tokens, 1024);
        assert_eq!(cfg.api_version, "v1");
    }

    #[test]
    fn parse_empty_toml() {
        let cfg: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, ClientConfig::default());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "base_url = \"http://localhost:8080\"").unwrap();
        writeln!(file, "read_timeout_secs = 30").unwrap();

        let cfg = ClientConfig::load(file.path()).unwrap();
        assert_eq!(cfg.base_url, "http://localhost:8080");
        assert_eq!(cfg.read_timeout_secs, 30);
        assert_eq!(cfg.messages_url(), "http://localhost:8080/v1/messages");
    }

    #[test]
    fn load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_tokens = \"lots\"").unwrap();
        assert!(matches!(
            ClientConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ClientConfig::load(&dir.path().join("absent.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn messages_url_joins_segments() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.messages_url(), "https://api.anthropic.com/v1/messages");

        let cfg = ClientConfig {
            base_url: "https://proxy.internal".to_string(),
            api_version: "/v2/".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.messages_url(), "https://proxy.internal/v2/messages");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad_url = ClientConfig {
            base_url: "api.anthropic.com".to_string(),
            ..Default::default()
        };
        assert!(matches!(bad_url.validate(), Err(ConfigError::Invalid(_))));

        let zero_tokens = ClientConfig {
            max_tokens: 0,
            ..Default::default()
        };
        assert!(zero_tokens.validate().is_err());
    }

    #[test]
    fn explicit_key_wins() {
        let cfg = ClientConfig {
            api_key: Some("sk-explicit".to_string()),
            api_key_cmd: Some("echo from_cmd".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.resolve_api_key().unwrap(), "sk-explicit");
    }

    #[test]
    fn resolve_api_key_from_cmd() {
        let cfg = ClientConfig {
            api_key_cmd: Some("echo test_key_123".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.resolve_api_key().unwrap(), "test_key_123");
    }

    #[test]
    fn resolve_api_key_cmd_failure_fallback() {
        // The only test in this binary that touches ANTHROPIC_API_KEY.
        let saved = std::env::var("ANTHROPIC_API_KEY").ok();
        let cfg = ClientConfig {
            api_key: None,
            api_key_cmd: Some("exit 1".to_string()),
            ..Default::default()
        };

        std::env::set_var("ANTHROPIC_API_KEY", "sk-from-env");
        let from_env = cfg.resolve_api_key();

        std::env::remove_var("ANTHROPIC_API_KEY");
        let missing = cfg.resolve_api_key();

        if let Some(value) = saved {
            std::env::set_var("ANTHROPIC_API_KEY", value);
        }

        assert_eq!(from_env.unwrap(), "sk-from-env");
        match missing {
            Err(ConfigError::Invalid(message)) => assert!(message.contains("ANTHROPIC_API_KEY")),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }
}
