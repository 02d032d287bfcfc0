//! Configuration for lifesync-server

use anyhow::{Context, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

/// Local inference server used for schedule generation and text intake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// When false every caller goes straight to its fallback
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_llm_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Budget for schedule generation calls
    #[serde(default = "default_schedule_timeout")]
    pub schedule_timeout_secs: u64,

    /// Budget for free-text parsing calls
    #[serde(default = "default_parse_timeout")]
    pub parse_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Human-readable name for the token
    pub name: String,
    /// User the token acts as
    pub user_id: String,
    /// The hashed API token (argon2 hash, or plain text for backwards compat)
    pub token_hash: String,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> PathBuf {
    PathBuf::from("lifesync.sqlite")
}

fn default_true() -> bool {
    true
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama2".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_schedule_timeout() -> u64 {
    30
}

fn default_parse_timeout() -> u64 {
    15
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_llm_url(),
            model: default_llm_model(),
            temperature: default_temperature(),
            schedule_timeout_secs: default_schedule_timeout(),
            parse_timeout_secs: default_parse_timeout(),
        }
    }
}

impl LlmConfig {
    pub fn schedule_timeout(&self) -> Duration {
        Duration::from_secs(self.schedule_timeout_secs)
    }

    pub fn parse_timeout(&self) -> Duration {
        Duration::from_secs(self.parse_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: default_bind(),
                port: default_port(),
            },
            database: DatabaseConfig {
                path: default_db_path(),
            },
            llm: LlmConfig::default(),
            tokens: Vec::new(),
        }
    }
}

impl Config {
    /// Default config path
    pub fn default_path() -> Result<PathBuf> {
        // Check environment variable first
        if let Ok(env_path) = std::env::var("LIFESYNC_CONFIG") {
            return Ok(PathBuf::from(env_path));
        }

        // Check for config in current directory
        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Ok(local);
        }

        // Check /data/config.toml (Docker default)
        let data_config = PathBuf::from("/data/config.toml");
        if data_config.exists() {
            return Ok(data_config);
        }

        // Then check XDG config
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("lifesync");

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from default path
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let with_comments = format!(
            "# lifesync-server configuration\n\n\
             {}\n\n\
             # Add tokens with: lifesync-server token --user <user-id> --name <device-name>\n",
            content
        );

        std::fs::write(path, with_comments).context("Failed to write config file")?;

        Ok(())
    }

    /// Resolve a bearer token to the user it acts as.
    ///
    /// Accepts argon2 hashes and legacy plain-text entries.
    pub fn resolve_token(&self, token: &str) -> Option<&str> {
        let argon2 = Argon2::default();

        self.tokens.iter().find_map(|t| {
            let matches = match PasswordHash::new(&t.token_hash) {
                Ok(parsed_hash) => argon2
                    .verify_password(token.as_bytes(), &parsed_hash)
                    .is_ok(),
                Err(_) => t.token_hash == token,
            };
            matches.then_some(t.user_id.as_str())
        })
    }
}

/// Hash a token using argon2
pub fn hash_token(token: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash token: {}", e))?;
    Ok(hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_use_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            [database]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert!(cfg.llm.enabled);
        assert_eq!(cfg.llm.schedule_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.llm.parse_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = Config::default();
        cfg.llm.model = "llama3".to_string();
        cfg.tokens.push(TokenConfig {
            name: "phone".to_string(),
            user_id: "alice".to_string(),
            token_hash: hash_token("secret").unwrap(),
        });
        cfg.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.llm.model, "llama3");
        assert_eq!(loaded.tokens.len(), 1);
        assert_eq!(loaded.resolve_token("secret"), Some("alice"));
    }

    #[test]
    fn tokens_resolve_to_their_user() {
        let mut cfg = Config::default();
        cfg.tokens.push(TokenConfig {
            name: "laptop".to_string(),
            user_id: "alice".to_string(),
            token_hash: hash_token("ls_alice").unwrap(),
        });
        cfg.tokens.push(TokenConfig {
            name: "legacy".to_string(),
            user_id: "bob".to_string(),
            token_hash: "ls_bob_plain".to_string(),
        });

        assert_eq!(cfg.resolve_token("ls_alice"), Some("alice"));
        assert_eq!(cfg.resolve_token("ls_bob_plain"), Some("bob"));
        assert_eq!(cfg.resolve_token("nope"), None);
    }
}
