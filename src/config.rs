//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$PAPERCUT_CONFIG` (environment variable)
//! 2. `~/.config/papercut/config.toml` (Linux/macOS)
//!    `%APPDATA%\papercut\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// SMTP listener settings.
    pub smtp: SmtpConfig,
    /// Where captured messages are kept.
    pub storage: StorageConfig,
    /// Message preview tuning.
    pub preview: PreviewConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// SMTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Address to listen on.
    pub host: String,
    /// TCP port (0 = any free port).
    pub port: u16,
    /// Name announced in the greeting and EHLO reply.
    pub hostname: String,
    /// Maximum length of a command or text line, excluding CRLF.
    pub max_line_length: usize,
    /// Seconds a connection may stay silent before it is dropped.
    pub idle_timeout_secs: u64,
}

/// Message directory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one file per captured message.
    pub message_dir: Option<PathBuf>,
    /// File extension of captured messages (without the dot).
    pub extension: String,
}

/// Message preview tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Read chunk size in bytes; cancellation is checked between chunks.
    pub read_chunk_size: usize,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 25,
            hostname: "papercut".to_string(),
            max_line_length: 1000,
            idle_timeout_secs: 300,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            message_dir: None,
            extension: "eml".to_string(),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 64 * 1024, // 64 KB
        }
    }
}

impl SmtpConfig {
    /// `host:port` as a socket address string.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

// ── Load ────────────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("PAPERCUT_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    dirs::config_dir().map(|d| d.join("papercut").join("config.toml"))
}

/// Return the directory captured messages are written to.
pub fn message_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.storage.message_dir {
        return dir.clone();
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("papercut")
        .join("messages")
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("papercut")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.smtp.host, "127.0.0.1");
        assert_eq!(cfg.smtp.port, 25);
        assert_eq!(cfg.storage.extension, "eml");
        assert_eq!(cfg.general.log_level, "warn");
        assert_eq!(cfg.preview.read_chunk_size, 65536);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[smtp]
port = 2525

[storage]
message_dir = "/tmp/mail"
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.smtp.port, 2525);
        assert_eq!(cfg.smtp.host, "127.0.0.1");
        assert_eq!(message_dir(&cfg), PathBuf::from("/tmp/mail"));
        assert_eq!(cfg.storage.extension, "eml");
    }

    #[test]
    fn test_address_formatting() {
        let mut smtp = SmtpConfig::default();
        smtp.port = 2525;
        assert_eq!(smtp.address(), "127.0.0.1:2525");
        smtp.host = "::1".to_string();
        assert_eq!(smtp.address(), "[::1]:2525");
    }

    #[test]
    fn test_serialize_roundtrip_keeps_smtp_settings() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.smtp, cfg.smtp);
    }
}
