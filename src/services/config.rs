use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{ChatError, Result};

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Relay server address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// `ws` or `wss`. HTTP endpoints use the matching `http`/`https`.
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            scheme: "ws".to_string(),
            host: "localhost".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before the connection is declared failed.
    pub max_retries: u32,
    /// Upper bound on one connection attempt, handshake included.
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            max_retries: 3,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// How long a sent message waits for its delivery receipt.
    pub timeout_ms: u64,
    /// Max message content size in bytes.
    pub max_message_size: usize,
    /// Timeout for directory HTTP requests.
    pub http_timeout_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            max_message_size: 64 * 1024,
            http_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("parley"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub server: ServerSettings,
    pub reconnect: ReconnectSettings,
    pub delivery: DeliverySettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

impl ChatConfig {
    /// `{scheme}://{host}:{port}/ws/{local_id}`
    pub fn websocket_url(&self, local_id: &str) -> Result<Url> {
        if local_id.is_empty() {
            return Err(ChatError::Config("Local user id is empty".to_string()));
        }
        let mut url = self.base_url(&self.server.scheme)?;
        url.path_segments_mut()
            .map_err(|_| ChatError::Config("Server URL cannot take a path".to_string()))?
            .pop_if_empty()
            .push("ws")
            .push(local_id);
        Ok(url)
    }

    /// Base URL of the relay's HTTP endpoints.
    pub fn http_base_url(&self) -> Result<Url> {
        let scheme = match self.server.scheme.as_str() {
            "wss" | "https" => "https",
            _ => "http",
        };
        self.base_url(scheme)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect.connect_timeout_ms)
    }

    fn base_url(&self, scheme: &str) -> Result<Url> {
        let raw = format!("{}://{}:{}/", scheme, self.server.host, self.server.port);
        let url = Url::parse(&raw)
            .map_err(|e| ChatError::Config(format!("Invalid server address {}: {}", raw, e)))?;
        if url.host_str().is_none() {
            return Err(ChatError::Config(format!("No host in {}", raw)));
        }
        Ok(url)
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.server.scheme.as_str(), "ws" | "wss") {
            return Err(ChatError::Config(format!(
                "Unsupported scheme '{}' (expected ws or wss)",
                self.server.scheme
            )));
        }
        self.base_url(&self.server.scheme)?;
        let reconnect = &self.reconnect;
        if reconnect.base_delay_ms == 0 || reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(ChatError::Config(
                "Reconnect delays must satisfy 0 < base_delay_ms <= max_delay_ms".to_string(),
            ));
        }
        if reconnect.connect_timeout_ms == 0 {
            return Err(ChatError::Config("Connect timeout must be positive".to_string()));
        }
        if self.delivery.timeout_ms == 0 {
            return Err(ChatError::Config("Delivery timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Loads and saves [`ChatConfig`]: defaults, then the TOML file, then
/// `PARLEY__SECTION__KEY` environment variables.
#[derive(Debug)]
pub struct ConfigService {
    config: ChatConfig,
    path: PathBuf,
}

impl ConfigService {
    /// Load from the default location, falling back to defaults on error.
    pub fn new() -> Self {
        let path = Self::default_path();
        let config = match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Failed to load config from {:?}, using defaults: {}", path, e);
                ChatConfig::default()
            }
        };
        Self { config, path }
    }

    pub fn with_path(path: &Path) -> Result<Self> {
        Ok(Self {
            config: Self::load(path)?,
            path: path.to_path_buf(),
        })
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
            .join("config.toml")
    }

    pub fn load(path: &Path) -> Result<ChatConfig> {
        Self::load_from(path, None)
    }

    /// `env` replaces the process environment when given.
    fn load_from(path: &Path, env: Option<HashMap<String, String>>) -> Result<ChatConfig> {
        let defaults = config::Config::try_from(&ChatConfig::default())?;
        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let config: ChatConfig = settings.try_deserialize()?;
        config.validate()?;
        log::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn get(&self) -> ChatConfig {
        self.config.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn update(&mut self, config: ChatConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ChatError::storage("Create config dir", e))?;
        }
        let data = toml::to_string_pretty(&self.config)
            .map_err(|e| ChatError::Config(format!("Serialize config: {}", e)))?;
        std::fs::write(&self.path, data).map_err(|e| ChatError::storage("Write config", e))?;
        log::info!("Saved config to {:?}", self.path);
        Ok(())
    }
}

impl Default for ConfigService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert_eq!(config.reconnect.max_retries, 3);
        assert_eq!(config.delivery.timeout_ms, 5000);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert!(config.storage.data_dir.ends_with("parley"));
        config.validate().unwrap();
    }

    #[test]
    fn test_urls() {
        let mut config = ChatConfig::default();
        config.server.host = "chat.example.org".to_string();
        config.server.port = 9000;
        assert_eq!(
            config.websocket_url("u-1").unwrap().as_str(),
            "ws://chat.example.org:9000/ws/u-1"
        );
        assert_eq!(
            config.http_base_url().unwrap().as_str(),
            "http://chat.example.org:9000/"
        );

        config.server.scheme = "wss".to_string();
        assert!(config.http_base_url().unwrap().as_str().starts_with("https://"));
        assert!(config.websocket_url("").is_err());
    }

    #[test]
    fn test_file_then_env_override() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nhost = \"relay.local\"\nport = 7000\n\n[delivery]\ntimeout_ms = 2500\n",
        )
        .unwrap();

        let env = HashMap::from([("PARLEY__SERVER__PORT".to_string(), "7100".to_string())]);
        let config = ConfigService::load_from(&path, Some(env)).unwrap();
        assert_eq!(config.server.host, "relay.local");
        assert_eq!(config.server.port, 7100);
        assert_eq!(config.delivery.timeout_ms, 2500);
        assert_eq!(config.reconnect, ReconnectSettings::default());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config =
            ConfigService::load_from(&tmp.path().join("absent.toml"), Some(HashMap::new())).unwrap();
        assert_eq!(config, ChatConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");
        let mut service = ConfigService::with_path(&path).unwrap();

        let mut config = service.get();
        config.server.host = "10.0.0.2".to_string();
        config.reconnect.max_retries = 5;
        service.update(config.clone()).unwrap();

        let reloaded = ConfigService::load_from(&path, Some(HashMap::new())).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = ChatConfig::default();
        config.server.scheme = "ftp".to_string();
        assert!(config.validate().is_err());

        let mut config = ChatConfig::default();
        config.reconnect.max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = ChatConfig::default();
        config.reconnect.connect_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
