use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidValue {
        path: PathBuf,
        field: String,
        value: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError { path, source } => {
                write!(
                    f,
                    "Failed to read config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::ParseError { path, source } => {
                write!(f, "Invalid TOML syntax in {}: {}", path.display(), source)
            }
            ConfigError::InvalidValue { path, field, value } => {
                write!(
                    f,
                    "Invalid value '{}' for '{}' in {}",
                    value,
                    field,
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
            ConfigError::InvalidValue { .. } => None,
        }
    }
}

/// Global config instance (uses default if load fails at static init)
static GLOBAL_CONFIG: LazyLock<RwLock<Config>> =
    LazyLock::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get a clone of the global config
pub fn get_config() -> Config {
    GLOBAL_CONFIG.read().clone()
}

/// Initialize global config with overrides
pub fn init_config(config: Config) {
    *GLOBAL_CONFIG.write() = config;
}

/// ccrelay configuration loaded from `~/.config/ccrelay/config.toml`.
///
/// All fields have sensible defaults and can be overridden via CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Optional API key for authenticating requests to /v1/* endpoints
    #[serde(default)]
    pub api_key: Option<String>,
    /// Request timeout in seconds (default: 300 = 5 minutes)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsConfig {
    /// Enable model fallback when every account is exhausted on a model
    #[serde(default)]
    pub fallback: bool,
    /// Maximum number of accounts loaded from the store (default: 20)
    #[serde(default = "default_max_accounts")]
    pub max_accounts: usize,
    /// Override path of the persisted account store
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

fn default_max_accounts() -> usize {
    20
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            fallback: false,
            max_accounts: default_max_accounts(),
            store_path: None,
        }
    }
}

/// Knobs of the request dispatcher.
///
/// Example in `config.toml`:
/// ```toml
/// [dispatch]
/// max_retries = 3
/// default_cooldown_ms = 30000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Access token cache TTL in seconds (default: 300 = 5 minutes)
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// Cooldown applied when a 429 carries no reset hint (default: 10 s)
    #[serde(default = "default_cooldown_ms")]
    pub default_cooldown_ms: u64,
    /// Maximum dispatch attempts across accounts (default: 5)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Longest rate-limit reset the dispatcher sleeps through before
    /// surfacing an error (default: 120 s)
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_before_error_ms: u64,
    /// Upstream API timeout in seconds (default: 120)
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
    /// Project id used when loadCodeAssist discovery fails on all endpoints
    #[serde(default)]
    pub default_project_id: Option<String>,
}

fn default_token_ttl() -> u64 {
    300
}

fn default_cooldown_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_wait_ms() -> u64 {
    120_000
}

fn default_api_timeout() -> u64 {
    120
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl(),
            default_cooldown_ms: default_cooldown_ms(),
            max_retries: default_max_retries(),
            max_wait_before_error_ms: default_max_wait_ms(),
            timeout_secs: default_api_timeout(),
            default_project_id: None,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            api_key: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Config {
    pub fn dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ccrelay")
    }

    pub fn path() -> PathBuf {
        Self::dir().join("config.toml")
    }

    /// Path of the persisted account store.
    pub fn accounts_path(&self) -> PathBuf {
        self.accounts
            .store_path
            .clone()
            .unwrap_or_else(|| Self::dir().join("accounts.json"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path();
        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
                path: path.clone(),
                source: e,
            })?;
            let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.clone(),
                source: e,
            })?;

            if config.dispatch.max_retries == 0 {
                return Err(ConfigError::InvalidValue {
                    path,
                    field: "dispatch.max_retries".to_string(),
                    value: "0".to_string(),
                });
            }

            if config.accounts.max_accounts == 0 {
                return Err(ConfigError::InvalidValue {
                    path,
                    field: "accounts.max_accounts".to_string(),
                    value: "0".to_string(),
                });
            }

            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn with_overrides(mut self, port: Option<u16>, host: Option<String>, debug: bool) -> Self {
        if let Some(p) = port {
            self.server.port = p;
        }
        if let Some(h) = host {
            self.server.host = h;
        }
        if debug {
            self.logging.debug = true;
        }
        // Check for API_KEY environment variable
        if let Ok(api_key) = std::env::var("API_KEY") {
            self.server.api_key = Some(api_key);
        }
        self
    }
}
