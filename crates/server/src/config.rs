use std::{net::SocketAddr, str::FromStr};

use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid signaling setting: {0}")]
    InvalidSignaling(String),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SignalingConfig {
    /// Pending depth at which a mailbox write logs a warning. Mailboxes are
    /// never evicted, so this is the only signal that a recipient stopped
    /// reading.
    pub mailbox_warn_depth: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            mailbox_warn_depth: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub metrics: MetricsConfig,
    pub signaling: SignalingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Compact,
            database_url: None,
            metrics: MetricsConfig::default(),
            signaling: SignalingConfig::default(),
        }
    }
}

/// Values supplied on the command line; they win over files and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
    pub database_url: Option<String>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
    pub mailbox_warn_depth: Option<usize>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "FUSION_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("config/server.local").required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("log_format", defaults.log_format.as_str())?
            .set_default("metrics.enabled", defaults.metrics.enabled)?
            .set_default(
                "signaling.mailbox_warn_depth",
                defaults.signaling.mailbox_warn_depth as i64,
            )?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(bind_addr) = &overrides.bind_addr {
            self.bind_addr = Some(bind_addr.clone());
        }
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(log_format) = overrides.log_format {
            self.log_format = log_format;
        }
        if let Some(database_url) = &overrides.database_url {
            self.database_url = Some(database_url.clone());
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = enabled;
        }
        if let Some(bind_addr) = &overrides.metrics_bind_addr {
            self.metrics.bind_addr = Some(bind_addr.clone());
        }
        if let Some(depth) = overrides.mailbox_warn_depth {
            self.signaling.mailbox_warn_depth = depth;
        }
        self.validate()
    }

    /// Names of `FUSION_SERVER__*` variables present in the environment.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = std::env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(&prefix))
            .collect();
        keys.sort();
        keys
    }

    pub fn listener_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.bind_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if let Some(addr) = &self.metrics.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }
        if self.signaling.mailbox_warn_depth == 0 {
            return Err(ConfigError::InvalidSignaling(
                "mailbox_warn_depth must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogFormat::from_str(&value).map_err(D::Error::custom)
    }
}
