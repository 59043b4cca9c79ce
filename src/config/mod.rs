//! Client configuration
//!
//! Loaded from a TOML file, overridden by `TURBACZ_*` environment variables,
//! and checked by [`ClientConfig::validate`] before a session starts.

pub mod token;

pub use token::{
    cookie_value, CookieFileToken, EnvToken, NoToken, StaticToken, TokenConfig, TokenProvider,
};

use crate::error::{Result, SessionError};
use crate::session::backoff::{DEFAULT_CEILING, DEFAULT_FLOOR};
use crate::session::Channel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{env, time::Duration};
use url::Url;

/// What happens to an optimistic flip when the frame cannot be handed to
/// the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendFailurePolicy {
    /// Leave the flipped value until the server or the timeout resolves it
    #[default]
    KeepOptimistic,
    /// Restore the previous value immediately
    Rollback,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Dashboard server, e.g. `https://home.example.com`
    pub server: Url,

    /// Channel to join
    #[serde(default = "default_channel")]
    pub channel: Channel,

    #[serde(default)]
    pub token: TokenConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub liveness: LivenessConfig,

    #[serde(default)]
    pub commands: CommandConfig,
}

fn default_channel() -> Channel {
    Channel::Lights
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First retry delay, restored after every successful open
    #[serde(with = "humantime_serde")]
    pub floor: Duration,

    /// Upper bound for the doubled delay
    #[serde(with = "humantime_serde")]
    pub ceiling: Duration,

    /// Time allowed for one connection handshake
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// How long a toggle blocks further toggles of the same target
    #[serde(with = "humantime_serde")]
    pub pending_timeout: Duration,

    pub send_failure: SendFailurePolicy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            floor: DEFAULT_FLOOR,
            ceiling: DEFAULT_CEILING,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            pending_timeout: Duration::from_millis(2000),
            send_failure: SendFailurePolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(server: Url, channel: Channel) -> Self {
        Self {
            server,
            channel,
            token: TokenConfig::default(),
            reconnect: ReconnectConfig::default(),
            liveness: LivenessConfig::default(),
            commands: CommandConfig::default(),
        }
    }

    /// Load a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SessionError::config(format!("Cannot read {}: {e}", path.display()))
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Build the configuration from environment variables alone.
    /// `TURBACZ_URL` is required.
    pub fn from_env() -> Result<Self> {
        let url = env::var("TURBACZ_URL")
            .map_err(|_| SessionError::config("TURBACZ_URL is not set"))?;
        let server = parse_url("TURBACZ_URL", &url)?;

        let mut config = Self::new(server, default_channel());
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `TURBACZ_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = env::var("TURBACZ_URL") {
            self.server = parse_url("TURBACZ_URL", &url)?;
        }

        if let Ok(channel) = env::var("TURBACZ_CHANNEL") {
            self.channel = channel
                .parse()
                .map_err(|e| SessionError::config(format!("Invalid TURBACZ_CHANNEL: {e}")))?;
        }

        if let Ok(token) = env::var("TURBACZ_TOKEN") {
            self.token = TokenConfig::Static { token };
        } else if let Ok(path) = env::var("TURBACZ_COOKIE_FILE") {
            self.token = TokenConfig::CookieFile {
                path: PathBuf::from(path),
                cookie: token::DEFAULT_COOKIE.to_string(),
            };
        }

        if let Some(floor) = env_millis("TURBACZ_RECONNECT_FLOOR_MS")? {
            self.reconnect.floor = floor;
        }
        if let Some(ceiling) = env_millis("TURBACZ_RECONNECT_CEILING_MS")? {
            self.reconnect.ceiling = ceiling;
        }
        if let Some(interval) = env_millis("TURBACZ_LIVENESS_INTERVAL_MS")? {
            self.liveness.interval = interval;
        }
        if let Some(timeout) = env_millis("TURBACZ_PENDING_TIMEOUT_MS")? {
            self.commands.pending_timeout = timeout;
        }

        if let Ok(rollback) = env::var("TURBACZ_ROLLBACK_ON_SEND_FAILURE") {
            let rollback = parse_flag("TURBACZ_ROLLBACK_ON_SEND_FAILURE", &rollback)?;
            self.commands.send_failure = if rollback {
                SendFailurePolicy::Rollback
            } else {
                SendFailurePolicy::KeepOptimistic
            };
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.server.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => {
                return Err(SessionError::config(format!(
                    "Server URL must use http, https, ws or wss, not {other}"
                )))
            }
        }

        if self.server.host_str().is_none() {
            return Err(SessionError::config("Server URL has no host"));
        }

        if self.reconnect.floor.is_zero() {
            return Err(SessionError::config(
                "Reconnect floor must be greater than zero",
            ));
        }

        if self.reconnect.ceiling < self.reconnect.floor {
            return Err(SessionError::config(
                "Reconnect ceiling must not be below the floor",
            ));
        }

        if self.reconnect.connect_timeout.is_zero() {
            return Err(SessionError::config(
                "Connect timeout must be greater than zero",
            ));
        }

        if self.liveness.enabled && self.liveness.interval.is_zero() {
            return Err(SessionError::config(
                "Liveness interval must be greater than zero",
            ));
        }

        if self.commands.pending_timeout.is_zero() {
            return Err(SessionError::config(
                "Pending command timeout must be greater than zero",
            ));
        }

        Ok(())
    }
}

fn parse_url(var: &str, value: &str) -> Result<Url> {
    value
        .parse()
        .map_err(|e| SessionError::config(format!("Invalid {var}: {e}")))
}

fn env_millis(var: &str) -> Result<Option<Duration>> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| SessionError::config(format!("Invalid {var}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn parse_flag(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SessionError::config(format!(
            "Invalid {var}: {other}. Use true or false"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::io::Write;

    const ALL_VARS: [&str; 9] = [
        "TURBACZ_URL",
        "TURBACZ_CHANNEL",
        "TURBACZ_TOKEN",
        "TURBACZ_COOKIE_FILE",
        "TURBACZ_RECONNECT_FLOOR_MS",
        "TURBACZ_RECONNECT_CEILING_MS",
        "TURBACZ_LIVENESS_INTERVAL_MS",
        "TURBACZ_PENDING_TIMEOUT_MS",
        "TURBACZ_ROLLBACK_ON_SEND_FAILURE",
    ];

    /// Every variable unset except the given overrides
    fn env_with(
        overrides: &[(&'static str, &'static str)],
    ) -> Vec<(&'static str, Option<&'static str>)> {
        ALL_VARS
            .iter()
            .map(|var| {
                let value = overrides
                    .iter()
                    .find(|(name, _)| name == var)
                    .map(|(_, value)| *value);
                (*var, value)
            })
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new(
            "https://home.example.com".parse().unwrap(),
            Channel::Lights,
        );
        assert_eq!(config.reconnect.floor, Duration::from_secs(1));
        assert_eq!(config.reconnect.ceiling, Duration::from_secs(30));
        assert_eq!(config.liveness.interval, Duration::from_secs(30));
        assert_eq!(config.commands.pending_timeout, Duration::from_millis(2000));
        assert_eq!(
            config.commands.send_failure,
            SendFailurePolicy::KeepOptimistic
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
server = "https://home.example.com"
channel = "rcm"

[token]
source = "static"
token = "abc"

[reconnect]
floor = "500ms"
ceiling = "1m"

[commands]
pending_timeout = "3s"
send_failure = "rollback"
"#
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.channel, Channel::RelayManager);
        assert_eq!(
            config.token,
            TokenConfig::Static {
                token: "abc".into()
            }
        );
        assert_eq!(config.reconnect.floor, Duration::from_millis(500));
        assert_eq!(config.reconnect.ceiling, Duration::from_secs(60));
        assert_eq!(config.reconnect.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.commands.pending_timeout, Duration::from_secs(3));
        assert_eq!(config.commands.send_failure, SendFailurePolicy::Rollback);
        assert!(config.liveness.enabled);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "server = 12").unwrap();
        assert!(matches!(
            ClientConfig::from_file(file.path()),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let vars = env_with(&[
            ("TURBACZ_URL", "http://10.0.0.5:8000"),
            ("TURBACZ_CHANNEL", "blinds"),
            ("TURBACZ_COOKIE_FILE", "/tmp/cookies.txt"),
            ("TURBACZ_RECONNECT_CEILING_MS", "10000"),
            ("TURBACZ_ROLLBACK_ON_SEND_FAILURE", "yes"),
        ]);

        temp_env::with_vars(vars, || {
            let config = ClientConfig::from_env().unwrap();
            assert_eq!(config.server.as_str(), "http://10.0.0.5:8000/");
            assert_eq!(config.channel, Channel::Blinds);
            assert!(matches!(config.token, TokenConfig::CookieFile { .. }));
            assert_eq!(config.reconnect.ceiling, Duration::from_secs(10));
            assert_eq!(config.commands.send_failure, SendFailurePolicy::Rollback);
        });
    }

    #[test]
    #[serial]
    fn test_from_env_requires_url() {
        temp_env::with_vars(env_with(&[]), || {
            assert!(ClientConfig::from_env().is_err());
        });
    }

    #[test]
    #[serial]
    fn test_invalid_env_values() {
        let vars = env_with(&[
            ("TURBACZ_URL", "https://home.example.com"),
            ("TURBACZ_PENDING_TIMEOUT_MS", "soon"),
        ]);
        temp_env::with_vars(vars, || {
            let err = ClientConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("TURBACZ_PENDING_TIMEOUT_MS"));
        });
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ClientConfig::new(
            "https://home.example.com".parse().unwrap(),
            Channel::Lights,
        );
        config.reconnect.ceiling = Duration::from_millis(10);
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new("ftp://files.local".parse().unwrap(), Channel::Lights);
        assert!(config.validate().is_err());
        config.server = "wss://home.example.com".parse().unwrap();
        assert!(config.validate().is_ok());
        config.commands.pending_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
