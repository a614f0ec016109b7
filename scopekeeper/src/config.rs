//! Proxy configuration.
//!
//! Values come from three layers, later ones winning: built-in defaults, a TOML file, and
//! command-line overrides.

use scopekeeper_internal::message::Format;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Read from the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "scopekeeper.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address both listeners bind to.
    pub host: String,
    /// Port of the HTTP interface.
    pub server_port: u16,
    /// Port the debuggee host connects to.
    pub proxy_port: u16,
    /// Log every message passing through the proxy.
    pub debug: bool,
    /// Never upgrade the host connection to STP/1.
    pub force_stp_0: bool,
    /// Payload format of client commands and of STP/1 response bodies.
    pub format: Format,
    /// How long a long-poll is held open before `<timeout/>`.
    pub poll_timeout_secs: u64,
    /// Idle sleep of the reactor loop.
    pub tick_interval_ms: u64,
    /// Bound of the pending-message queue.
    pub max_pending_messages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            server_port: 8002,
            proxy_port: 7001,
            debug: false,
            force_stp_0: false,
            format: Format::Json,
            poll_timeout_secs: 30,
            tick_interval_ms: 10,
            max_pending_messages: 10_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("cannot render configuration: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Values given on the command line.  `None` leaves the file/default value alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub server_port: Option<u16>,
    pub proxy_port: Option<u16>,
    pub debug: bool,
    pub force_stp_0: bool,
    pub format: Option<Format>,
    pub poll_timeout_secs: Option<u64>,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Loads `path`, or [`DEFAULT_CONFIG_FILE`] if it exists, or the defaults.
    ///
    /// An explicit path that cannot be read is an error; a missing default file is not.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Config::default());
                }
                default
            }
        };
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Config::from_toml(&text).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Applies command-line values on top of this configuration.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(host) = overrides.host {
            self.host = host;
        }
        if let Some(port) = overrides.server_port {
            self.server_port = port;
        }
        if let Some(port) = overrides.proxy_port {
            self.proxy_port = port;
        }
        if let Some(format) = overrides.format {
            self.format = format;
        }
        if let Some(secs) = overrides.poll_timeout_secs {
            self.poll_timeout_secs = secs;
        }
        self.debug |= overrides.debug;
        self.force_stp_0 |= overrides.force_stp_0;
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.poll_timeout_secs == 0 {
            return Err(ConfigError::Invalid("poll_timeout_secs must be positive".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be positive".into()));
        }
        if self.max_pending_messages == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_messages must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// `host:server_port`
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.server_port)
    }

    /// `host:proxy_port`
    pub fn host_addr(&self) -> String {
        format!("{}:{}", self.host, self.proxy_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let text = Config::default().to_toml().unwrap();
        assert!(text.contains("server_port = 8002"));
        assert!(text.contains("format = \"json\""));
        assert_eq!(Config::from_toml(&text).unwrap(), Config::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_toml("proxy_port = 9000\nformat = \"xml\"\n").unwrap();
        assert_eq!(config.proxy_port, 9000);
        assert_eq!(config.format, Format::Xml);
        assert_eq!(config.server_port, 8002);
        assert_eq!(config.poll_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_toml("prot = 1\n").is_err());
    }

    #[test]
    fn overrides_win() {
        let mut config = Config::from_toml("host = \"0.0.0.0\"\ndebug = true\n").unwrap();
        config.apply(Overrides {
            server_port: Some(8080),
            force_stp_0: true,
            ..Overrides::default()
        });
        assert_eq!(config.http_addr(), "0.0.0.0:8080");
        assert_eq!(config.host_addr(), "0.0.0.0:7001");
        assert!(config.debug);
        assert!(config.force_stp_0);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/scopekeeper.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn validation() {
        assert!(Config::default().validate().is_ok());
        let config = Config {
            poll_timeout_secs: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
