//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags** — `-p`, `-d`, `-x`, `-i`, `-z`, `--config`
//! 2. **Environment variables** — `RILD_PORT`, `RILD_DEVICE`,
//!    `RILD_IFACE`, `RILD_LOG`
//! 3. **Config file** — path via `--config <path>`, or `rild.toml` in CWD
//! 4. **Compiled defaults** — see each field below
//!
//! The TOML file mirrors the struct fields:
//!
//! ```toml
//! device = "/dev/ttyACM1"
//! prio_device = "/dev/ttyACM2"
//! iface = "usb0"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! At least one of `port`/`device` must be configured; the modem has to
//! be reachable somewhere.

use serde::Deserialize;
use std::path::Path;

/// Transport endpoint for one AT channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    Tty { device: String },
    Tcp { host: Option<String>, port: u16 },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP port of a modem exposed over the network (testing setups).
    pub port: Option<u16>,
    /// Host for the TCP transport; loopback when unset.
    pub loophost: Option<String>,
    /// Primary TTY device path.
    pub device: Option<String>,
    /// Separate TTY for the priority channel, when the modem exposes one.
    pub prio_device: Option<String>,
    /// Network interface carrying the data call.
    #[serde(default = "default_iface")]
    pub iface: String,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_iface() -> String {
    "usb0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            loophost: None,
            device: None,
            prio_device: None,
            iface: default_iface(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment. CLI flags are merged
    /// on top by the caller.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("rild.toml").exists() {
            let content = std::fs::read_to_string("rild.toml").expect("Failed to read rild.toml");
            toml::from_str(&content).expect("Failed to parse rild.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(port) = std::env::var("RILD_PORT") {
            config.port = port.parse().ok();
        }
        if let Ok(device) = std::env::var("RILD_DEVICE") {
            config.device = Some(device);
        }
        if let Ok(iface) = std::env::var("RILD_IFACE") {
            config.iface = iface;
        }
        if let Ok(level) = std::env::var("RILD_LOG") {
            config.logging.level = level;
        }

        config
    }

    /// Configuration problems worth refusing to start over.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.port.is_none() && self.device.is_none() {
            errors.push("neither a TCP port (-p) nor a TTY device (-d) is configured".to_string());
        }
        if self.port == Some(0) {
            errors.push("TCP port must be non-zero".to_string());
        }
        if self.iface.is_empty() {
            errors.push("network interface name is empty".to_string());
        }
        errors
    }

    /// Transport for the normal channel. TTY wins when both are given,
    /// matching the expectation that a TCP port is a bench setup.
    pub fn primary_transport(&self) -> Result<TransportSpec, String> {
        if let Some(device) = &self.device {
            return Ok(TransportSpec::Tty {
                device: device.clone(),
            });
        }
        if let Some(port) = self.port {
            return Ok(TransportSpec::Tcp {
                host: self.loophost.clone(),
                port,
            });
        }
        Err("no transport configured".to_string())
    }

    /// Transport for the priority channel, when one is configured.
    pub fn priority_transport(&self) -> Option<TransportSpec> {
        self.prio_device.as_ref().map(|device| TransportSpec::Tty {
            device: device.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.iface, "usb0");
        assert_eq!(config.logging.level, "info");
        assert!(config.port.is_none());
    }

    #[test]
    fn test_validate_requires_a_transport() {
        let config = Config::default();
        assert_eq!(config.validate().len(), 1);

        let config = Config {
            device: Some("/dev/ttyACM1".into()),
            ..Config::default()
        };
        assert!(config.validate().is_empty());

        let config = Config {
            port: Some(5000),
            ..Config::default()
        };
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let config = Config {
            port: Some(0),
            ..Config::default()
        };
        assert!(!config.validate().is_empty());
    }

    #[test]
    fn test_tty_wins_over_tcp() {
        let config = Config {
            device: Some("/dev/ttyACM1".into()),
            port: Some(5000),
            ..Config::default()
        };
        assert_eq!(
            config.primary_transport().unwrap(),
            TransportSpec::Tty {
                device: "/dev/ttyACM1".into()
            }
        );
    }

    #[test]
    fn test_tcp_transport_with_host() {
        let config = Config {
            port: Some(5000),
            loophost: Some("192.168.0.10".into()),
            ..Config::default()
        };
        assert_eq!(
            config.primary_transport().unwrap(),
            TransportSpec::Tcp {
                host: Some("192.168.0.10".into()),
                port: 5000
            }
        );
    }

    #[test]
    fn test_toml_parse() {
        let config: Config = toml::from_str(
            r#"
            device = "/dev/ttyACM1"
            prio_device = "/dev/ttyACM2"
            iface = "wwan0"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.device.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(
            config.priority_transport(),
            Some(TransportSpec::Tty {
                device: "/dev/ttyACM2".into()
            })
        );
        assert_eq!(config.iface, "wwan0");
        assert_eq!(config.logging.level, "debug");
    }
}
