//! Environment-driven configuration.
//!
//! Every knob lives under the `TASBRIDGE_HOMEKIT_` prefix and has a default;
//! validation happens once at startup and any failure is fatal (exit 1).
//! Listener addresses resolve either from a full `*_ADDR` or from the
//! `*_BIND_ADDRESS` + `*_PORT` pair.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

pub const ENV_PREFIX: &str = "TASBRIDGE_HOMEKIT_";

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
const DEFAULT_HAP_PORT: u16 = 8080;
const DEFAULT_WEB_PORT: u16 = 8081;
const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("HAP PIN must be exactly 8 digits")]
    InvalidPin,
    #[error("{name} port must be between 1 and 65535, got {value}")]
    InvalidPort { name: String, value: String },
    #[error("invalid {name} addr {value:?}")]
    InvalidAddr { name: String, value: String },
    #[error("invalid log level {0:?}, must be one of: debug, info, warn, error")]
    InvalidLogLevel(String),
    #[error("invalid log format {0:?}, must be 'json' or 'console'")]
    InvalidLogFormat(String),
    #[error("{0} cannot be empty")]
    EmptyValue(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Console,
}

impl LogFormat {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "json" => Ok(LogFormat::Json),
            "console" => Ok(LogFormat::Console),
            other => Err(ConfigError::InvalidLogFormat(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Console => "console",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub hap_pin: String,
    pub hap_storage_path: PathBuf,
    pub hap_addr: SocketAddr,
    pub web_addr: SocketAddr,
    pub mqtt_addr: SocketAddr,
    pub tailscale_hostname: String,
    pub tailscale_auth_key: String,
    pub tailscale_state_dir: PathBuf,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    pub plugs_config_path: PathBuf,
}

/// Reads configuration from the process environment.
pub fn load() -> Result<Config, ConfigError> {
    from_lookup(|key| std::env::var(key).ok())
}

/// Reads configuration through an arbitrary lookup, for tests.
pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
    let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    let hap_pin = get("HAP_PIN").unwrap_or_else(|| "00102003".to_string());
    if hap_pin.len() != 8 || !hap_pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ConfigError::InvalidPin);
    }

    let hap_addr = listener_addr(&get, "HAP", DEFAULT_HAP_PORT)?;
    let web_addr = listener_addr(&get, "WEB", DEFAULT_WEB_PORT)?;
    let mqtt_addr = listener_addr(&get, "MQTT", DEFAULT_MQTT_PORT)?;

    let log_level = LogLevel::parse(&get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()))?;
    let log_format = LogFormat::parse(&get("LOG_FORMAT").unwrap_or_else(|| "json".to_string()))?;

    let plugs_config_path = get("PLUGS_CONFIG").unwrap_or_else(|| "./plugs.hujson".to_string());
    if plugs_config_path.is_empty() {
        return Err(ConfigError::EmptyValue("plugs config path"));
    }

    let hap_storage_path = get("HAP_STORAGE_PATH").unwrap_or_else(|| "./data/hap".to_string());
    if hap_storage_path.is_empty() {
        return Err(ConfigError::EmptyValue("HAP storage path"));
    }

    let tailscale_state_dir =
        get("TS_STATE_DIR").unwrap_or_else(|| "./data/tailscale".to_string());
    if tailscale_state_dir.is_empty() {
        return Err(ConfigError::EmptyValue("Tailscale state dir"));
    }

    Ok(Config {
        hap_pin,
        hap_storage_path: PathBuf::from(hap_storage_path),
        hap_addr,
        web_addr,
        mqtt_addr,
        tailscale_hostname: get("TS_HOSTNAME").unwrap_or_else(|| "tasbridge".to_string()),
        tailscale_auth_key: get("TS_AUTHKEY").unwrap_or_default(),
        tailscale_state_dir: PathBuf::from(tailscale_state_dir),
        log_level,
        log_format,
        plugs_config_path: PathBuf::from(plugs_config_path),
    })
}

fn listener_addr(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
    default_port: u16,
) -> Result<SocketAddr, ConfigError> {
    let port = match get(&format!("{name}_PORT")) {
        Some(raw) => {
            let parsed: i64 = raw.trim().parse().map_err(|_| ConfigError::InvalidPort {
                name: name.to_string(),
                value: raw.clone(),
            })?;
            if !(1..=65535).contains(&parsed) {
                return Err(ConfigError::InvalidPort {
                    name: name.to_string(),
                    value: raw,
                });
            }
            parsed as u16
        }
        None => default_port,
    };

    let bind = get(&format!("{name}_BIND_ADDRESS"))
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

    let addr = get(&format!("{name}_ADDR")).unwrap_or_else(|| format!("{bind}:{port}"));
    let parsed: SocketAddr = addr.parse().map_err(|_| ConfigError::InvalidAddr {
        name: name.to_string(),
        value: addr.clone(),
    })?;
    if parsed.port() == 0 {
        return Err(ConfigError::InvalidPort {
            name: name.to_string(),
            value: parsed.port().to_string(),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load_with(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let cfg = load_with(&[]).unwrap();
        assert_eq!(cfg.hap_pin, "00102003");
        assert_eq!(cfg.hap_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.web_addr, "0.0.0.0:8081".parse().unwrap());
        assert_eq!(cfg.mqtt_addr, "0.0.0.0:1883".parse().unwrap());
        assert_eq!(cfg.log_level, LogLevel::Info);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.plugs_config_path, PathBuf::from("./plugs.hujson"));
        assert_eq!(cfg.tailscale_hostname, "tasbridge");
    }

    #[test]
    fn pin_must_be_eight_digits() {
        assert!(matches!(
            load_with(&[("HAP_PIN", "1234567")]),
            Err(ConfigError::InvalidPin)
        ));
        assert!(matches!(
            load_with(&[("HAP_PIN", "123456789")]),
            Err(ConfigError::InvalidPin)
        ));
        assert!(matches!(
            load_with(&[("HAP_PIN", "1234abcd")]),
            Err(ConfigError::InvalidPin)
        ));
        assert!(load_with(&[("HAP_PIN", "87654321")]).is_ok());
    }

    #[test]
    fn port_bounds_are_enforced() {
        assert!(matches!(
            load_with(&[("WEB_PORT", "0")]),
            Err(ConfigError::InvalidPort { .. })
        ));
        assert!(matches!(
            load_with(&[("MQTT_PORT", "65536")]),
            Err(ConfigError::InvalidPort { .. })
        ));
        assert!(matches!(
            load_with(&[("HAP_PORT", "not-a-port")]),
            Err(ConfigError::InvalidPort { .. })
        ));
        let cfg = load_with(&[("WEB_PORT", "65535")]).unwrap();
        assert_eq!(cfg.web_addr.port(), 65535);
    }

    #[test]
    fn addr_overrides_bind_and_port() {
        let cfg = load_with(&[
            ("WEB_ADDR", "127.0.0.1:9000"),
            ("WEB_BIND_ADDRESS", "0.0.0.0"),
            ("WEB_PORT", "8081"),
        ])
        .unwrap();
        assert_eq!(cfg.web_addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn bind_address_and_port_compose() {
        let cfg = load_with(&[("MQTT_BIND_ADDRESS", "127.0.0.1"), ("MQTT_PORT", "2883")]).unwrap();
        assert_eq!(cfg.mqtt_addr, "127.0.0.1:2883".parse().unwrap());
    }

    #[test]
    fn invalid_addr_is_rejected() {
        assert!(matches!(
            load_with(&[("HAP_ADDR", "not an addr")]),
            Err(ConfigError::InvalidAddr { .. })
        ));
    }

    #[test]
    fn addr_with_port_zero_is_rejected() {
        assert!(matches!(
            load_with(&[("WEB_ADDR", "0.0.0.0:0")]),
            Err(ConfigError::InvalidPort { .. })
        ));
    }

    #[test]
    fn log_settings_are_validated() {
        assert!(matches!(
            load_with(&[("LOG_LEVEL", "verbose")]),
            Err(ConfigError::InvalidLogLevel(_))
        ));
        assert!(matches!(
            load_with(&[("LOG_FORMAT", "xml")]),
            Err(ConfigError::InvalidLogFormat(_))
        ));
        let cfg = load_with(&[("LOG_LEVEL", "debug"), ("LOG_FORMAT", "console")]).unwrap();
        assert_eq!(cfg.log_level, LogLevel::Debug);
        assert_eq!(cfg.log_format, LogFormat::Console);
    }

    #[test]
    fn empty_paths_are_rejected() {
        assert!(matches!(
            load_with(&[("PLUGS_CONFIG", "")]),
            Err(ConfigError::EmptyValue(_))
        ));
        assert!(matches!(
            load_with(&[("TS_STATE_DIR", "")]),
            Err(ConfigError::EmptyValue(_))
        ));
    }
}
