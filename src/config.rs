//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SMSGWD_DEVICE`, `SMSGWD_USERS`,
//!    `SMSGWD_COMMANDS`
//! 2. **Config file** — path via `--config <path>`, or `smsgwd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [serial]
//! device = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [paths]
//! fifo = "/run/smsgwd.fifo"
//! socket = "/run/smsgwd.sock"     # omit to disable the socket endpoint
//! users_file = "/etc/smsgwd/users"
//! commands_file = "/etc/smsgwd/commands"
//!
//! [session]
//! autologout = "10m"              # omit or "0" to disable
//!
//! [modem]
//! pin = "1234"                    # omit when the SIM has no PIN
//! charset = "HEX"
//! prompt_timeout_ms = 2000
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial line settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Modem device path (default `/dev/ttyUSB0`). Override with
    /// `SMSGWD_DEVICE`.
    #[serde(default = "default_device")]
    pub device: String,
    /// Line speed in baud (default 115200).
    #[serde(default = "default_baud")]
    pub baud: u32,
}

/// Filesystem endpoints and table locations.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Named pipe for local send requests (default `/run/smsgwd.fifo`).
    #[serde(default = "default_fifo")]
    pub fifo: Option<String>,
    /// Unix socket for fixed-record send requests. Disabled when omitted.
    #[serde(default)]
    pub socket: Option<String>,
    /// Auth file (`name home_phone password [acl]`). No users when omitted.
    #[serde(default)]
    pub users_file: Option<String>,
    /// External command table. No external commands when omitted.
    #[serde(default)]
    pub commands_file: Option<String>,
}

/// Session expiry settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    /// Idle time before a login is ended, e.g. `"90"` (seconds), `"10m"`,
    /// `"1h"`. Omitted or zero disables autologout.
    #[serde(default)]
    pub autologout: Option<String>,
}

/// Modem protocol settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ModemConfig {
    /// SIM PIN, submitted with `AT+CPIN` at startup when present.
    #[serde(default)]
    pub pin: Option<String>,
    /// Character set selected with `AT+CSCS` (default `HEX`; the receive
    /// path assumes hex-encoded payloads).
    #[serde(default = "default_charset")]
    pub charset: String,
    /// How long to wait for the `>` payload prompt before sending anyway
    /// (default 2000 ms).
    #[serde(default = "default_prompt_timeout_ms")]
    pub prompt_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_device() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud() -> u32 {
    115_200
}
fn default_fifo() -> Option<String> {
    Some("/run/smsgwd.fifo".to_string())
}
fn default_charset() -> String {
    "HEX".to_string()
}
fn default_prompt_timeout_ms() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud: default_baud(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            fifo: default_fifo(),
            socket: None,
            users_file: None,
            commands_file: None,
        }
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            pin: None,
            charset: default_charset(),
            prompt_timeout_ms: default_prompt_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `smsgwd.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("smsgwd.toml").exists() {
            let content =
                std::fs::read_to_string("smsgwd.toml").expect("Failed to read smsgwd.toml");
            toml::from_str(&content).expect("Failed to parse smsgwd.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(device) = std::env::var("SMSGWD_DEVICE") {
            config.serial.device = device;
        }
        if let Ok(users) = std::env::var("SMSGWD_USERS") {
            config.paths.users_file = Some(users);
        }
        if let Ok(commands) = std::env::var("SMSGWD_COMMANDS") {
            config.paths.commands_file = Some(commands);
        }

        config
    }

    /// Validate settings that can only fail at runtime. Returns one message
    /// per problem; empty means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.serial.device.is_empty() {
            errors.push("serial.device must not be empty".to_string());
        }
        if crate::serial::baud_rate(self.serial.baud).is_none() {
            errors.push(format!("serial.baud {} is not supported", self.serial.baud));
        }
        if let Err(e) = self.autologout_interval() {
            errors.push(format!("session.autologout: {e}"));
        }
        errors
    }

    /// The parsed autologout interval; `None` when disabled.
    pub fn autologout_interval(&self) -> Result<Option<Duration>, ConfigError> {
        match self.session.autologout.as_deref() {
            None => Ok(None),
            Some(s) => Ok(parse_duration(s)?.filter(|d| !d.is_zero())),
        }
    }
}

/// Errors from loading runtime tables (users, commands) or parsing
/// config values.
#[derive(Debug)]
pub enum ConfigError {
    /// File could not be read.
    Read(String, std::io::Error),
    /// A value did not parse.
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(path, e) => write!(f, "{path}: {e}"),
            ConfigError::Parse(msg) => write!(f, "{msg}"),
        }
    }
}

/// Parse a duration like `"90"`, `"10m"`, `"1.5h"`, `"500ms"`.
///
/// A bare number is seconds. Recognized suffixes: `h`, `m`, `s`, `ms`.
/// Returns `Ok(None)` for a zero value.
pub fn parse_duration(input: &str) -> Result<Option<Duration>, ConfigError> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| ConfigError::Parse(format!("invalid duration {input:?}")))?;

    let seconds = match unit {
        "" | "s" => value,
        "h" => value * 3600.0,
        "m" => value * 60.0,
        "ms" => value / 1000.0,
        _ => return Err(ConfigError::Parse(format!("invalid duration unit {unit:?}"))),
    };

    if seconds == 0.0 {
        return Ok(None);
    }
    Ok(Some(Duration::from_secs_f64(seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.serial.device, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud, 115_200);
        assert_eq!(config.paths.fifo.as_deref(), Some("/run/smsgwd.fifo"));
        assert!(config.paths.socket.is_none());
        assert_eq!(config.modem.charset, "HEX");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            [serial]
            device = "/dev/ttyS2"
            baud = 9600

            [paths]
            users_file = "/etc/smsgwd/users"

            [session]
            autologout = "10m"

            [modem]
            pin = "0000"
            "#,
        )
        .unwrap();
        assert_eq!(config.serial.device, "/dev/ttyS2");
        assert_eq!(config.serial.baud, 9600);
        assert_eq!(config.paths.users_file.as_deref(), Some("/etc/smsgwd/users"));
        assert_eq!(config.modem.pin.as_deref(), Some("0000"));
        assert_eq!(
            config.autologout_interval().unwrap(),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn test_validate_catches_bad_baud() {
        let mut config = Config::default();
        config.serial.baud = 12345;
        assert_eq!(config.validate().len(), 1);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("90").unwrap(), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("10m").unwrap(), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("1h").unwrap(), Some(Duration::from_secs(3600)));
        assert_eq!(
            parse_duration("500ms").unwrap(),
            Some(Duration::from_millis(500))
        );
        assert_eq!(parse_duration("0").unwrap(), None);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("").is_err());
    }
}
