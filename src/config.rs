//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::protocol::Protocol;
use crate::radio::RadioOptions;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub radio: RadioConfig,

    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Radio protocol configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RadioConfig {
    /// Protocol tried first (and fallen back to) during detection
    #[serde(default = "default_preferred")]
    pub preferred: Protocol,

    /// Run the auto-detection trial loop at startup
    #[serde(default = "default_auto_detect")]
    pub auto_detect: bool,

    /// Channels carried by a PPM train (1-8)
    #[serde(default = "default_ppm_channels")]
    pub ppm_channels: usize,

    /// Independent PWM input pins (1-4)
    #[serde(default = "default_pwm_channels")]
    pub pwm_channels: usize,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Receiver UART device; baud and framing come from the selected
    /// protocol's descriptor
    #[serde(default = "default_serial_port")]
    pub port: String,
}

/// Channel monitor output configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_log_interval_ms")]
    pub log_interval_ms: u64,
}

// Default value functions
fn default_preferred() -> Protocol {
    Protocol::Crsf
}
fn default_auto_detect() -> bool {
    true
}
fn default_ppm_channels() -> usize {
    8
}
fn default_pwm_channels() -> usize {
    4
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_log_interval_ms() -> u64 {
    500
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            preferred: default_preferred(),
            auto_detect: default_auto_detect(),
            ppm_channels: default_ppm_channels(),
            pwm_channels: default_pwm_channels(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_interval_ms: default_log_interval_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            radio: RadioConfig::default(),
            serial: SerialConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Pulse-protocol channel counts for the dispatcher
    pub fn radio_options(&self) -> RadioOptions {
        RadioOptions {
            ppm_channels: self.radio.ppm_channels,
            pwm_channels: self.radio.pwm_channels,
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.serial.port.is_empty() {
            return Err(crate::error::RcLinkError::Config(toml::de::Error::custom(
                "serial port cannot be empty",
            )));
        }

        if !(1..=8).contains(&self.radio.ppm_channels) {
            return Err(crate::error::RcLinkError::Config(toml::de::Error::custom(
                "ppm_channels must be between 1 and 8",
            )));
        }

        if !(1..=4).contains(&self.radio.pwm_channels) {
            return Err(crate::error::RcLinkError::Config(toml::de::Error::custom(
                "pwm_channels must be between 1 and 4",
            )));
        }

        if self.monitor.log_interval_ms == 0 || self.monitor.log_interval_ms > 60000 {
            return Err(crate::error::RcLinkError::Config(toml::de::Error::custom(
                "log_interval_ms must be between 1 and 60000",
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.radio.preferred, Protocol::Crsf);
        assert!(config.radio.auto_detect);
        assert_eq!(config.radio.ppm_channels, 8);
        assert_eq!(config.radio.pwm_channels, 4);
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.monitor.log_interval_ms, 500);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.radio.preferred, Protocol::Crsf);
        assert_eq!(config.radio.pwm_channels, 4);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[radio]\npreferred = \"sbus\"\nppm_channels = 6\n\n[serial]\nport = \"/dev/ttyACM0\""
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.radio.preferred, Protocol::Sbus);
        assert_eq!(config.radio.ppm_channels, 6);
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        // Unset sections keep their defaults
        assert_eq!(config.monitor.log_interval_ms, 500);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = Config::load("/nonexistent/rc-link.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_channel_counts_rejected() {
        let result: Config = toml::from_str("[radio]\npwm_channels = 9").unwrap();
        assert!(result.validate().is_err());

        let result: Config = toml::from_str("[radio]\nppm_channels = 0").unwrap();
        assert!(result.validate().is_err());
    }

    #[test]
    fn test_empty_port_rejected() {
        let config: Config = toml::from_str("[serial]\nport = \"\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_radio_options_mapping() {
        let config: Config =
            toml::from_str("[radio]\nppm_channels = 6\npwm_channels = 2").unwrap();
        let options = config.radio_options();
        assert_eq!(options.ppm_channels, 6);
        assert_eq!(options.pwm_channels, 2);
    }
}
