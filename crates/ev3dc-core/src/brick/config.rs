//! Connection configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{Ev3Error, Result, SessionConfig, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Firmware the command catalog has been verified against
pub const SUPPORTED_FIRMWARE: &str = "V1.09H";

/// How to reach a brick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port name; takes precedence over `brick_id`
    pub port_name: Option<String>,
    /// Brick ID used to look the port up
    pub brick_id: Option<String>,
    /// Serial speed; ignored by Bluetooth rfcomm ports
    pub baud_rate: u32,
    /// Reply timeout in milliseconds, 0 to wait forever
    pub timeout_ms: u64,
    /// How long the firmware query on connect may take
    pub connect_timeout_ms: u64,
    /// Firmware version expected on connect; a mismatch only warns
    pub expected_firmware: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            brick_id: None,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            connect_timeout_ms: 5000,
            expected_firmware: SUPPORTED_FIRMWARE.to_string(),
        }
    }
}

impl ConnectionConfig {
    /// Configuration for a known port
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: Some(port_name.into()),
            ..Self::default()
        }
    }

    /// Configuration locating the port by brick ID
    pub fn for_brick_id(brick_id: impl Into<String>) -> Self {
        Self {
            brick_id: Some(brick_id.into()),
            ..Self::default()
        }
    }

    /// Load a JSON configuration file; missing fields take their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Ev3Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| {
            Ev3Error::Config(format!("cannot write {}: {}", path.display(), e))
        })
    }

    /// Session settings derived from this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    /// Time allowed for the firmware query on connect
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
