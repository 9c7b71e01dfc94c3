//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to an EV3 brick
#[derive(Error, Debug)]
pub enum Ev3Error {
    /// A caller-supplied value is outside its documented bounds.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Malformed or semantically invalid wire data.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The brick answered with the error status.
    #[error("Protocol error: device reported error for counter {counter}")]
    DeviceError {
        /// Counter of the failed request
        counter: u16,
    },

    /// Pending-request bookkeeping went wrong (duplicate or unknown id).
    #[error("Correlation error: {0}")]
    Correlation(String),

    /// No reply arrived before the request's deadline.
    #[error("No response for request {id} within {timeout_ms}ms")]
    Timeout {
        /// Counter of the request
        id: u16,
        /// The timeout that elapsed
        timeout_ms: u64,
    },

    /// The brick did not answer the firmware query on connect.
    #[error("No answer from brick within {0}ms; check the connection")]
    ConnectTimeout(u64),

    /// I/O failure of the underlying stream.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The serial port could not be opened or configured.
    #[error("Serial port error: {0}")]
    Serial(String),

    /// No port matches the requested brick.
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// The brick was disconnected.
    #[error("Not connected to brick")]
    NotConnected,

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Ev3Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Ev3Error::Validation(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Ev3Error::Protocol(msg.into())
    }

    pub(crate) fn correlation(msg: impl Into<String>) -> Self {
        Ev3Error::Correlation(msg.into())
    }

    /// True for every error raised because the wire data was bad, including
    /// an error status reported by the brick itself.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Ev3Error::Protocol(_) | Ev3Error::DeviceError { .. })
    }
}

impl From<serialport::Error> for Ev3Error {
    fn from(e: serialport::Error) -> Self {
        Ev3Error::Serial(e.to_string())
    }
}

impl From<serde_json::Error> for Ev3Error {
    fn from(e: serde_json::Error) -> Self {
        Ev3Error::Config(e.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Ev3Error>;
