//! Error types for the Modbus station.
//!
//! Protocol-level validation failures (bad quantity, bad coil value, unknown
//! function code) never surface here: those are answered on the wire as
//! exception PDUs and the handler returns normally. `ModbusError` covers the
//! engine itself, transport setup and teardown, frame reassembly, and
//! configuration loading.
//!
//! All variants carry enough context to be logged as-is, and the usual
//! conversions from `std::io::Error`, `serde_json::Error` and
//! `tokio_serial::Error` are provided so `?` works at the I/O seams.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors produced by the station engine.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// Low-level I/O failure (socket read/write, port access).
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or listener setup failure.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Serial port failure (open, configuration, read/write).
    #[error("Serial error: {message}")]
    Serial { message: String },

    /// Malformed or incomplete frame.
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// RTU CRC validation failure.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Modbus protocol violation outside the per-request exception path.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Function code the station does not implement.
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Address/quantity combination rejected by a store.
    #[error("Invalid address range: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Value that does not conform to its expected format.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Seed-configuration parsing or application failure.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal invariant violation. Should not occur in normal operation.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    pub fn serial<S: Into<String>>(message: S) -> Self {
        Self::Serial { message: message.into() }
    }

    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// True for errors originating in the transport layer rather than the
    /// protocol engine.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Serial { .. }
        )
    }

    /// True for errors caused by malformed or invalid protocol traffic.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
                | Self::InvalidFunction { .. }
                | Self::InvalidAddress { .. }
                | Self::InvalidData { .. }
        )
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::serial(err.to_string())
    }
}
