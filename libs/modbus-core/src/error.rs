//! Modbus error types

use thiserror::Error;

/// Errors raised while framing, decoding or exchanging Modbus messages
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModbusError {
    // ======================================
    // Framing
    // ======================================
    #[error("Frame too short: need {needed} bytes, got {actual}")]
    FrameTooShort { needed: usize, actual: usize },

    #[error("CRC mismatch: expected {expected:04X}, got {actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("Invalid protocol ID: expected 0, got {0}")]
    InvalidProtocolId(u16),

    #[error("Invalid MBAP length: {0}")]
    InvalidLength(u16),

    #[error("PDU too large: {size} bytes (max {max})")]
    PduTooLarge { size: usize, max: usize },

    // ======================================
    // Request / response content
    // ======================================
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Illegal data value: {0}")]
    IllegalValue(String),

    #[error("Unsupported function code: {0:#04X}")]
    UnsupportedFunction(u8),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Slave exception: function {function:#04X}, code {code:#04X}")]
    Exception { function: u8, code: u8 },

    // ======================================
    // Transport
    // ======================================
    #[error("IO error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout after {0} ms")]
    Timeout(u64),

    #[error("Connection closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using ModbusError
pub type Result<T> = std::result::Result<T, ModbusError>;

impl ModbusError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRequest(msg.into())
    }

    pub fn illegal_value(msg: impl Into<String>) -> Self {
        Self::IllegalValue(msg.into())
    }

    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::UnexpectedResponse(msg.into())
    }

    /// The underlying stream is no longer usable and must be reopened
    pub fn is_transport_loss(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Connection(_))
    }

    /// The byte stream no longer lines up with frame boundaries
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::FrameTooShort { .. }
                | Self::InvalidProtocolId(_)
                | Self::InvalidLength(_)
                | Self::PduTooLarge { .. }
        )
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::Connection(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}
