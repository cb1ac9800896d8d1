//! Per-request errors and their Modbus exception codes

use modbus_core::{ExceptionCode, ModbusError};
use thiserror::Error;

/// Failure of a single forwarded request; answered on the wire, never fatal
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("slave {0} is not configured")]
    UnknownSlave(u8),

    #[error(transparent)]
    Modbus(#[from] ModbusError),
}

impl RequestError {
    /// Exception code returned to the client
    pub fn exception_code(&self) -> ExceptionCode {
        match self {
            Self::UnknownSlave(_) => ExceptionCode::IllegalDataAddress,
            Self::Modbus(err) => match err {
                ModbusError::UnsupportedFunction(_) => ExceptionCode::IllegalFunction,
                ModbusError::MalformedRequest(_) => ExceptionCode::IllegalDataAddress,
                ModbusError::IllegalValue(_) => ExceptionCode::IllegalDataValue,
                ModbusError::FrameTooShort { .. }
                | ModbusError::CrcMismatch { .. }
                | ModbusError::InvalidProtocolId(_)
                | ModbusError::InvalidLength(_)
                | ModbusError::PduTooLarge { .. }
                | ModbusError::UnexpectedResponse(_)
                | ModbusError::Exception { .. }
                | ModbusError::Io(_)
                | ModbusError::Connection(_)
                | ModbusError::Timeout(_)
                | ModbusError::Closed
                | ModbusError::Config(_) => ExceptionCode::SlaveDeviceFailure,
            },
        }
    }
}
