//! Modbus protocol building blocks for the gateway
//!
//! - [`frame`]: Modbus-TCP (MBAP) and Modbus-RTU framing, CRC-16
//! - [`function`]: typed requests and responses for the supported function codes
//! - [`connection`]: TCP and serial backend transports

pub mod connection;
pub mod constants;
pub mod error;
pub mod frame;
pub mod function;
pub mod pdu;

pub use connection::{ConnType, ModbusConnection, Parity, SerialSettings, TransportConfig};
pub use error::{ModbusError, Result};
pub use frame::{MbapCodec, MbapHeader, TcpAdu};
pub use function::{ExceptionCode, FunctionCode, Request, Response};
pub use pdu::{ModbusPdu, PduBuilder};
