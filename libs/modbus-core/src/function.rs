//! Function codes, typed requests and responses
//!
//! A [`Request`] is decoded from an inbound PDU and re-encoded for the backend.
//! A [`Response`] is decoded from the backend's PDU, checked against the
//! request it answers, and encoded for the client.

use std::fmt;

use tracing::trace;

use crate::constants::{
    COIL_OFF, COIL_ON, EXCEPTION_FLAG, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, Result};
use crate::pdu::{ModbusPdu, PduBuilder};

/// The eight supported Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub const ALL: [FunctionCode; 8] = [
        Self::ReadCoils,
        Self::ReadDiscreteInputs,
        Self::ReadHoldingRegisters,
        Self::ReadInputRegisters,
        Self::WriteSingleCoil,
        Self::WriteSingleRegister,
        Self::WriteMultipleCoils,
        Self::WriteMultipleRegisters,
    ];

    pub fn from_u8(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|fc| *fc as u8 == code)
    }

    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ReadCoils => "Read Coils",
            Self::ReadDiscreteInputs => "Read Discrete Inputs",
            Self::ReadHoldingRegisters => "Read Holding Registers",
            Self::ReadInputRegisters => "Read Input Registers",
            Self::WriteSingleCoil => "Write Single Coil",
            Self::WriteSingleRegister => "Write Single Register",
            Self::WriteMultipleCoils => "Write Multiple Coils",
            Self::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }

    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::WriteSingleCoil
                | Self::WriteSingleRegister
                | Self::WriteMultipleCoils
                | Self::WriteMultipleRegisters
        )
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = ModbusError;

    fn try_from(code: u8) -> Result<Self> {
        Self::from_u8(code).ok_or(ModbusError::UnsupportedFunction(code))
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FC{:02X}", self.code())
    }
}

/// Exception codes the gateway emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
}

impl ExceptionCode {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal Function",
            Self::IllegalDataAddress => "Illegal Data Address",
            Self::IllegalDataValue => "Illegal Data Value",
            Self::SlaveDeviceFailure => "Slave Device Failure",
        }
    }

    /// Exception PDU answering `function`
    pub fn response_pdu(self, function: u8) -> ModbusPdu {
        ModbusPdu::exception(function, self.code())
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} ({})", self.code(), self.description())
    }
}

/// A typed Modbus request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, coils: Vec<bool> },
    WriteMultipleRegisters { address: u16, registers: Vec<u16> },
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn require_len(data: &[u8], needed: usize, function: FunctionCode) -> Result<()> {
    if data.len() < needed {
        return Err(ModbusError::malformed(format!(
            "{} needs {} data bytes, got {}",
            function,
            needed,
            data.len()
        )));
    }
    Ok(())
}

fn check_quantity(function: FunctionCode, quantity: u16, max: u16) -> Result<()> {
    if quantity == 0 || quantity > max {
        return Err(ModbusError::illegal_value(format!(
            "{} quantity {} outside 1..={}",
            function, quantity, max
        )));
    }
    Ok(())
}

fn check_range(function: FunctionCode, address: u16, quantity: u16) -> Result<()> {
    if u32::from(address) + u32::from(quantity) > 0x1_0000 {
        return Err(ModbusError::malformed(format!(
            "{} range {}+{} exceeds address space",
            function, address, quantity
        )));
    }
    Ok(())
}

impl Request {
    /// Decode a request PDU (function code first)
    pub fn parse(pdu: &[u8]) -> Result<Self> {
        let (&fc, data) = pdu
            .split_first()
            .ok_or_else(|| ModbusError::malformed("empty PDU"))?;
        let function = FunctionCode::try_from(fc)?;
        Self::decode(function, data)
    }

    /// Decode the data bytes that follow a known function code
    pub fn decode(function: FunctionCode, data: &[u8]) -> Result<Self> {
        require_len(data, 4, function)?;
        let address = read_u16(data, 0);
        let word = read_u16(data, 2);

        let request = match function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                check_quantity(function, word, MAX_READ_COILS)?;
                check_range(function, address, word)?;
                if function == FunctionCode::ReadCoils {
                    Self::ReadCoils {
                        address,
                        quantity: word,
                    }
                } else {
                    Self::ReadDiscreteInputs {
                        address,
                        quantity: word,
                    }
                }
            },
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                check_quantity(function, word, MAX_READ_REGISTERS)?;
                check_range(function, address, word)?;
                if function == FunctionCode::ReadHoldingRegisters {
                    Self::ReadHoldingRegisters {
                        address,
                        quantity: word,
                    }
                } else {
                    Self::ReadInputRegisters {
                        address,
                        quantity: word,
                    }
                }
            },
            FunctionCode::WriteSingleCoil => {
                let value = match word {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => {
                        return Err(ModbusError::illegal_value(format!(
                            "coil value {:#06X} is neither 0xFF00 nor 0x0000",
                            other
                        )))
                    },
                };
                Self::WriteSingleCoil { address, value }
            },
            FunctionCode::WriteSingleRegister => Self::WriteSingleRegister {
                address,
                value: word,
            },
            FunctionCode::WriteMultipleCoils => {
                require_len(data, 5, function)?;
                let byte_count = data[4] as usize;
                require_len(data, 5 + byte_count, function)?;
                check_quantity(function, word, MAX_WRITE_COILS)?;
                check_range(function, address, word)?;
                let expected = usize::from(word).div_ceil(8);
                if byte_count != expected {
                    return Err(ModbusError::illegal_value(format!(
                        "byte count {} does not match {} coils (expected {})",
                        byte_count, word, expected
                    )));
                }
                Self::WriteMultipleCoils {
                    address,
                    coils: unpack_bits(&data[5..5 + byte_count], usize::from(word)),
                }
            },
            FunctionCode::WriteMultipleRegisters => {
                require_len(data, 5, function)?;
                let byte_count = data[4] as usize;
                require_len(data, 5 + byte_count, function)?;
                check_quantity(function, word, MAX_WRITE_REGISTERS)?;
                check_range(function, address, word)?;
                let expected = usize::from(word) * 2;
                if byte_count != expected {
                    return Err(ModbusError::illegal_value(format!(
                        "byte count {} does not match {} registers (expected {})",
                        byte_count, word, expected
                    )));
                }
                Self::WriteMultipleRegisters {
                    address,
                    registers: data[5..5 + byte_count]
                        .chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                        .collect(),
                }
            },
        };

        trace!("Decoded {}: {:?}", function, request);
        Ok(request)
    }

    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadCoils { .. } => FunctionCode::ReadCoils,
            Self::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Self::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            Self::ReadCoils { address, .. }
            | Self::ReadDiscreteInputs { address, .. }
            | Self::ReadHoldingRegisters { address, .. }
            | Self::ReadInputRegisters { address, .. }
            | Self::WriteSingleCoil { address, .. }
            | Self::WriteSingleRegister { address, .. }
            | Self::WriteMultipleCoils { address, .. }
            | Self::WriteMultipleRegisters { address, .. } => *address,
        }
    }

    /// Number of coils or registers addressed
    pub fn quantity(&self) -> u16 {
        match self {
            Self::ReadCoils { quantity, .. }
            | Self::ReadDiscreteInputs { quantity, .. }
            | Self::ReadHoldingRegisters { quantity, .. }
            | Self::ReadInputRegisters { quantity, .. } => *quantity,
            Self::WriteSingleCoil { .. } | Self::WriteSingleRegister { .. } => 1,
            Self::WriteMultipleCoils { coils, .. } => coils.len() as u16,
            Self::WriteMultipleRegisters { registers, .. } => registers.len() as u16,
        }
    }

    /// Encode the request PDU sent to a backend
    pub fn encode(&self) -> Result<ModbusPdu> {
        let builder = PduBuilder::new()
            .function_code(self.function_code().code())?
            .address(self.address())?;

        let pdu = match self {
            Self::ReadCoils { quantity, .. }
            | Self::ReadDiscreteInputs { quantity, .. }
            | Self::ReadHoldingRegisters { quantity, .. }
            | Self::ReadInputRegisters { quantity, .. } => builder.quantity(*quantity)?.build(),
            Self::WriteSingleCoil { value, .. } => builder
                .quantity(if *value { COIL_ON } else { COIL_OFF })?
                .build(),
            Self::WriteSingleRegister { value, .. } => builder.quantity(*value)?.build(),
            Self::WriteMultipleCoils { coils, .. } => {
                let packed = pack_bits(coils);
                builder
                    .quantity(coils.len() as u16)?
                    .byte(packed.len() as u8)?
                    .data(&packed)?
                    .build()
            },
            Self::WriteMultipleRegisters { registers, .. } => {
                let mut bytes = Vec::with_capacity(registers.len() * 2);
                for reg in registers {
                    bytes.extend_from_slice(&reg.to_be_bytes());
                }
                builder
                    .quantity(registers.len() as u16)?
                    .byte(bytes.len() as u8)?
                    .data(&bytes)?
                    .build()
            },
        };
        Ok(pdu)
    }
}

/// A typed Modbus response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadCoils(Vec<bool>),
    ReadDiscreteInputs(Vec<bool>),
    ReadHoldingRegisters(Vec<u16>),
    ReadInputRegisters(Vec<u16>),
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, quantity: u16 },
    WriteMultipleRegisters { address: u16, quantity: u16 },
}

impl Response {
    /// Decode and validate a backend response PDU against `request`
    pub fn decode(request: &Request, pdu: &[u8]) -> Result<Self> {
        let function = request.function_code();
        let (&fc, data) = pdu
            .split_first()
            .ok_or_else(|| ModbusError::unexpected("empty response PDU"))?;

        if fc == function.code() | EXCEPTION_FLAG {
            let code = data
                .first()
                .copied()
                .ok_or_else(|| ModbusError::unexpected("exception without code"))?;
            return Err(ModbusError::Exception {
                function: function.code(),
                code,
            });
        }
        if fc != function.code() {
            return Err(ModbusError::unexpected(format!(
                "function code {:#04X} does not answer {}",
                fc, function
            )));
        }

        match request {
            Request::ReadCoils { quantity, .. } | Request::ReadDiscreteInputs { quantity, .. } => {
                let bytes = byte_counted(data, usize::from(*quantity).div_ceil(8))?;
                let bits = unpack_bits(bytes, usize::from(*quantity));
                Ok(if function == FunctionCode::ReadCoils {
                    Self::ReadCoils(bits)
                } else {
                    Self::ReadDiscreteInputs(bits)
                })
            },
            Request::ReadHoldingRegisters { quantity, .. }
            | Request::ReadInputRegisters { quantity, .. } => {
                let bytes = byte_counted(data, usize::from(*quantity) * 2)?;
                let registers = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(if function == FunctionCode::ReadHoldingRegisters {
                    Self::ReadHoldingRegisters(registers)
                } else {
                    Self::ReadInputRegisters(registers)
                })
            },
            Request::WriteSingleCoil { address, value } => {
                let (echo_addr, echo_value) = echo_words(data)?;
                let expected = if *value { COIL_ON } else { COIL_OFF };
                if echo_addr != *address || echo_value != expected {
                    return Err(ModbusError::unexpected(format!(
                        "write echo {}/{:#06X} does not match request",
                        echo_addr, echo_value
                    )));
                }
                Ok(Self::WriteSingleCoil {
                    address: *address,
                    value: *value,
                })
            },
            Request::WriteSingleRegister { address, value } => {
                let (echo_addr, echo_value) = echo_words(data)?;
                if echo_addr != *address || echo_value != *value {
                    return Err(ModbusError::unexpected(format!(
                        "write echo {}/{} does not match request",
                        echo_addr, echo_value
                    )));
                }
                Ok(Self::WriteSingleRegister {
                    address: *address,
                    value: *value,
                })
            },
            Request::WriteMultipleCoils { address, .. }
            | Request::WriteMultipleRegisters { address, .. } => {
                let (echo_addr, echo_qty) = echo_words(data)?;
                let quantity = request.quantity();
                if echo_addr != *address || echo_qty != quantity {
                    return Err(ModbusError::unexpected(format!(
                        "write echo {}/{} does not match {}/{}",
                        echo_addr, echo_qty, address, quantity
                    )));
                }
                Ok(if function == FunctionCode::WriteMultipleCoils {
                    Self::WriteMultipleCoils {
                        address: *address,
                        quantity,
                    }
                } else {
                    Self::WriteMultipleRegisters {
                        address: *address,
                        quantity,
                    }
                })
            },
        }
    }

    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadCoils(_) => FunctionCode::ReadCoils,
            Self::ReadDiscreteInputs(_) => FunctionCode::ReadDiscreteInputs,
            Self::ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters,
            Self::ReadInputRegisters(_) => FunctionCode::ReadInputRegisters,
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// Encode the response PDU returned to the client
    ///
    /// Write-multiple responses are always the fixed 4-byte echo of
    /// starting address and quantity.
    pub fn encode(&self) -> Result<ModbusPdu> {
        let builder = PduBuilder::new().function_code(self.function_code().code())?;

        let pdu = match self {
            Self::ReadCoils(bits) | Self::ReadDiscreteInputs(bits) => {
                let packed = pack_bits(bits);
                builder.byte(packed.len() as u8)?.data(&packed)?.build()
            },
            Self::ReadHoldingRegisters(regs) | Self::ReadInputRegisters(regs) => {
                let mut bytes = Vec::with_capacity(regs.len() * 2);
                for reg in regs {
                    bytes.extend_from_slice(&reg.to_be_bytes());
                }
                builder.byte(bytes.len() as u8)?.data(&bytes)?.build()
            },
            Self::WriteSingleCoil { address, value } => builder
                .address(*address)?
                .quantity(if *value { COIL_ON } else { COIL_OFF })?
                .build(),
            Self::WriteSingleRegister { address, value } => {
                builder.address(*address)?.quantity(*value)?.build()
            },
            Self::WriteMultipleCoils { address, quantity }
            | Self::WriteMultipleRegisters { address, quantity } => {
                builder.address(*address)?.quantity(*quantity)?.build()
            },
        };
        Ok(pdu)
    }
}

/// `[byte_count][bytes...]` with an exact expected count
fn byte_counted(data: &[u8], expected: usize) -> Result<&[u8]> {
    let byte_count = *data
        .first()
        .ok_or_else(|| ModbusError::unexpected("response missing byte count"))?
        as usize;
    if byte_count != expected {
        return Err(ModbusError::unexpected(format!(
            "byte count {} (expected {})",
            byte_count, expected
        )));
    }
    if data.len() < 1 + byte_count {
        return Err(ModbusError::unexpected(format!(
            "response truncated: {} of {} data bytes",
            data.len() - 1,
            byte_count
        )));
    }
    Ok(&data[1..1 + byte_count])
}

fn echo_words(data: &[u8]) -> Result<(u16, u16)> {
    if data.len() < 4 {
        return Err(ModbusError::unexpected(format!(
            "write echo needs 4 bytes, got {}",
            data.len()
        )));
    }
    Ok((read_u16(data, 0), read_u16(data, 2)))
}

/// Pack bits LSB-first: bit `i` goes to byte `i / 8`, position `i % 8`
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Inverse of [`pack_bits`]; stops early if `bytes` runs out
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count.min(bytes.len() * 8))
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}
