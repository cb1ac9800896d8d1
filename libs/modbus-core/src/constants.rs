//! Modbus protocol constants
//!
//! Limits per the Modbus Application Protocol Specification V1.1b3.

use std::time::Duration;

// ============================================================================
// Frame layout
// ============================================================================

/// MBAP prefix that precedes the length-counted part of a TCP frame
/// (transaction id 2 + protocol id 2 + length 2)
pub const MBAP_PREFIX_LEN: usize = 6;

/// Full MBAP header including the unit identifier
pub const MBAP_HEADER_LEN: usize = MBAP_PREFIX_LEN + 1;

/// Maximum PDU size in bytes (function code + data)
///
/// 256-byte RTU ADU limit minus slave address (1) and CRC (2).
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum value of the MBAP length field (unit id + PDU)
pub const MAX_MBAP_LENGTH: usize = MAX_PDU_SIZE + 1;

/// Minimum value of the MBAP length field (unit id + function code)
pub const MIN_MBAP_LENGTH: usize = 2;

/// Maximum RTU ADU size: address + PDU + CRC
pub const MAX_RTU_FRAME_SIZE: usize = 1 + MAX_PDU_SIZE + 2;

/// Smallest valid RTU frame: address + function code + CRC
pub const MIN_RTU_FRAME_SIZE: usize = 4;

/// Modbus TCP protocol identifier
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Quantity limits
// ============================================================================

/// FC03/FC04: (253 - 2) / 2 = 125 registers
pub const MAX_READ_REGISTERS: u16 = 125;

/// FC16: (253 - 6) / 2 = 123 registers
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// FC01/FC02: 250 data bytes * 8, capped by the standard at 2000
pub const MAX_READ_COILS: u16 = 2000;

/// FC15: (253 - 6) * 8 = 1976, capped by the standard at 1968
pub const MAX_WRITE_COILS: u16 = 1968;

/// FC05 wire value for ON
pub const COIL_ON: u16 = 0xFF00;

/// FC05 wire value for OFF
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Serial timing
// ============================================================================

/// Floor for the RTU inter-frame silence, applied above 19200 baud
pub const MIN_RTU_SILENCE: Duration = Duration::from_micros(1750);

/// Bits per RTU character: start + 8 data + parity/stop padding
pub const RTU_BITS_PER_CHAR: u64 = 11;

/// Inter-frame silence for a baud rate: 3.5 character times,
/// fixed at 1.75 ms above 19200 baud.
pub fn rtu_silence(baud_rate: u32) -> Duration {
    if baud_rate == 0 || baud_rate > 19_200 {
        return MIN_RTU_SILENCE;
    }
    // 3.5 chars = 7/2 * bits * 1e6 / baud microseconds
    let micros = RTU_BITS_PER_CHAR * 7 * 1_000_000 / (2 * u64::from(baud_rate));
    Duration::from_micros(micros).max(MIN_RTU_SILENCE)
}
