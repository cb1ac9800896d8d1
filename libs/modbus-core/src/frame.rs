//! Modbus wire framing
//!
//! Modbus-TCP: `[txid:2][proto:2][len:2][unit:1][pdu]`, `len` counts unit + PDU.
//! Modbus-RTU: `[unit:1][pdu][crc_lo][crc_hi]`.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::constants::{
    MAX_MBAP_LENGTH, MAX_PDU_SIZE, MBAP_HEADER_LEN, MBAP_PREFIX_LEN, MIN_MBAP_LENGTH,
    MIN_RTU_FRAME_SIZE, MODBUS_PROTOCOL_ID,
};
use crate::error::{ModbusError, Result};
use crate::pdu::ModbusPdu;

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Unit id + PDU length
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse and validate the first seven bytes of a TCP frame
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(ModbusError::FrameTooShort {
                needed: MBAP_HEADER_LEN,
                actual: data.len(),
            });
        }

        let header = Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        };

        if header.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(ModbusError::InvalidProtocolId(header.protocol_id));
        }
        let length = header.length as usize;
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(ModbusError::InvalidLength(header.length));
        }

        Ok(header)
    }

    /// Total frame size announced by this header
    pub fn frame_len(&self) -> usize {
        MBAP_PREFIX_LEN + self.length as usize
    }
}

/// A decoded Modbus-TCP application data unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpAdu {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: ModbusPdu,
}

impl TcpAdu {
    pub fn new(transaction_id: u16, unit_id: u8, pdu: ModbusPdu) -> Self {
        Self {
            transaction_id,
            unit_id,
            pdu,
        }
    }
}

/// Build a TCP frame
pub fn encode_tcp(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Result<Vec<u8>> {
    if pdu.len() > MAX_PDU_SIZE {
        return Err(ModbusError::PduTooLarge {
            size: pdu.len(),
            max: MAX_PDU_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&MODBUS_PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    Ok(frame)
}

/// Parse a complete TCP frame; bytes past the announced length are ignored
pub fn decode_tcp(data: &[u8]) -> Result<TcpAdu> {
    let header = MbapHeader::parse(data)?;
    let total = header.frame_len();
    if data.len() < total {
        return Err(ModbusError::FrameTooShort {
            needed: total,
            actual: data.len(),
        });
    }

    let pdu = ModbusPdu::from_slice(&data[MBAP_HEADER_LEN..total])?;
    Ok(TcpAdu::new(header.transaction_id, header.unit_id, pdu))
}

/// Build an RTU frame with trailing CRC (low byte first)
pub fn encode_rtu(unit_id: u8, pdu: &[u8]) -> Result<Vec<u8>> {
    if pdu.len() > MAX_PDU_SIZE {
        return Err(ModbusError::PduTooLarge {
            size: pdu.len(),
            max: MAX_PDU_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Parse a complete RTU frame after verifying its CRC
pub fn decode_rtu(data: &[u8]) -> Result<(u8, ModbusPdu)> {
    if data.len() < MIN_RTU_FRAME_SIZE {
        return Err(ModbusError::FrameTooShort {
            needed: MIN_RTU_FRAME_SIZE,
            actual: data.len(),
        });
    }

    let body_len = data.len() - 2;
    let expected = crc16(&data[..body_len]);
    let actual = u16::from_le_bytes([data[body_len], data[body_len + 1]]);
    if expected != actual {
        return Err(ModbusError::CrcMismatch { expected, actual });
    }

    let pdu = ModbusPdu::from_slice(&data[1..body_len])?;
    Ok((data[0], pdu))
}

/// CRC-16/MODBUS: reflected polynomial 0xA001, initial value 0xFFFF
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Stream codec for Modbus-TCP, used by ingress clients and TCP backends
#[derive(Debug, Default, Clone, Copy)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = TcpAdu;
    type Error = ModbusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<TcpAdu>> {
        if src.len() < MBAP_HEADER_LEN {
            src.reserve(MBAP_HEADER_LEN - src.len());
            return Ok(None);
        }

        let header = MbapHeader::parse(&src[..MBAP_HEADER_LEN])?;
        let total = header.frame_len();
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        decode_tcp(&frame).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<TcpAdu>> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => {
                let needed = if buf.len() < MBAP_HEADER_LEN {
                    MBAP_HEADER_LEN
                } else {
                    MbapHeader::parse(&buf[..MBAP_HEADER_LEN])?.frame_len()
                };
                debug!("Peer closed mid-frame: {} of {} bytes", buf.len(), needed);
                let actual = buf.len();
                buf.advance(actual);
                Err(ModbusError::FrameTooShort { needed, actual })
            },
        }
    }
}

impl Encoder<TcpAdu> for MbapCodec {
    type Error = ModbusError;

    fn encode(&mut self, item: TcpAdu, dst: &mut BytesMut) -> Result<()> {
        let frame = encode_tcp(item.transaction_id, item.unit_id, item.pdu.as_slice())?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
