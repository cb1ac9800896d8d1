//! Modbus backend transports
//!
//! One request/response exchange at a time per connection; callers serialize
//! access and apply their own deadline around [`ModbusConnection::transact`].
//! Both transports tolerate that deadline cancelling an exchange midway: TCP
//! keeps partial replies in the codec buffer, RTU clears its input first.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use common::hex::format_frame;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::constants::{EXCEPTION_FLAG, MAX_RTU_FRAME_SIZE};
use crate::error::{ModbusError, Result};
use crate::frame::{self, MbapCodec, TcpAdu};
use crate::pdu::ModbusPdu;

#[cfg(feature = "rtu")]
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// Backend connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    Tcp,
    Rtu,
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Rtu => write!(f, "RTU"),
        }
    }
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl FromStr for Parity {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "N" | "NONE" => Ok(Self::None),
            "E" | "EVEN" => Ok(Self::Even),
            "O" | "ODD" => Ok(Self::Odd),
            other => Err(ModbusError::Config(format!(
                "parity must be N, E or O, got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "N"),
            Self::Even => write!(f, "E"),
            Self::Odd => write!(f, "O"),
        }
    }
}

/// Serial line settings for an RTU backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

/// How to reach a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Tcp { host: String, port: u16 },
    Rtu(SerialSettings),
}

impl TransportConfig {
    pub fn conn_type(&self) -> ConnType {
        match self {
            Self::Tcp { .. } => ConnType::Tcp,
            Self::Rtu(_) => ConnType::Rtu,
        }
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Self::Rtu(s) => write!(
                f,
                "{} @{} {}{}{}",
                s.device, s.baud_rate, s.data_bits, s.parity, s.stop_bits
            ),
        }
    }
}

/// Modbus-TCP client side of a backend link
#[derive(Debug)]
pub struct TcpTransport {
    framed: Framed<TcpStream, MbapCodec>,
    peer: String,
    next_transaction_id: u16,
}

/// Modbus-RTU serial link
#[cfg(feature = "rtu")]
#[derive(Debug)]
pub struct RtuTransport {
    port: SerialStream,
    device: String,
    gap: FrameGap,
}

/// Inter-frame silence bookkeeping for an RTU line
#[derive(Debug, Clone)]
pub struct FrameGap {
    silence: Duration,
    last_activity: Option<Instant>,
}

impl FrameGap {
    pub fn new(silence: Duration) -> Self {
        Self {
            silence,
            last_activity: None,
        }
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    /// Silence still owed before the next frame may start
    pub fn remaining(&self) -> Duration {
        self.last_activity
            .map(|last| self.silence.saturating_sub(last.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    pub async fn wait(&self) {
        let remaining = self.remaining();
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Some(Instant::now());
    }
}

/// Open backend connection
#[derive(Debug)]
pub enum ModbusConnection {
    Tcp(TcpTransport),
    #[cfg(feature = "rtu")]
    Rtu(RtuTransport),
}

impl ModbusConnection {
    /// Open the transport described by `config`
    pub async fn open(config: &TransportConfig, connect_timeout: Duration) -> Result<Self> {
        match config {
            TransportConfig::Tcp { host, port } => {
                Self::connect_tcp(host, *port, connect_timeout).await
            },
            #[cfg(feature = "rtu")]
            TransportConfig::Rtu(settings) => Self::open_rtu(settings),
            #[cfg(not(feature = "rtu"))]
            TransportConfig::Rtu(settings) => Err(ModbusError::Connection(format!(
                "RTU support not built in, cannot open {}",
                settings.device
            ))),
        }
    }

    pub async fn connect_tcp(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let addr = format!("{host}:{port}");
        debug!("TCP connecting: {}", addr);

        match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!("TCP connected: {}", addr);
                Ok(Self::Tcp(TcpTransport {
                    framed: Framed::new(stream, MbapCodec),
                    peer: addr,
                    next_transaction_id: 1,
                }))
            },
            Ok(Err(e)) => Err(ModbusError::Connection(format!(
                "Failed to connect to {addr}: {e}"
            ))),
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                Err(ModbusError::Connection(format!(
                    "Connection to {addr} timed out"
                )))
            },
        }
    }

    #[cfg(feature = "rtu")]
    pub fn open_rtu(settings: &SerialSettings) -> Result<Self> {
        debug!("RTU: {} @{}baud", settings.device, settings.baud_rate);

        let parity = match settings.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        };
        let data_bits = match settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match settings.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let port = tokio_serial::new(&settings.device, settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
            .map_err(|e| {
                ModbusError::Connection(format!(
                    "Failed to open serial port {}: {e}",
                    settings.device
                ))
            })?;

        info!("RTU opened: {}", settings.device);
        Ok(Self::Rtu(RtuTransport {
            port,
            device: settings.device.clone(),
            gap: FrameGap::new(crate::constants::rtu_silence(settings.baud_rate)),
        }))
    }

    pub fn conn_type(&self) -> ConnType {
        match self {
            Self::Tcp(_) => ConnType::Tcp,
            #[cfg(feature = "rtu")]
            Self::Rtu(_) => ConnType::Rtu,
        }
    }

    /// Send one request PDU to `unit_id` and wait for its response PDU
    pub async fn transact(&mut self, unit_id: u8, request: &ModbusPdu) -> Result<ModbusPdu> {
        match self {
            Self::Tcp(tcp) => {
                let transaction_id = tcp.next_transaction_id;
                tcp.next_transaction_id = tcp.next_transaction_id.wrapping_add(1);
                debug!("TCP {} txid={} unit={}", tcp.peer, transaction_id, unit_id);
                tcp_exchange(&mut tcp.framed, transaction_id, unit_id, request).await
            },
            #[cfg(feature = "rtu")]
            Self::Rtu(rtu) => rtu.transact(unit_id, request).await,
        }
    }
}

#[cfg(feature = "rtu")]
impl RtuTransport {
    async fn transact(&mut self, unit_id: u8, request: &ModbusPdu) -> Result<ModbusPdu> {
        self.gap.wait().await;

        // Drop late replies to an earlier, timed-out request
        if let Err(e) = self.port.clear(tokio_serial::ClearBuffer::Input) {
            debug!("RTU clear {}: {}", self.device, e);
        }

        marked_rtu_exchange(&mut self.port, &mut self.gap, unit_id, request.as_slice()).await
    }
}

/// One Modbus-TCP exchange over a framed byte stream.
///
/// Responses carrying another transaction id are stale replies to an
/// abandoned request and are skipped. A reply cut short by a cancelled
/// exchange stays in the codec buffer and is skipped the same way.
pub async fn tcp_exchange<S>(
    framed: &mut Framed<S, MbapCodec>,
    transaction_id: u16,
    unit_id: u8,
    request: &ModbusPdu,
) -> Result<ModbusPdu>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("TX txid={}: {}", transaction_id, format_frame(request.as_slice()));
    framed
        .send(TcpAdu::new(transaction_id, unit_id, request.clone()))
        .await?;

    loop {
        let adu = framed
            .next()
            .await
            .ok_or_else(|| ModbusError::Connection("peer closed".to_string()))??;
        debug!("RX txid={}: {}", adu.transaction_id, format_frame(adu.pdu.as_slice()));
        if adu.transaction_id != transaction_id {
            debug!(
                "Discarding stale response txid={} (waiting for {})",
                adu.transaction_id, transaction_id
            );
            continue;
        }
        if adu.unit_id != unit_id {
            return Err(ModbusError::unexpected(format!(
                "unit id {} in response to unit {}",
                adu.unit_id, unit_id
            )));
        }
        return Ok(adu.pdu);
    }
}

/// RTU exchange that records bus activity on `gap` when it starts and when
/// it ends, so a cancelled exchange still delays the next frame
pub async fn marked_rtu_exchange<S>(
    stream: &mut S,
    gap: &mut FrameGap,
    unit_id: u8,
    request: &[u8],
) -> Result<ModbusPdu>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    gap.touch();
    let result = rtu_exchange(stream, unit_id, request).await;
    gap.touch();
    result
}

/// One Modbus-RTU exchange over any byte stream
pub async fn rtu_exchange<S>(stream: &mut S, unit_id: u8, request: &[u8]) -> Result<ModbusPdu>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = frame::encode_rtu(unit_id, request)?;
    debug!("TX: {}", format_frame(&frame));
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let raw = read_rtu_frame(stream).await?;
    debug!("RX: {}", format_frame(&raw));
    let (address, pdu) = frame::decode_rtu(&raw)?;
    if address != unit_id {
        return Err(ModbusError::unexpected(format!(
            "unit id {} in response to unit {}",
            address, unit_id
        )));
    }
    Ok(pdu)
}

/// Read one RTU response frame, sized from its function code
pub async fn read_rtu_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; 2];
    reader.read_exact(&mut frame).await?;
    let function = frame[1];

    // Bytes still to come after address + function, CRC included
    let remaining = if function & EXCEPTION_FLAG != 0 {
        1 + 2
    } else {
        match function {
            0x01..=0x04 => {
                let byte_count = reader.read_u8().await?;
                frame.push(byte_count);
                usize::from(byte_count) + 2
            },
            0x05 | 0x06 | 0x0F | 0x10 => 4 + 2,
            other => {
                return Err(ModbusError::unexpected(format!(
                    "cannot size RTU response for function {:#04X}",
                    other
                )))
            },
        }
    };

    let start = frame.len();
    if start + remaining > MAX_RTU_FRAME_SIZE {
        return Err(ModbusError::unexpected(format!(
            "RTU response of {} bytes exceeds {}",
            start + remaining,
            MAX_RTU_FRAME_SIZE
        )));
    }
    frame.resize(start + remaining, 0);
    reader.read_exact(&mut frame[start..]).await?;
    Ok(frame)
}
