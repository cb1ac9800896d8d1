//! Integration test support
//!
//! In-process Modbus-TCP slaves and a minimal client for gateway tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use modbus_core::connection::tcp_exchange;
use modbus_core::{MbapCodec, ModbusPdu, Request, Response, TcpAdu};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use fwdsrv::{Gateway, GatewayConfig, ServerSpec};

pub const BANK_SIZE: usize = 4096;

/// Register and coil memory of a stub slave
#[derive(Debug)]
pub struct Bank {
    pub coils: Vec<bool>,
    pub discrete_inputs: Vec<bool>,
    pub holding: Vec<u16>,
    pub input: Vec<u16>,
}

impl Default for Bank {
    fn default() -> Self {
        Self {
            coils: vec![false; BANK_SIZE],
            discrete_inputs: (0..BANK_SIZE).map(|i| i % 2 == 0).collect(),
            holding: vec![0; BANK_SIZE],
            input: (0..BANK_SIZE).map(|i| i as u16).collect(),
        }
    }
}

/// Modbus-TCP slave served from a [`Bank`]
#[derive(Clone)]
pub struct StubSlave {
    pub addr: SocketAddr,
    pub bank: Arc<Mutex<Bank>>,
    /// Delay before each reply, in milliseconds
    pub delay_ms: Arc<AtomicU64>,
    pub requests: Arc<AtomicUsize>,
    pub connections: Arc<AtomicUsize>,
    /// Connections the gateway has since closed
    pub disconnects: Arc<AtomicUsize>,
}

impl StubSlave {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let slave = Self {
            addr: listener.local_addr().unwrap(),
            bank: Arc::new(Mutex::new(Bank::default())),
            delay_ms: Arc::new(AtomicU64::new(0)),
            requests: Arc::new(AtomicUsize::new(0)),
            connections: Arc::new(AtomicUsize::new(0)),
            disconnects: Arc::new(AtomicUsize::new(0)),
        };

        let server = slave.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                server.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(server.clone().serve(stream));
            }
        });
        slave
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn spec(&self, slave_id: u8) -> ServerSpec {
        ServerSpec::tcp(slave_id, "127.0.0.1", self.port())
    }

    async fn serve(self, stream: TcpStream) {
        let mut framed = Framed::new(stream, MbapCodec);
        while let Some(Ok(adu)) = framed.next().await {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let reply = self.execute(adu.pdu.as_slice());
            if framed
                .send(TcpAdu::new(adu.transaction_id, adu.unit_id, reply))
                .await
                .is_err()
            {
                break;
            }
        }
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    /// Wait until `count` gateway connections have been closed
    pub async fn wait_for_disconnects(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.disconnects.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("backend connection was not released");
    }

    fn execute(&self, pdu: &[u8]) -> ModbusPdu {
        let request = match Request::parse(pdu) {
            Ok(request) => request,
            Err(_) => return ModbusPdu::exception(pdu.first().copied().unwrap_or(0), 0x01),
        };
        let start = usize::from(request.address());
        let end = start + usize::from(request.quantity());
        if end > BANK_SIZE {
            return ModbusPdu::exception(request.function_code().code(), 0x02);
        }

        let mut bank = self.bank.lock();
        let response = match &request {
            Request::ReadCoils { .. } => Response::ReadCoils(bank.coils[start..end].to_vec()),
            Request::ReadDiscreteInputs { .. } => {
                Response::ReadDiscreteInputs(bank.discrete_inputs[start..end].to_vec())
            },
            Request::ReadHoldingRegisters { .. } => {
                Response::ReadHoldingRegisters(bank.holding[start..end].to_vec())
            },
            Request::ReadInputRegisters { .. } => {
                Response::ReadInputRegisters(bank.input[start..end].to_vec())
            },
            Request::WriteSingleCoil { address, value } => {
                bank.coils[start] = *value;
                Response::WriteSingleCoil {
                    address: *address,
                    value: *value,
                }
            },
            Request::WriteSingleRegister { address, value } => {
                bank.holding[start] = *value;
                Response::WriteSingleRegister {
                    address: *address,
                    value: *value,
                }
            },
            Request::WriteMultipleCoils { address, coils } => {
                bank.coils[start..end].copy_from_slice(coils);
                Response::WriteMultipleCoils {
                    address: *address,
                    quantity: coils.len() as u16,
                }
            },
            Request::WriteMultipleRegisters { address, registers } => {
                bank.holding[start..end].copy_from_slice(registers);
                Response::WriteMultipleRegisters {
                    address: *address,
                    quantity: registers.len() as u16,
                }
            },
        };
        response.encode().unwrap()
    }
}

/// Upstream Modbus-TCP client talking to the gateway
pub struct TestClient {
    framed: Framed<TcpStream, MbapCodec>,
    next_transaction_id: AtomicU16,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        Self {
            framed: Framed::new(TcpStream::connect(addr).await.unwrap(), MbapCodec),
            next_transaction_id: AtomicU16::new(1),
        }
    }

    /// Send one request PDU, return the response PDU bytes
    pub async fn request(&mut self, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        let txid = self.next_transaction_id.fetch_add(1, Ordering::SeqCst);
        let pdu = ModbusPdu::from_slice(pdu).unwrap();
        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            tcp_exchange(&mut self.framed, txid, unit_id, &pdu),
        )
        .await
        .expect("gateway did not answer within 5s")
        .unwrap();
        reply.as_slice().to_vec()
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.framed.get_mut().write_all(bytes).await.unwrap();
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.framed.get_mut()
    }
}

/// Gateway on an ephemeral port in front of the given slaves
pub async fn start_gateway(servers: Vec<ServerSpec>) -> Gateway {
    let mut config = GatewayConfig::new(servers);
    config.listen_port = 0;
    Gateway::start(&config).await.unwrap()
}
