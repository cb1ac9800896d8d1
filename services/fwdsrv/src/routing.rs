//! Backend connections and the slave routing table
//!
//! Each configured slave owns one [`BackendConnection`]. The tokio mutex around
//! its transport is the per-slave gate: at most one request/response exchange
//! is on the wire per slave, queued callers are served in arrival order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use errors::{ServiceError, ServiceResult};
use modbus_core::{ConnType, ModbusConnection, ModbusError, ModbusPdu, Request, Response};
use parking_lot::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerSpec;
use crate::error::RequestError;

/// Outcome of the most recent health probe
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProbeStatus {
    #[default]
    Unknown,
    Healthy,
    Failing(String),
}

/// Point-in-time view of a connection's health
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    pub last_error: Option<String>,
    pub last_contact: Option<DateTime<Utc>>,
    pub probe: ProbeStatus,
}

#[derive(Debug, Default)]
struct HealthState {
    last_error: Option<String>,
    last_contact: Option<DateTime<Utc>>,
    probe: ProbeStatus,
}

/// Link to one backend slave
#[derive(Debug)]
pub struct BackendConnection {
    spec: ServerSpec,
    /// Per-slave gate; `None` once the stream was lost or the connection closed
    transport: tokio::sync::Mutex<Option<ModbusConnection>>,
    health: Mutex<HealthState>,
    closing: CancellationToken,
    closed: AtomicBool,
}

impl BackendConnection {
    /// Open the backend transport described by `spec`
    pub async fn open(spec: ServerSpec) -> modbus_core::Result<Self> {
        let conn = ModbusConnection::open(&spec.transport, spec.timeout).await?;
        Ok(Self::with_transport(spec, Some(conn)))
    }

    fn with_transport(spec: ServerSpec, transport: Option<ModbusConnection>) -> Self {
        Self {
            spec,
            transport: tokio::sync::Mutex::new(transport),
            health: Mutex::new(HealthState::default()),
            closing: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn slave_id(&self) -> u8 {
        self.spec.slave_id
    }

    pub fn conn_type(&self) -> ConnType {
        self.spec.conn_type()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn health(&self) -> HealthSnapshot {
        let state = self.health.lock();
        HealthSnapshot {
            last_error: state.last_error.clone(),
            last_contact: state.last_contact,
            probe: state.probe.clone(),
        }
    }

    /// Store the latest probe outcome, returning the previous one
    pub(crate) fn replace_probe_status(&self, status: ProbeStatus) -> ProbeStatus {
        std::mem::replace(&mut self.health.lock().probe, status)
    }

    /// Forward one request and decode the backend's answer
    pub async fn call(&self, request: &Request) -> modbus_core::Result<Response> {
        let pdu = request.encode()?;

        let result = tokio::select! {
            biased;
            () = self.closing.cancelled() => Err(ModbusError::Closed),
            reply = self.round_trip(&pdu) => reply,
        };
        let result = result.and_then(|reply| Response::decode(request, reply.as_slice()));

        let mut health = self.health.lock();
        match &result {
            Ok(_) => {
                health.last_contact = Some(Utc::now());
                health.last_error = None;
            },
            Err(e) => health.last_error = Some(e.to_string()),
        }
        result
    }

    async fn round_trip(&self, pdu: &ModbusPdu) -> modbus_core::Result<ModbusPdu> {
        let mut guard = self.transport.lock().await;
        if self.closing.is_cancelled() {
            return Err(ModbusError::Closed);
        }

        if guard.is_none() {
            let conn = ModbusConnection::open(&self.spec.transport, self.spec.timeout).await?;
            info!("Slave {} reconnected ({})", self.spec.slave_id, self.spec.transport);
            *guard = Some(conn);
        }
        let conn = guard.as_mut().ok_or(ModbusError::Closed)?;
        let is_tcp = conn.conn_type() == ConnType::Tcp;

        match timeout(self.spec.timeout, conn.transact(self.spec.slave_id, pdu)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                // A desynchronised TCP stream cannot find the next frame boundary
                if e.is_transport_loss() || (is_tcp && e.is_framing()) {
                    warn!("Slave {} transport lost: {}", self.spec.slave_id, e);
                    *guard = None;
                }
                Err(e)
            },
            Err(_) => Err(ModbusError::Timeout(self.spec.timeout.as_millis() as u64)),
        }
    }

    /// Release the transport. Returns `false` if it was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closing.cancel();

        let mut guard = self.transport.lock().await;
        if guard.take().is_some() {
            debug!("Slave {} transport released", self.spec.slave_id);
        }
        info!("Slave {} closed", self.spec.slave_id);
        true
    }
}

/// Immutable map from slave id to its backend connection
#[derive(Debug, Default)]
pub struct RoutingTable {
    connections: HashMap<u8, Arc<BackendConnection>>,
}

impl RoutingTable {
    /// Open every configured backend; the first failure is fatal
    pub async fn initialize(servers: &BTreeMap<u8, ServerSpec>) -> ServiceResult<Self> {
        let mut connections = HashMap::with_capacity(servers.len());

        for (slave_id, spec) in servers {
            info!(
                "Initializing slave {} ({} {})",
                slave_id,
                spec.conn_type(),
                spec.transport
            );
            match BackendConnection::open(spec.clone()).await {
                Ok(conn) => {
                    connections.insert(*slave_id, Arc::new(conn));
                },
                Err(e) => {
                    let partial = Self { connections };
                    partial.close_all().await;
                    return Err(ServiceError::BackendInit {
                        slave_id: *slave_id,
                        reason: e.to_string(),
                    });
                },
            }
        }

        let table = Self { connections };
        info!("Routing table ready: slaves {:?}", table.slave_ids());
        Ok(table)
    }

    pub fn from_connections(connections: impl IntoIterator<Item = BackendConnection>) -> Self {
        Self {
            connections: connections
                .into_iter()
                .map(|c| (c.slave_id(), Arc::new(c)))
                .collect(),
        }
    }

    pub fn lookup(&self, slave_id: u8) -> Result<&Arc<BackendConnection>, RequestError> {
        self.connections
            .get(&slave_id)
            .ok_or(RequestError::UnknownSlave(slave_id))
    }

    pub async fn dispatch(&self, slave_id: u8, request: &Request) -> Result<Response, RequestError> {
        let conn = self.lookup(slave_id)?;
        Ok(conn.call(request).await?)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Arc<BackendConnection>> {
        self.connections.values()
    }

    /// Sorted slave ids
    pub fn slave_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn close_all(&self) {
        for conn in self.connections.values() {
            conn.close().await;
        }
    }
}
