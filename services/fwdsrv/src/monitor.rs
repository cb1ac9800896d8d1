//! Periodic backend health probing
//!
//! Each tick issues a one-register holding read at address 1 to every slave
//! through the normal call path. Only changes are logged: the first failure,
//! a different error on an already failing slave, and recovery.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use modbus_core::Request;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::routing::{BackendConnection, ProbeStatus, RoutingTable};

pub const PROBE_ADDRESS: u16 = 1;

/// A logged change in a slave's probe outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthTransition {
    Failing { slave_id: u8, error: String },
    ErrorChanged { slave_id: u8, error: String },
    Restored { slave_id: u8 },
}

pub struct HealthMonitor {
    routing: Arc<RoutingTable>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(routing: Arc<RoutingTable>, interval: Duration) -> Self {
        Self { routing, interval }
    }

    /// Probe on every tick until `shutdown` fires; the first probe runs one
    /// interval after start.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Health monitor every {:?}", self.interval);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_once().await;
                },
            }
        }
        debug!("Health monitor stopped");
    }

    /// Probe every slave concurrently and return the transitions logged
    pub async fn check_once(&self) -> Vec<HealthTransition> {
        let probes = self.routing.connections().map(|conn| probe(conn.as_ref()));
        join_all(probes).await.into_iter().flatten().collect()
    }
}

async fn probe(conn: &BackendConnection) -> Option<HealthTransition> {
    let request = Request::ReadHoldingRegisters {
        address: PROBE_ADDRESS,
        quantity: 1,
    };
    let status = match conn.call(&request).await {
        Ok(_) => ProbeStatus::Healthy,
        Err(e) => ProbeStatus::Failing(e.to_string()),
    };

    let slave_id = conn.slave_id();
    let previous = conn.replace_probe_status(status.clone());
    let transition = match (previous, status) {
        (ProbeStatus::Failing(_), ProbeStatus::Healthy) => {
            Some(HealthTransition::Restored { slave_id })
        },
        (ProbeStatus::Failing(old), ProbeStatus::Failing(error)) if old != error => {
            Some(HealthTransition::ErrorChanged { slave_id, error })
        },
        (ProbeStatus::Unknown | ProbeStatus::Healthy, ProbeStatus::Failing(error)) => {
            Some(HealthTransition::Failing { slave_id, error })
        },
        _ => None,
    };

    match &transition {
        Some(HealthTransition::Failing { error, .. })
        | Some(HealthTransition::ErrorChanged { error, .. }) => {
            warn!(
                "Slave {} ({}) health check failed: {}",
                slave_id,
                conn.conn_type(),
                error
            );
        },
        Some(HealthTransition::Restored { .. }) => {
            info!(
                "Slave {} ({}) connection restored",
                slave_id,
                conn.conn_type()
            );
        },
        None => {},
    }
    transition
}
