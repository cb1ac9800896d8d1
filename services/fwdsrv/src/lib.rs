//! Modbus forwarding gateway library
//!
//! ```text
//! client ──TCP──► ingress ──► handler ──► routing table ──► BackendConnection ──TCP/RTU──► slave
//!                                              ▲
//!                                     health monitor (periodic probe)
//! ```
//!
//! - [`config`]: YAML + environment configuration, validation and defaults
//! - [`routing`]: per-slave backend connections behind a mutual-exclusion gate
//! - [`handler`]: request decoding, forwarding and exception mapping
//! - [`ingress`]: Modbus-TCP listener, one task per client
//! - [`monitor`]: periodic health probes, transition logging
//! - [`gateway`]: start/stop lifecycle

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod ingress;
pub mod monitor;
pub mod routing;

pub use config::{GatewayConfig, ServerSpec};
pub use error::RequestError;
pub use gateway::Gateway;
pub use handler::RequestHandler;
pub use monitor::{HealthMonitor, HealthTransition};
pub use routing::{BackendConnection, HealthSnapshot, ProbeStatus, RoutingTable};
