//! Gateway configuration
//!
//! YAML file merged with `FWDSRV_` environment overrides, then validated into
//! [`GatewayConfig`]. Missing optional fields take the Modbus defaults below.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use errors::{ServiceError, ServiceResult};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use modbus_core::{ConnType, Parity, SerialSettings, TransportConfig};
use serde::Deserialize;

pub const DEFAULT_LISTEN_PORT: u16 = 1602;
pub const DEFAULT_TCP_PORT: u16 = 502;
pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_DATA_BITS: u8 = 8;
pub const DEFAULT_STOP_BITS: u8 = 1;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// One configured backend slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub slave_id: u8,
    pub transport: TransportConfig,
    pub timeout: Duration,
}

impl ServerSpec {
    pub fn tcp(slave_id: u8, host: impl Into<String>, port: u16) -> Self {
        Self {
            slave_id,
            transport: TransportConfig::Tcp {
                host: host.into(),
                port,
            },
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn rtu(slave_id: u8, settings: SerialSettings) -> Self {
        Self {
            slave_id,
            transport: TransportConfig::Rtu(settings),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn conn_type(&self) -> ConnType {
        self.transport.conn_type()
    }
}

/// Validated gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// TCP port for Modbus-TCP clients; 0 binds an ephemeral port
    pub listen_port: u16,
    pub health_check_interval: Duration,
    pub servers: BTreeMap<u8, ServerSpec>,
}

impl GatewayConfig {
    pub fn new(servers: impl IntoIterator<Item = ServerSpec>) -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            servers: servers.into_iter().map(|s| (s.slave_id, s)).collect(),
        }
    }

    /// Load from a YAML file plus `FWDSRV_*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> ServiceResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ServiceError::ConfigNotFound(path.display().to_string()));
        }

        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("FWDSRV_").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> ServiceResult<Self> {
        let raw: RawConfig = figment
            .extract()
            .map_err(|e| ServiceError::Configuration(format!("Failed to parse config: {}", e)))?;
        raw.validate()
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    listen_port: Option<u16>,
    #[serde(default)]
    health_check_interval: Option<u64>,
    #[serde(default)]
    servers: BTreeMap<String, RawServer>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    conn_type: Option<String>,
    slave_id: Option<u16>,
    addr: Option<String>,
    port: Option<u16>,
    baud_rate: Option<u32>,
    data_bits: Option<u8>,
    stop_bits: Option<u8>,
    parity: Option<String>,
    timeout: Option<u64>,
}

impl RawConfig {
    fn validate(self) -> ServiceResult<GatewayConfig> {
        let listen_port = match self.listen_port {
            None | Some(0) => DEFAULT_LISTEN_PORT,
            Some(port) => port,
        };

        let health_check_interval = match self.health_check_interval {
            None => DEFAULT_HEALTH_CHECK_INTERVAL,
            Some(0) => {
                return Err(ServiceError::invalid(
                    "health_check_interval",
                    "must be at least 1 second",
                ))
            },
            Some(secs) => Duration::from_secs(secs),
        };

        if self.servers.is_empty() {
            return Err(ServiceError::Configuration(
                "no servers configured".to_string(),
            ));
        }

        let mut servers = BTreeMap::new();
        for (key, raw) in self.servers {
            let spec = raw.validate(&key)?;
            if servers.insert(spec.slave_id, spec).is_some() {
                return Err(ServiceError::invalid(
                    format!("servers.{}", key),
                    "duplicate slave_id",
                ));
            }
        }

        Ok(GatewayConfig {
            listen_port,
            health_check_interval,
            servers,
        })
    }
}

fn parse_slave_id(key: &str) -> ServiceResult<u8> {
    let id: u16 = key.trim().parse().map_err(|_| {
        ServiceError::invalid(format!("servers.{}", key), "slave_id must be an integer")
    })?;
    if !(1..=255).contains(&id) {
        return Err(ServiceError::invalid(
            format!("servers.{}", key),
            format!("invalid slave_id {}: must be between 1-255", id),
        ));
    }
    Ok(id as u8)
}

impl RawServer {
    fn validate(self, key: &str) -> ServiceResult<ServerSpec> {
        let slave_id = parse_slave_id(key)?;
        let field = |name: &str| format!("servers.{}.{}", slave_id, name);

        if let Some(declared) = self.slave_id {
            if declared != u16::from(slave_id) {
                return Err(ServiceError::invalid(
                    field("slave_id"),
                    format!("{} does not match map key {}", declared, slave_id),
                ));
            }
        }

        let conn_type = self
            .conn_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServiceError::invalid(field("conn_type"), "conn_type is required"))?;

        let addr = self
            .addr
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());

        let transport = match conn_type.to_ascii_lowercase().as_str() {
            "tcp" => {
                let host = addr.ok_or_else(|| {
                    ServiceError::invalid(field("addr"), "addr is required for TCP connection")
                })?;
                TransportConfig::Tcp {
                    host,
                    port: match self.port {
                        None | Some(0) => DEFAULT_TCP_PORT,
                        Some(port) => port,
                    },
                }
            },
            "rtu" => {
                let device = addr.ok_or_else(|| {
                    ServiceError::invalid(field("addr"), "addr is required for RTU connection")
                })?;
                let data_bits = match self.data_bits {
                    None | Some(0) => DEFAULT_DATA_BITS,
                    Some(bits @ 5..=8) => bits,
                    Some(bits) => {
                        return Err(ServiceError::invalid(
                            field("data_bits"),
                            format!("{} not in 5..=8", bits),
                        ))
                    },
                };
                let stop_bits = match self.stop_bits {
                    None | Some(0) => DEFAULT_STOP_BITS,
                    Some(bits @ 1..=2) => bits,
                    Some(bits) => {
                        return Err(ServiceError::invalid(
                            field("stop_bits"),
                            format!("{} not in 1..=2", bits),
                        ))
                    },
                };
                let parity = match self.parity.as_deref().map(str::trim) {
                    None | Some("") => Parity::None,
                    Some(p) => p
                        .parse()
                        .map_err(|e| ServiceError::invalid(field("parity"), format!("{}", e)))?,
                };
                TransportConfig::Rtu(SerialSettings {
                    device,
                    baud_rate: match self.baud_rate {
                        None | Some(0) => DEFAULT_BAUD_RATE,
                        Some(baud) => baud,
                    },
                    data_bits,
                    stop_bits,
                    parity,
                })
            },
            other => {
                return Err(ServiceError::invalid(
                    field("conn_type"),
                    format!("invalid conn_type {}, must be 'tcp' or 'rtu'", other),
                ))
            },
        };

        let timeout = match self.timeout {
            None | Some(0) => DEFAULT_TIMEOUT,
            Some(secs) => Duration::from_secs(secs),
        };

        Ok(ServerSpec {
            slave_id,
            transport,
            timeout,
        })
    }
}
