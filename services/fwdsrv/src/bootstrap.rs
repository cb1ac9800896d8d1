//! Service bootstrap: arguments, logging and configuration validation

use std::path::PathBuf;

use clap::Parser;
use common::{LogGuard, ServiceArgs};
use errors::ServiceResult;
use tracing::info;

use crate::config::GatewayConfig;

pub const SERVICE_NAME: &str = "fwdsrv";

/// Command-line arguments for fwdsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fwdsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus-TCP to Modbus TCP/RTU forwarding gateway",
    long_about = None
)]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(
        short = 'c',
        long,
        default_value = "config/fwdsrv.yaml",
        env = "FWDSRV_CONFIG"
    )]
    pub config: PathBuf,

    #[command(flatten)]
    pub service: ServiceArgs,
}

pub fn initialize_logging(args: &Args) -> ServiceResult<LogGuard> {
    common::init_logging(&args.service.log_config(SERVICE_NAME))
}

/// Print what the gateway would serve, without opening any backend
pub fn log_config_summary(config: &GatewayConfig) {
    info!(
        "Config: listen_port={}, health_check_interval={:?}, {} slaves",
        config.listen_port,
        config.health_check_interval,
        config.servers.len()
    );
    for spec in config.servers.values() {
        info!(
            "  slave {}: {} {} timeout={:?}",
            spec.slave_id,
            spec.conn_type(),
            spec.transport,
            spec.timeout
        );
    }
}
