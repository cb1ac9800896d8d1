//! Modbus forwarding gateway (fwdsrv)
//!
//! Accepts Modbus-TCP clients and forwards each request to the backend slave
//! named by its unit identifier, over Modbus-TCP or Modbus-RTU.

use clap::Parser;
use tracing::{error, info};

use errors::ServiceResult;
use fwdsrv::{
    bootstrap::{self, Args},
    Gateway, GatewayConfig,
};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let guard = match bootstrap::initialize_logging(&args) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("fwdsrv: {}", e);
            std::process::exit(e.exit_code());
        },
    };

    let code = match run(&args).await {
        Ok(()) => 0,
        Err(e) => {
            error!("Fatal: {}", e);
            e.exit_code()
        },
    };

    // Flush the file writer before exiting
    drop(guard);
    std::process::exit(code);
}

async fn run(args: &Args) -> ServiceResult<()> {
    info!("Loading configuration: {}", args.config.display());
    let config = GatewayConfig::load(&args.config)?;
    bootstrap::log_config_summary(&config);

    if args.service.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    let gateway = Gateway::start(&config).await?;

    let signal = common::wait_for_shutdown().await;
    info!("{} received, shutting down", signal);

    gateway.stop().await;
    Ok(())
}
