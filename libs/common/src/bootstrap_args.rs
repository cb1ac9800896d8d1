//! Common command-line arguments for gateway services
//!
//! Services flatten [`ServiceArgs`] into their own clap parser.

use std::path::PathBuf;

use clap::Args;

use crate::logging::LogConfig;

/// Common service startup arguments
#[derive(Debug, Clone, Args)]
pub struct ServiceArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Directory for the daily log file (console only when omitted)
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Disable colored output (useful for log files)
    #[arg(long)]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

impl Default for ServiceArgs {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            no_color: false,
            validate: false,
        }
    }
}

impl ServiceArgs {
    pub fn log_config(&self, service_name: &str) -> LogConfig {
        LogConfig {
            service_name: service_name.to_string(),
            level: self.log_level.clone(),
            log_dir: self.log_dir.clone(),
            ansi: !self.no_color,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = ServiceArgs::default();
        assert_eq!(args.log_level, "info");
        assert!(!args.no_color);
        assert!(!args.validate);
    }

    #[test]
    fn test_log_config() {
        let args = ServiceArgs {
            no_color: true,
            log_dir: Some(PathBuf::from("/var/log/fwdsrv")),
            ..Default::default()
        };
        let config = args.log_config("fwdsrv");
        assert_eq!(config.service_name, "fwdsrv");
        assert!(!config.ansi);
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/fwdsrv")));
    }
}
