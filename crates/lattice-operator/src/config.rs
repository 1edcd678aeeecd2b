//! Operator configuration
//!
//! Every flag has an environment fallback so the operator can be configured
//! from a Deployment manifest without touching its arguments.

use std::time::Duration;

use clap::Args;

use lattice_backup::{ControllerConfig, RegistryConfig};
use lattice_common::telemetry::{LogFormat, TelemetryConfig};
use lattice_common::REQUEUE_SUCCESS_SECS;

/// Default bound on a single remote wipe, in seconds
pub const DEFAULT_WIPE_TIMEOUT_SECS: u64 = 300;

/// Settings shared by every operator mode
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Upper bound on a single remote wipe call, in seconds
    #[arg(
        long,
        env = "LATTICE_WIPE_TIMEOUT_SECS",
        default_value_t = DEFAULT_WIPE_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub wipe_timeout_secs: u64,

    /// Requeue interval after a successful reconcile, in seconds
    #[arg(
        long,
        env = "LATTICE_REQUEUE_SECS",
        default_value_t = REQUEUE_SUCCESS_SECS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub requeue_secs: u64,

    /// Only watch BackupStorages and Repositories in this namespace
    #[arg(long, env = "LATTICE_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Log output format (json or text)
    #[arg(long, env = "LATTICE_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    /// Registry tuning derived from the flags
    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            wipe_timeout: Duration::from_secs(self.wipe_timeout_secs),
        }
    }

    /// Controller tuning derived from the flags
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            requeue: Duration::from_secs(self.requeue_secs),
            watch_namespace: self
                .watch_namespace
                .as_deref()
                .map(str::trim)
                .filter(|ns| !ns.is_empty())
                .map(str::to_string),
        }
    }

    /// Logging setup derived from the flags
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            format: self.log_format,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        config: OperatorConfig,
    }

    fn parse(args: &[&str]) -> Result<OperatorConfig, clap::Error> {
        TestCli::try_parse_from(std::iter::once("lattice").chain(args.iter().copied()))
            .map(|cli| cli.config)
    }

    #[test]
    fn test_defaults_match_library_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.registry(), RegistryConfig::default());
        assert_eq!(config.controller(), ControllerConfig::default());
        assert_eq!(config.telemetry().format, LogFormat::Json);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = parse(&[
            "--wipe-timeout-secs",
            "60",
            "--requeue-secs",
            "120",
            "--watch-namespace",
            "backups",
            "--log-format",
            "text",
        ])
        .unwrap();

        assert_eq!(config.registry().wipe_timeout, Duration::from_secs(60));
        assert_eq!(config.controller().requeue, Duration::from_secs(120));
        assert_eq!(
            config.controller().watch_namespace.as_deref(),
            Some("backups")
        );
        assert_eq!(config.telemetry().format, LogFormat::Text);
    }

    #[test]
    fn test_rejects_zero_and_unknown_values() {
        assert!(parse(&["--wipe-timeout-secs", "0"]).is_err());
        assert!(parse(&["--requeue-secs", "0"]).is_err());
        assert!(parse(&["--log-format", "xml"]).is_err());
    }

    #[test]
    fn test_blank_watch_namespace_means_all() {
        let config = parse(&["--watch-namespace", " "]).unwrap();
        assert_eq!(config.controller().watch_namespace, None);
    }
}
