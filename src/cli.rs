//! CLI for this application
//!
use crate::error::Result;
use crate::settings;

#[derive(Clone, Debug, clap::Parser)]
#[clap(name = settings::APP_NAME, version = settings::APP_VERSION)]
pub struct Cli {
    // Server listen address
    #[clap(
        long,
        default_value = "0.0.0.0",
        env("MEMBERLINK_LISTEN_ADDRESS"),
        help = "IP Address to listen on"
    )]
    pub listen_address: String,

    // TCP listen port for gossip
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_GOSSIP,
        env("MEMBERLINK_GOSSIP_PORT"),
        help = "Port to bind the gossip channel server to"
    )]
    pub gossip_port: u16,

    // TCP listen port for data
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_DATA,
        env("MEMBERLINK_DATA_PORT"),
        help = "Port to bind the data channel server to"
    )]
    pub data_port: u16,

    // Accept queue depth
    #[clap(
        long,
        default_value = "128",
        env("MEMBERLINK_BACKLOG"),
        help = "Listen backlog for both channel servers"
    )]
    pub backlog: u32,

    // SO_KEEPALIVE on accepted connections
    #[clap(
        long,
        default_value = "true",
        env("MEMBERLINK_KEEPALIVE"),
        action = clap::ArgAction::Set,
        help = "Enable TCP keep-alive on accepted connections"
    )]
    pub keepalive: bool,

    // Worker threads per channel
    #[clap(
        long,
        default_value = "2",
        env("MEMBERLINK_WORKER_THREADS"),
        help = "Connection worker threads per channel"
    )]
    pub worker_threads: usize,

    // Graceful shutdown bound
    #[clap(
        long,
        default_value = "5000",
        env("MEMBERLINK_SHUTDOWN_TIMEOUT_MS"),
        help = "Milliseconds to wait for connections to drain before force-closing"
    )]
    pub shutdown_timeout_ms: u64,

    // Log format
    #[clap(
        long,
        env("MEMBERLINK_LOG_JSON"),
        help = "Emit logs as JSON lines"
    )]
    pub log_json: bool,
}

impl Cli {
    pub fn into_settings(self) -> Result<settings::Settings> {
        let settings = settings::Settings {
            listen_address: self.listen_address,
            gossip_port: self.gossip_port,
            data_port: self.data_port,
            backlog: self.backlog,
            keepalive: self.keepalive,
            acceptor_threads: settings::DEFAULT_ACCEPTOR_THREADS,
            worker_threads: self.worker_threads,
            shutdown_timeout_ms: self.shutdown_timeout_ms,
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_defaults_parse() {
        let cli = Cli::parse_from(["memberlink"]);
        let settings = cli.into_settings().unwrap();
        assert_eq!(settings.gossip_port, settings::STANDARD_PORT_GOSSIP);
        assert_eq!(settings.data_port, settings::STANDARD_PORT_DATA);
        assert_eq!(settings.backlog, settings::DEFAULT_BACKLOG);
        assert!(settings.keepalive);
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "memberlink",
            "--listen-address",
            "127.0.0.1",
            "--gossip-port",
            "7100",
            "--data-port",
            "7101",
            "--keepalive",
            "false",
            "--worker-threads",
            "4",
        ]);
        let settings = cli.into_settings().unwrap();
        assert_eq!(settings.listen_address, "127.0.0.1");
        assert_eq!(settings.gossip_port, 7100);
        assert_eq!(settings.data_port, 7101);
        assert!(!settings.keepalive);
        assert_eq!(settings.worker_threads, 4);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let cli = Cli::parse_from(["memberlink", "--gossip-port", "7100", "--data-port", "7100"]);
        assert!(cli.into_settings().is_err());
    }
}
