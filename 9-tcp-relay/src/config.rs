use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::{cli::ServerArgs, protocol::DEFAULT_PORT};

/// Runtime settings for [`crate::server::Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub download_dir: PathBuf,
    /// `None` lets reads block indefinitely.
    pub idle_timeout: Option<Duration>,
    pub max_connections: usize,
    pub max_relays: usize,
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            download_dir: PathBuf::from("."),
            idle_timeout: None,
            max_connections: 1024,
            max_relays: 64,
            outbound_capacity: 256,
        }
    }
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            listen: args.listen,
            download_dir: args.download_dir,
            idle_timeout: (args.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(args.idle_timeout_secs)),
            max_connections: args.max_connections,
            max_relays: args.max_relays,
            outbound_capacity: args.queue_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Command};

    fn server_config(argv: &[&str]) -> ServerConfig {
        let cli = Cli::parse_from(argv);
        match cli.command {
            Command::Server(args) => args.into(),
            Command::Client(_) => panic!("expected server args"),
        }
    }

    #[test]
    fn zero_idle_timeout_disables_it() {
        let config = server_config(&["tcp-relay", "server"]);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.listen, ServerConfig::default().listen);
    }

    #[test]
    fn flags_map_onto_config() {
        let config = server_config(&[
            "tcp-relay",
            "server",
            "--listen",
            "127.0.0.1:0",
            "--download-dir",
            "/tmp/inbox",
            "--idle-timeout-secs",
            "30",
            "--max-connections",
            "8",
            "--queue-capacity",
            "4",
        ]);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.download_dir, PathBuf::from("/tmp/inbox"));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.outbound_capacity, 4);
    }
}
