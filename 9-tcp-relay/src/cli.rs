use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:11005")]
    pub listen: SocketAddr,

    /// Directory where received files are stored.
    #[arg(long, default_value = ".")]
    pub download_dir: PathBuf,

    /// Close connections and transfers that stay silent this long. 0 disables the timeout.
    #[arg(long, default_value_t = 0)]
    pub idle_timeout_secs: u64,

    /// Maximum number of concurrent client connections.
    #[arg(long, default_value_t = 1024)]
    pub max_connections: usize,

    /// Maximum number of file transfers running at once; extra transfers wait.
    #[arg(long, default_value_t = 64)]
    pub max_relays: usize,

    /// Frames buffered per client before further messages to it are dropped.
    #[arg(long, default_value_t = 256)]
    pub queue_capacity: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username to register with the server.
    #[arg(long)]
    pub username: String,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:11005")]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let cli = Cli::parse_from(["tcp-relay", "server"]);
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(args.listen, "0.0.0.0:11005".parse().expect("addr"));
        assert_eq!(args.idle_timeout_secs, 0);
        assert_eq!(args.max_relays, 64);
    }

    #[test]
    fn client_requires_username() {
        assert!(Cli::try_parse_from(["tcp-relay", "client"]).is_err());
        let cli = Cli::parse_from(["tcp-relay", "client", "--username", "alice"]);
        assert!(matches!(cli.command, Command::Client(ClientArgs { ref username, .. }) if username == "alice"));
    }
}
