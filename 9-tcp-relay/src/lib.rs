//! TCP relay for named clients: direct, group and broadcast text messages,
//! plus file uploads relayed through the server.
//!
//! Every message on the wire is a length-delimited frame (4-byte big-endian
//! length, then the payload). After the handshake frame carrying the
//! username, clients send colon-delimited text commands such as
//! `unicast:bob:hi` or `file:bob:notes.txt`; the frames that follow a `file`
//! command are file data, ended by an empty frame.
//!
//! - [`cli`] and [`config`] parse the command line into a [`config::ServerConfig`].
//! - [`server`] accepts connections, applies the connection limit and owns
//!   shutdown.
//! - [`connection`] runs the per-connection state machine.
//! - [`registry`] tracks who is online and owns each session's outbound queue.
//! - [`router`] interprets commands and fans messages out.
//! - [`relay`] streams file uploads to disk.
//! - [`protocol`] holds the framing, command grammar and server texts.
//! - [`client`] is the interactive terminal client.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
