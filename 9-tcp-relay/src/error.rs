//! Error types shared by the relay components.

use thiserror::Error;

/// Failures returned by [`crate::registry::SessionRegistry`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Another live session already owns the username.
    #[error("username '{0}' is already taken")]
    NameTaken(String),
}

/// Problems with a client frame that are reported back to that client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// A known command prefix without the fields it needs.
    #[error("malformed command, expected {usage}")]
    Malformed { usage: &'static str },

    /// Control frame larger than [`crate::protocol::MAX_COMMAND_LEN`].
    #[error("command of {len} bytes exceeds the {max} byte limit")]
    TooLong { len: usize, max: usize },

    /// Payload was not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    NotText,

    /// Handshake name that cannot be used as an address.
    #[error("invalid username")]
    InvalidUsername,
}

/// Why a frame could not be queued for a session.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The session's outbound queue is at capacity; the frame was dropped.
    #[error("outbound queue is full")]
    Full,

    /// The session's writer has gone away.
    #[error("session is closed")]
    Closed,
}
