use std::{fmt, io, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::CommandError;

pub const DEFAULT_PORT: u16 = 11005;

/// Upper bound for any frame, file chunks included.
pub const MAX_FRAME_LEN: usize = 24 * 1024 * 1024;

/// Frame limit while a connection is not inside a file transfer. Anything
/// larger fails the read before its payload is buffered.
pub const MAX_CONTROL_FRAME_LEN: usize = 64 * 1024;

/// Upper bound for a text command outside of a file transfer.
pub const MAX_COMMAND_LEN: usize = 1024;

pub const MAX_USERNAME_LEN: usize = 32;

/// Legacy end-of-file marker. A zero-length frame ends a transfer as well.
pub const TRANSFER_COMPLETE: &[u8] = b"FILE_TRANSFER_COMPLETE";

pub const FILE_USAGE: &str = "file:<recipient>:<filename>";
pub const UNICAST_USAGE: &str = "unicast:<recipient>:<message>";
pub const MULTICAST_USAGE: &str = "multicast:<recipient>[,<recipient>...]:<message>";

pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;
pub type FrameWriter<W> = FramedWrite<W, LengthDelimitedCodec>;

/// 4-byte big-endian length prefix followed by the payload.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub fn frame_reader<R: AsyncRead>(reader: R) -> FrameReader<R> {
    FramedRead::new(reader, codec())
}

pub fn frame_writer<W: AsyncWrite>(writer: W) -> FrameWriter<W> {
    FramedWrite::new(writer, codec())
}

/// Caps the payload size the reader will accept for its next frames.
pub fn set_frame_limit<R>(reader: &mut FrameReader<R>, limit: usize) {
    reader.decoder_mut().set_max_frame_length(limit);
}

/// Reads the next frame, returning `None` once the peer has closed the stream.
pub async fn read_frame<R>(reader: &mut FrameReader<R>) -> io::Result<Option<BytesMut>>
where
    R: AsyncRead + Unpin,
{
    reader.next().await.transpose()
}

/// Result of waiting for the next inbound frame.
#[derive(Debug)]
pub enum Inbound {
    Frame(BytesMut),
    Closed,
    TimedOut,
    Failed(io::Error),
}

/// Waits for the next frame, giving up after `idle` if one is set.
pub async fn next_inbound<S>(frames: &mut S, idle: Option<Duration>) -> Inbound
where
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    let next = match idle {
        Some(limit) => match tokio::time::timeout(limit, frames.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::TimedOut,
        },
        None => frames.next().await,
    };

    match next {
        Some(Ok(frame)) => Inbound::Frame(frame),
        Some(Err(err)) => Inbound::Failed(err),
        None => Inbound::Closed,
    }
}

pub async fn write_frame<W>(writer: &mut FrameWriter<W>, payload: impl Into<Bytes>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.send(payload.into()).await
}

/// Everything the server says to a client. Each value is sent as one text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerToClient {
    Welcome,
    NameTaken,
    InvalidUsername,
    ServerFull,
    ShuttingDown,
    Unicast { from: String, text: String },
    Multicast { from: String, text: String },
    Broadcast { from: String, text: String },
    UserNotFound { username: String },
    FileOffer { from: String, filename: String },
    FileReceived { filename: String },
    TransferComplete,
    Malformed { usage: &'static str },
    CommandTooLong,
}

impl ServerToClient {
    pub fn encode(&self) -> Bytes {
        match self {
            ServerToClient::TransferComplete => Bytes::from_static(TRANSFER_COMPLETE),
            other => Bytes::from(other.to_string()),
        }
    }
}

impl fmt::Display for ServerToClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerToClient::Welcome => f.write_str("Welcome to the chat server!"),
            ServerToClient::NameTaken => f.write_str("Username already taken. Disconnecting."),
            ServerToClient::InvalidUsername => f.write_str("Invalid username."),
            ServerToClient::ServerFull => f.write_str("Server is full."),
            ServerToClient::ShuttingDown => f.write_str("Server shutting down."),
            ServerToClient::Unicast { from, text } => write!(f, "Unicast from {from}: {text}"),
            ServerToClient::Multicast { from, text } => write!(f, "Multicast from {from}: {text}"),
            ServerToClient::Broadcast { from, text } => write!(f, "Broadcast from {from}: {text}"),
            ServerToClient::UserNotFound { username } => write!(f, "User {username} not found."),
            ServerToClient::FileOffer { from, filename } => write!(f, "file:{from}:{filename}"),
            ServerToClient::FileReceived { filename } => write!(f, "Received file: {filename}"),
            ServerToClient::TransferComplete => f.write_str("FILE_TRANSFER_COMPLETE"),
            ServerToClient::Malformed { usage } => write!(f, "Malformed command: expected {usage}"),
            ServerToClient::CommandTooLong => f.write_str("Command too long."),
        }
    }
}

impl CommandError {
    /// The text sent back to the client that caused the error, if any.
    pub fn reply(&self) -> Option<ServerToClient> {
        match self {
            CommandError::Malformed { usage } => Some(ServerToClient::Malformed { usage: *usage }),
            CommandError::TooLong { .. } => Some(ServerToClient::CommandTooLong),
            CommandError::InvalidUsername => Some(ServerToClient::InvalidUsername),
            CommandError::NotText => None,
        }
    }
}

/// A parsed control frame.
///
/// Only the first two colons are significant; anything after them, colons
/// included, belongs to the last field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    File { recipient: &'a str, filename: &'a str },
    Unicast { recipient: &'a str, message: &'a str },
    Multicast { recipients: Vec<&'a str>, message: &'a str },
    Broadcast { message: &'a str },
    /// Text without a known prefix; relayed like a broadcast.
    Chat { text: &'a str },
}

impl<'a> Command<'a> {
    pub fn decode(frame: &'a [u8]) -> Result<Self, CommandError> {
        if frame.len() > MAX_COMMAND_LEN {
            return Err(CommandError::TooLong {
                len: frame.len(),
                max: MAX_COMMAND_LEN,
            });
        }
        let text = std::str::from_utf8(frame).map_err(|_| CommandError::NotText)?;
        Self::parse(text)
    }

    pub fn parse(text: &'a str) -> Result<Self, CommandError> {
        let Some((prefix, rest)) = text.split_once(':') else {
            return Ok(Command::Chat { text });
        };

        match prefix {
            "file" => {
                let (recipient, filename) = split_fields(rest, FILE_USAGE)?;
                if filename.is_empty() {
                    return Err(CommandError::Malformed { usage: FILE_USAGE });
                }
                Ok(Command::File {
                    recipient,
                    filename,
                })
            }
            "unicast" => {
                let (recipient, message) = split_fields(rest, UNICAST_USAGE)?;
                Ok(Command::Unicast { recipient, message })
            }
            "multicast" => {
                let (list, message) = rest
                    .split_once(':')
                    .ok_or(CommandError::Malformed {
                        usage: MULTICAST_USAGE,
                    })?;
                let mut recipients: Vec<&str> = Vec::new();
                for name in list.split(',').map(str::trim) {
                    if !name.is_empty() && !recipients.contains(&name) {
                        recipients.push(name);
                    }
                }
                if recipients.is_empty() {
                    return Err(CommandError::Malformed {
                        usage: MULTICAST_USAGE,
                    });
                }
                Ok(Command::Multicast {
                    recipients,
                    message,
                })
            }
            "broadcast" => Ok(Command::Broadcast { message: rest }),
            _ => Ok(Command::Chat { text }),
        }
    }
}

fn split_fields<'a>(rest: &'a str, usage: &'static str) -> Result<(&'a str, &'a str), CommandError> {
    match rest.split_once(':') {
        Some((recipient, tail)) if !recipient.trim().is_empty() => Ok((recipient.trim(), tail)),
        _ => Err(CommandError::Malformed { usage }),
    }
}

/// Validates the handshake frame and returns the username it carries.
pub fn parse_username(frame: &[u8]) -> Result<String, CommandError> {
    let text = std::str::from_utf8(frame).map_err(|_| CommandError::InvalidUsername)?;
    let name = text.trim();
    let usable = !name.is_empty()
        && name.len() <= MAX_USERNAME_LEN
        && !name
            .chars()
            .any(|c| c == ':' || c == ',' || c.is_whitespace() || c.is_control());
    if usable {
        Ok(name.to_string())
    } else {
        Err(CommandError::InvalidUsername)
    }
}

/// Server-side file name for an uploaded file: directory components are
/// dropped and the result is prefixed so it cannot shadow a client path.
pub fn stored_file_name(requested: &str) -> String {
    let base = requested.rsplit(['/', '\\']).next().unwrap_or("").trim();
    let base = match base {
        "" | "." | ".." => "unnamed",
        other => other,
    };
    format!("received_{base}")
}

/// True for frames that end a file transfer.
pub fn is_transfer_terminator(frame: &[u8]) -> bool {
    frame.is_empty() || frame == TRANSFER_COMPLETE
}
