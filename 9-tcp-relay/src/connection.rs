//! Per-connection state machine.
//!
//! ```text
//! Connecting -> Handshaking -> Active -> Closing -> Closed
//!                    |                      ^
//!                    +----- rejected -------+
//! ```
//!
//! A connection is split into a reader, owned by the session loop (or, during
//! a file transfer, by the relay task), and a writer task that drains the
//! session's outbound queue. Cleanup always runs once, after the session loop
//! has finished for whatever reason. The writer keeps accepting frames until
//! cleanup closes it, so a relay interrupted by shutdown can still queue its
//! acknowledgment.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::SinkExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, tcp::OwnedReadHalf},
    select,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    config::ServerConfig,
    error::RegistryError,
    protocol::{
        FrameReader, FrameWriter, Inbound, MAX_CONTROL_FRAME_LEN, MAX_FRAME_LEN, ServerToClient,
        frame_reader, frame_writer, next_inbound, parse_username, set_frame_limit, write_frame,
    },
    registry::{Outbox, SessionHandle, SessionRegistry, outbound_queue},
    relay::FileRelay,
    router::{Dispatch, MessageRouter},
};

/// How long a closing connection may spend flushing queued frames.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    ReadFailed,
    TimedOut,
    Cancelled,
    /// Handshake refused: taken or unusable username.
    Rejected,
    /// A file transfer ended without its terminator.
    TransferAborted,
    Panicked,
}

pub struct ConnectionHandler {
    registry: Arc<SessionRegistry>,
    router: MessageRouter,
    relay: Arc<FileRelay>,
    idle_timeout: Option<Duration>,
    outbound_capacity: usize,
}

impl ConnectionHandler {
    pub fn new(registry: Arc<SessionRegistry>, config: &ServerConfig) -> Self {
        let relay = FileRelay::new(
            Arc::clone(&registry),
            config.download_dir.clone(),
            config.idle_timeout,
            config.max_relays,
        );
        Self {
            router: MessageRouter::new(Arc::clone(&registry)),
            registry,
            relay: Arc::new(relay),
            idle_timeout: config.idle_timeout,
            outbound_capacity: config.outbound_capacity,
        }
    }

    /// Drives one accepted connection until it is closed.
    pub async fn handle(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> CloseReason {
        let mut state = ConnectionState::Connecting;
        let (reader, writer) = stream.into_split();
        let mut reader = frame_reader(reader);
        set_frame_limit(&mut reader, MAX_CONTROL_FRAME_LEN);
        let mut writer = frame_writer(writer);

        transition(&mut state, ConnectionState::Handshaking, peer);
        let (session, outbox) = match self.handshake(&mut reader, &mut writer, &cancel).await {
            Ok(accepted) => accepted,
            Err(reason) => {
                transition(&mut state, ConnectionState::Closing, peer);
                if let Err(err) = SinkExt::<Bytes>::close(&mut writer).await {
                    trace!(%peer, error = %err, "failed to close rejected connection");
                }
                transition(&mut state, ConnectionState::Closed, peer);
                return reason;
            }
        };

        transition(&mut state, ConnectionState::Active, peer);
        info!(%peer, username = session.username(), "client joined");

        let writer_close = CancellationToken::new();
        let writer_task = tokio::spawn(drain_outbox(
            outbox,
            writer,
            writer_close.clone(),
            cancel.clone(),
        ));
        let session_task = tokio::spawn(Arc::clone(&self).run_session(
            session.clone(),
            reader,
            cancel.clone(),
        ));
        let reason = match session_task.await {
            Ok(reason) => reason,
            Err(err) => {
                warn!(%peer, username = session.username(), error = %err, "session task failed");
                CloseReason::Panicked
            }
        };

        transition(&mut state, ConnectionState::Closing, peer);
        self.release(session, writer_task, &writer_close, &cancel, peer, reason)
            .await;
        transition(&mut state, ConnectionState::Closed, peer);
        reason
    }

    async fn handshake<R, W>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
        cancel: &CancellationToken,
    ) -> Result<(SessionHandle, Outbox), CloseReason>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let inbound = select! {
            () = cancel.cancelled() => return Err(CloseReason::Cancelled),
            inbound = next_inbound(reader, self.idle_timeout) => inbound,
        };
        let frame = match inbound {
            Inbound::Frame(frame) => frame,
            other => return Err(close_reason(other)),
        };

        let Ok(username) = parse_username(&frame) else {
            reject(writer, ServerToClient::InvalidUsername).await;
            return Err(CloseReason::Rejected);
        };

        let (outbound, outbox) = outbound_queue(self.outbound_capacity);
        // Queued before registering so nothing routed to the new session can overtake it.
        if outbound.try_send(ServerToClient::Welcome.encode()).is_err() {
            return Err(CloseReason::Cancelled);
        }

        match self.registry.register(&username, outbound).await {
            Ok(session) => Ok((session, outbox)),
            Err(RegistryError::NameTaken(name)) => {
                info!(username = %name, "username already taken");
                reject(writer, ServerToClient::NameTaken).await;
                Err(CloseReason::Rejected)
            }
        }
    }

    async fn run_session(
        self: Arc<Self>,
        session: SessionHandle,
        mut reader: FrameReader<OwnedReadHalf>,
        cancel: CancellationToken,
    ) -> CloseReason {
        loop {
            let inbound = select! {
                biased;
                () = cancel.cancelled() => return CloseReason::Cancelled,
                inbound = next_inbound(&mut reader, self.idle_timeout) => inbound,
            };
            let frame = match inbound {
                Inbound::Frame(frame) => frame,
                other => return close_reason(other),
            };

            let Dispatch::Transfer(request) = self.router.route(&session, &frame).await else {
                continue;
            };

            set_frame_limit(&mut reader, MAX_FRAME_LEN);
            let relay = Arc::clone(&self.relay);
            let relay_cancel = cancel.child_token();
            let transfer = tokio::spawn(async move {
                let outcome = relay.run(request, &mut reader, relay_cancel).await;
                (reader, outcome)
            });

            match transfer.await {
                Ok((returned, outcome)) => {
                    reader = returned;
                    set_frame_limit(&mut reader, MAX_CONTROL_FRAME_LEN);
                    if !outcome.keeps_connection() {
                        return CloseReason::TransferAborted;
                    }
                }
                Err(err) => {
                    warn!(username = session.username(), error = %err, "relay task failed");
                    return CloseReason::Panicked;
                }
            }
        }
    }

    async fn release(
        &self,
        session: SessionHandle,
        mut writer_task: JoinHandle<()>,
        writer_close: &CancellationToken,
        cancel: &CancellationToken,
        peer: SocketAddr,
        reason: CloseReason,
    ) {
        self.registry.evict(&session).await;
        info!(%peer, username = session.username(), ?reason, "client disconnected");
        drop(session);

        cancel.cancel();
        writer_close.cancel();
        if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer_task).await.is_err() {
            debug!(%peer, "writer did not drain in time; aborting");
            writer_task.abort();
        }
    }
}

fn transition(state: &mut ConnectionState, next: ConnectionState, peer: SocketAddr) {
    let from = *state;
    trace!(%peer, ?from, to = ?next, "connection state change");
    *state = next;
}

fn close_reason(inbound: Inbound) -> CloseReason {
    match inbound {
        Inbound::Frame(_) | Inbound::Closed => CloseReason::PeerClosed,
        Inbound::TimedOut => CloseReason::TimedOut,
        Inbound::Failed(err) => {
            debug!(error = %err, "connection read failed");
            CloseReason::ReadFailed
        }
    }
}

async fn reject<W>(writer: &mut FrameWriter<W>, message: ServerToClient)
where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = write_frame(writer, message.encode()).await {
        debug!(error = %err, "failed to send rejection");
    }
}

/// Writes queued frames to the socket until every sender is gone, or until
/// `close` fires and the queue is empty. A failed write cancels `connection`.
async fn drain_outbox<W>(
    mut outbox: Outbox,
    mut writer: FrameWriter<W>,
    close: CancellationToken,
    connection: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut closing = false;
    loop {
        let frame = if closing {
            outbox.recv().await
        } else {
            select! {
                frame = outbox.recv() => frame,
                () = close.cancelled() => {
                    closing = true;
                    outbox.close();
                    continue;
                }
            }
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(err) = write_frame(&mut writer, frame).await {
            debug!(error = %err, "failed to deliver frame to client");
            connection.cancel();
            return;
        }
    }

    if let Err(err) = SinkExt::<Bytes>::close(&mut writer).await {
        trace!(error = %err, "failed to shut down writer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::read_frame;

    fn handler(registry: &Arc<SessionRegistry>) -> ConnectionHandler {
        let config = ServerConfig {
            idle_timeout: Some(Duration::from_secs(1)),
            ..ServerConfig::default()
        };
        ConnectionHandler::new(Arc::clone(registry), &config)
    }

    #[tokio::test]
    async fn handshake_queues_welcome_before_registering() {
        let registry = Arc::new(SessionRegistry::new());
        let handler = handler(&registry);
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let mut client = frame_writer(client);
        write_frame(&mut client, &b"alice"[..]).await.expect("send username");

        let (session, mut outbox) = handler
            .handshake(
                &mut frame_reader(server_read),
                &mut frame_writer(server_write),
                &CancellationToken::new(),
            )
            .await
            .expect("handshake should succeed");

        assert_eq!(session.username(), "alice");
        assert!(registry.lookup("alice").await.is_some());
        let first = outbox.try_recv().expect("welcome queued");
        assert_eq!(&first[..], b"Welcome to the chat server!");
    }

    #[tokio::test]
    async fn handshake_rejects_a_taken_name() {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, _rx) = outbound_queue(4);
        let original = registry.register("alice", tx).await.expect("register");
        let handler = handler(&registry);

        let (client, server) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        write_frame(&mut frame_writer(client_write), &b"alice"[..])
            .await
            .expect("send username");

        let result = handler
            .handshake(
                &mut frame_reader(server_read),
                &mut frame_writer(server_write),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.err(), Some(CloseReason::Rejected));
        let reply = read_frame(&mut frame_reader(client_read))
            .await
            .expect("read reply")
            .expect("reply frame");
        assert_eq!(&reply[..], b"Username already taken. Disconnecting.");
        let current = registry.lookup("alice").await.expect("original kept");
        assert!(current.same_session(&original));
    }

    #[tokio::test]
    async fn silent_client_times_out_during_handshake() {
        let registry = Arc::new(SessionRegistry::new());
        let handler = handler(&registry);
        let (_client, server) = tokio::io::duplex(64);
        let (server_read, server_write) = tokio::io::split(server);

        let result = handler
            .handshake(
                &mut frame_reader(server_read),
                &mut frame_writer(server_write),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.err(), Some(CloseReason::TimedOut));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn closing_writer_flushes_queued_frames() {
        let (client, server) = tokio::io::duplex(1024);
        let (outbound, outbox) = outbound_queue(8);
        let close = CancellationToken::new();
        outbound.try_send("first".into()).expect("queue");
        outbound.try_send("second".into()).expect("queue");

        close.cancel();
        // The sender stays alive; closing must not wait for it.
        drain_outbox(outbox, frame_writer(server), close, CancellationToken::new()).await;

        let mut reader = frame_reader(client);
        let first = read_frame(&mut reader).await.expect("read").expect("frame");
        let second = read_frame(&mut reader).await.expect("read").expect("frame");
        assert_eq!(&first[..], b"first");
        assert_eq!(&second[..], b"second");
        assert!(read_frame(&mut reader).await.expect("read").is_none());
        assert!(outbound.is_closed());
    }

    #[tokio::test]
    async fn writer_accepts_frames_after_the_connection_is_cancelled() {
        let (client, server) = tokio::io::duplex(1024);
        let (outbound, outbox) = outbound_queue(8);
        let close = CancellationToken::new();
        let connection = CancellationToken::new();
        connection.cancel();

        let writer = tokio::spawn(drain_outbox(
            outbox,
            frame_writer(server),
            close.clone(),
            connection.clone(),
        ));
        tokio::task::yield_now().await;
        outbound
            .send(Bytes::from_static(b"late ack"))
            .await
            .expect("queue still open while the connection is cancelled");
        close.cancel();
        writer.await.expect("writer task");

        let mut reader = frame_reader(client);
        let frame = read_frame(&mut reader).await.expect("read").expect("frame");
        assert_eq!(&frame[..], b"late ack");
    }
}
