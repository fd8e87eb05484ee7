use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::SinkExt;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    config::ServerConfig,
    connection::ConnectionHandler,
    protocol::{ServerToClient, frame_writer, write_frame},
    registry::SessionRegistry,
};

/// How long shutdown waits for connection tasks before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Server {
    listener: TcpListener,
    state: ServerState,
}

struct ServerState {
    registry: Arc<SessionRegistry>,
    handler: Arc<ConnectionHandler>,
    connection_slots: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let handler = Arc::new(ConnectionHandler::new(Arc::clone(&registry), &config));
        Self {
            listener,
            state: ServerState {
                registry,
                handler,
                connection_slots: Arc::new(Semaphore::new(config.max_connections.max(1))),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            },
        }
    }

    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &ServerState) {
    info!("relay shutting down");
    let notice = ServerToClient::ShuttingDown.encode();
    state
        .registry
        .for_each(|session| {
            if let Err(err) = session.deliver(notice.clone()) {
                trace!(username = session.username(), error = %err, "shutdown notice not queued");
            }
        })
        .await;

    state.cancel.cancel();
    state.tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, state.tracker.wait())
        .await
        .is_err()
    {
        warn!(
            remaining = state.tracker.len(),
            "shutdown timed out; some connections are still open"
        );
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, state: &ServerState) {
    match result {
        Ok((stream, peer)) => match Arc::clone(&state.connection_slots).try_acquire_owned() {
            Ok(permit) => spawn_connection_handler(stream, peer, permit, state),
            Err(_) => {
                warn!(%peer, "connection limit reached; rejecting");
                state.tracker.spawn(reject_connection(stream, peer));
            }
        },
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    permit: OwnedSemaphorePermit,
    state: &ServerState,
) {
    debug!(%peer, "connection accepted");
    let handler = Arc::clone(&state.handler);
    let cancel = state.cancel.child_token();
    state.tracker.spawn(async move {
        let _permit = permit;
        let reason = handler.handle(stream, peer, cancel).await;
        debug!(%peer, ?reason, "connection closed");
    });
}

async fn reject_connection(stream: TcpStream, peer: SocketAddr) {
    let mut writer = frame_writer(stream);
    if let Err(err) = write_frame(&mut writer, ServerToClient::ServerFull.encode()).await {
        debug!(%peer, error = %err, "failed to send rejection");
    }
    if let Err(err) = SinkExt::<Bytes>::close(&mut writer).await {
        trace!(%peer, error = %err, "failed to close rejected connection");
    }
}
