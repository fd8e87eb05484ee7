use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::BytesMut;
use futures::Stream;
use tokio::{
    fs::File,
    io::AsyncWriteExt,
    select,
    sync::Semaphore,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::DeliveryError,
    protocol::{Inbound, ServerToClient, is_transfer_terminator, next_inbound, stored_file_name},
    registry::{SessionHandle, SessionRegistry},
};

/// How long the sender's queue may stay full before its acknowledgment is dropped.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// One file transfer, alive for the duration of a single relay task.
#[derive(Debug, Clone)]
pub struct FileTransferRequest {
    pub sender: SessionHandle,
    /// `None` when the recipient was offline; the data is then drained and dropped.
    pub recipient: Option<SessionHandle>,
    pub recipient_name: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Terminator seen and every chunk stored.
    Completed { bytes: u64, path: PathBuf },
    /// Terminator seen but nothing kept (recipient offline or the file could not be written).
    Discarded { bytes: u64 },
    /// Sender closed the connection before the terminator.
    PeerClosed { bytes: u64 },
    ReadFailed,
    TimedOut,
    Cancelled,
}

impl RelayOutcome {
    /// False when the sender's stream ended or can no longer be trusted.
    pub fn keeps_connection(&self) -> bool {
        matches!(
            self,
            RelayOutcome::Completed { .. } | RelayOutcome::Discarded { .. }
        )
    }
}

/// Copies a sender's data frames into a server-side file.
pub struct FileRelay {
    registry: Arc<SessionRegistry>,
    download_dir: PathBuf,
    idle_timeout: Option<Duration>,
    permits: Arc<Semaphore>,
    /// Numbers the part files so concurrent uploads never share one.
    next_part: AtomicU64,
}

impl FileRelay {
    pub fn new(
        registry: Arc<SessionRegistry>,
        download_dir: impl Into<PathBuf>,
        idle_timeout: Option<Duration>,
        max_relays: usize,
    ) -> Self {
        Self {
            registry,
            download_dir: download_dir.into(),
            idle_timeout,
            permits: Arc::new(Semaphore::new(max_relays.max(1))),
            next_part: AtomicU64::new(1),
        }
    }

    /// Runs one transfer to its end. The sender is acknowledged exactly once
    /// whatever the outcome.
    pub async fn run<S>(
        &self,
        request: FileTransferRequest,
        frames: &mut S,
        cancel: CancellationToken,
    ) -> RelayOutcome
    where
        S: Stream<Item = io::Result<BytesMut>> + Unpin,
    {
        let outcome = select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                let _permit = permit.ok();
                self.copy(&request, frames, &cancel).await
            }
            () = cancel.cancelled() => RelayOutcome::Cancelled,
        };

        self.finish(&request, &outcome).await;
        outcome
    }

    async fn copy<S>(
        &self,
        request: &FileTransferRequest,
        frames: &mut S,
        cancel: &CancellationToken,
    ) -> RelayOutcome
    where
        S: Stream<Item = io::Result<BytesMut>> + Unpin,
    {
        let stored = stored_file_name(&request.filename);
        let path = self.download_dir.join(&stored);
        // Data lands in a private part file and is renamed into place on completion.
        let part = self.download_dir.join(format!(
            ".{stored}.{}.part",
            self.next_part.fetch_add(1, Ordering::Relaxed)
        ));
        let mut sink = match request.recipient {
            Some(_) => open_sink(&part).await,
            None => None,
        };
        let opened = sink.is_some();
        let mut bytes = 0u64;

        let outcome = loop {
            let inbound = select! {
                biased;
                () = cancel.cancelled() => break RelayOutcome::Cancelled,
                inbound = next_inbound(frames, self.idle_timeout) => inbound,
            };

            let chunk = match inbound {
                Inbound::Frame(chunk) => chunk,
                Inbound::Closed => break RelayOutcome::PeerClosed { bytes },
                Inbound::TimedOut => break RelayOutcome::TimedOut,
                Inbound::Failed(err) => {
                    warn!(filename = %request.filename, error = %err, "failed to read file chunk");
                    break RelayOutcome::ReadFailed;
                }
            };

            if is_transfer_terminator(&chunk) {
                break match sink.take() {
                    Some(file) => match publish(file, &part, &path).await {
                        Ok(()) => RelayOutcome::Completed {
                            bytes,
                            path: path.clone(),
                        },
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "failed to store received file");
                            RelayOutcome::Discarded { bytes }
                        }
                    },
                    None => RelayOutcome::Discarded { bytes },
                };
            }

            bytes += chunk.len() as u64;
            if let Some(file) = sink.as_mut() {
                if let Err(err) = file.write_all(&chunk).await {
                    // Keep reading so the rest of the transfer is not taken for commands.
                    warn!(path = %part.display(), error = %err, "failed to write file chunk; discarding the rest");
                    sink = None;
                }
            }
        };

        drop(sink);
        if opened && !matches!(outcome, RelayOutcome::Completed { .. }) {
            if let Err(err) = tokio::fs::remove_file(&part).await {
                debug!(path = %part.display(), error = %err, "failed to remove partial file");
            }
        }
        outcome
    }

    async fn finish(&self, request: &FileTransferRequest, outcome: &RelayOutcome) {
        match outcome {
            RelayOutcome::Completed { bytes, path } => {
                info!(
                    sender = request.sender.username(),
                    recipient = %request.recipient_name,
                    bytes,
                    path = %path.display(),
                    "file transfer complete"
                );
                if let Some(recipient) = &request.recipient {
                    let notice = ServerToClient::FileReceived {
                        filename: request.filename.clone(),
                    };
                    if let Err(DeliveryError::Closed) = recipient.deliver(notice.encode()) {
                        if self.registry.evict(recipient).await {
                            warn!(username = recipient.username(), "delivery failed; session evicted");
                        }
                    }
                }
            }
            other => {
                warn!(
                    sender = request.sender.username(),
                    recipient = %request.recipient_name,
                    filename = %request.filename,
                    outcome = ?other,
                    "file transfer did not complete"
                );
            }
        }

        let ack = request
            .sender
            .deliver_wait(ServerToClient::TransferComplete.encode());
        match tokio::time::timeout(ACK_TIMEOUT, ack).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(username = request.sender.username(), error = %err, "could not acknowledge transfer");
            }
            Err(_) => {
                warn!(username = request.sender.username(), "timed out acknowledging transfer");
            }
        }
    }
}

/// Flushes the part file and moves it onto its final name.
async fn publish(mut file: File, part: &Path, path: &Path) -> io::Result<()> {
    file.flush().await?;
    drop(file);
    tokio::fs::rename(part, path).await
}

async fn open_sink(path: &Path) -> Option<File> {
    match File::create(path).await {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to create file for transfer");
            None
        }
    }
}
