use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};

use crate::error::{DeliveryError, RegistryError};

pub type SessionId = u64;

/// Receiving end of a session's outbound queue, drained by its writer task.
pub type Outbox = mpsc::Receiver<Bytes>;

/// Cheap, cloneable reference to a live session.
///
/// Delivering through a handle only enqueues the frame; the session's writer
/// task does the socket I/O.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    username: Arc<str>,
    outbound: mpsc::Sender<Bytes>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn deliver(&self, frame: impl Into<Bytes>) -> Result<(), DeliveryError> {
        self.outbound.try_send(frame.into()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Like [`SessionHandle::deliver`], but waits for queue space instead of
    /// dropping the frame.
    pub async fn deliver_wait(&self, frame: impl Into<Bytes>) -> Result<(), DeliveryError> {
        self.outbound
            .send(frame.into())
            .await
            .map_err(|_| DeliveryError::Closed)
    }

    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.id == other.id
    }
}

/// Creates the outbound queue for a session that is about to register.
pub fn outbound_queue(capacity: usize) -> (mpsc::Sender<Bytes>, Outbox) {
    mpsc::channel(capacity.max(1))
}

/// Username to session mapping; the only record of who is online.
///
/// Every operation takes the single lock briefly and never performs I/O
/// while holding it.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    next_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn register(
        &self,
        username: &str,
        outbound: mpsc::Sender<Bytes>,
    ) -> Result<SessionHandle, RegistryError> {
        let mut sessions = self.sessions.lock().await;

        if sessions.contains_key(username) {
            return Err(RegistryError::NameTaken(username.to_string()));
        }

        let handle = SessionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            username: Arc::from(username),
            outbound,
        };
        sessions.insert(username.to_string(), handle.clone());
        Ok(handle)
    }

    /// Removes whatever session holds `username`. Calling it twice is harmless.
    pub async fn unregister(&self, username: &str) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(username)
    }

    /// Removes the entry for `handle.username()` only if it is still the same
    /// session, so a stale handle never evicts a newer owner of the name.
    pub async fn evict(&self, handle: &SessionHandle) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(handle.username()) {
            Some(current) if current.same_session(handle) => {
                sessions.remove(handle.username());
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, username: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().await;
        sessions.get(username).cloned()
    }

    /// Snapshot of every live handle, taken under the lock and returned after
    /// it is released.
    pub async fn snapshot(&self) -> Vec<SessionHandle> {
        let sessions = self.sessions.lock().await;
        sessions.values().cloned().collect()
    }

    /// Applies `f` to every session that was live when the call started.
    ///
    /// `f` runs without the lock held, so it may call back into the registry
    /// (for example to evict a handle whose delivery failed).
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&SessionHandle),
    {
        for handle in self.snapshot().await {
            f(&handle);
        }
    }

    pub async fn usernames(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        let mut names: Vec<String> = sessions.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
