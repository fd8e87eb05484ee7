use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    error::{CommandError, DeliveryError},
    protocol::{Command, ServerToClient},
    registry::{SessionHandle, SessionRegistry},
    relay::FileTransferRequest,
};

/// What the connection should do after a frame has been routed.
#[derive(Debug)]
pub enum Dispatch {
    Continue,
    /// The following frames from this connection belong to a file transfer.
    Transfer(FileTransferRequest),
}

/// Turns inbound frames into deliveries.
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn route(&self, sender: &SessionHandle, frame: &[u8]) -> Dispatch {
        if frame.is_empty() {
            return Dispatch::Continue;
        }

        let command = match Command::decode(frame) {
            Ok(command) => command,
            Err(CommandError::NotText) => {
                warn!(
                    username = sender.username(),
                    bytes = frame.len(),
                    "binary data received outside a transfer; dropping"
                );
                return Dispatch::Continue;
            }
            Err(err) => {
                debug!(username = sender.username(), error = %err, "rejected command");
                if let Some(reply) = err.reply() {
                    self.deliver(sender, &reply).await;
                }
                return Dispatch::Continue;
            }
        };

        match command {
            Command::File {
                recipient,
                filename,
            } => return Dispatch::Transfer(self.offer_file(sender, recipient, filename).await),
            Command::Unicast { recipient, message } => {
                self.unicast(sender, recipient, message).await;
            }
            Command::Multicast {
                recipients,
                message,
            } => {
                self.multicast(sender, &recipients, message).await;
            }
            Command::Broadcast { message } => {
                self.broadcast(sender, message).await;
            }
            Command::Chat { text } => {
                info!(username = sender.username(), text, "received chat");
                self.broadcast(sender, text).await;
            }
        }

        Dispatch::Continue
    }

    /// Returns true if the message reached the recipient's queue.
    pub async fn unicast(&self, sender: &SessionHandle, recipient: &str, text: &str) -> bool {
        match self.registry.lookup(recipient).await {
            Some(target) => {
                let message = ServerToClient::Unicast {
                    from: sender.username().to_string(),
                    text: text.to_string(),
                };
                self.deliver(&target, &message).await
            }
            None => {
                self.not_found(sender, recipient).await;
                false
            }
        }
    }

    /// Returns the number of recipients the message reached.
    pub async fn multicast(&self, sender: &SessionHandle, recipients: &[&str], text: &str) -> usize {
        let message = ServerToClient::Multicast {
            from: sender.username().to_string(),
            text: text.to_string(),
        };

        let mut delivered = 0;
        for recipient in recipients {
            match self.registry.lookup(recipient).await {
                Some(target) => {
                    if self.deliver(&target, &message).await {
                        delivered += 1;
                    }
                }
                None => self.not_found(sender, recipient).await,
            }
        }
        delivered
    }

    /// Sends to every session except the sender; returns how many were reached.
    pub async fn broadcast(&self, sender: &SessionHandle, text: &str) -> usize {
        let frame = ServerToClient::Broadcast {
            from: sender.username().to_string(),
            text: text.to_string(),
        }
        .encode();

        let mut delivered = 0;
        let mut closed = Vec::new();
        self.registry
            .for_each(|target| {
                if target.same_session(sender) {
                    return;
                }
                match target.deliver(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(DeliveryError::Full) => {
                        warn!(recipient = target.username(), "outbound queue full; dropping broadcast");
                    }
                    Err(DeliveryError::Closed) => closed.push(target.clone()),
                }
            })
            .await;

        for target in &closed {
            self.evict(target).await;
        }
        debug!(username = sender.username(), delivered, "broadcast routed");
        delivered
    }

    async fn offer_file(&self, sender: &SessionHandle, recipient: &str, filename: &str) -> FileTransferRequest {
        let mut target = self.registry.lookup(recipient).await;

        match &target {
            Some(handle) => {
                let offer = ServerToClient::FileOffer {
                    from: sender.username().to_string(),
                    filename: filename.to_string(),
                };
                if !self.deliver(handle, &offer).await {
                    target = None;
                }
            }
            None => self.not_found(sender, recipient).await,
        }

        info!(
            sender = sender.username(),
            recipient,
            filename,
            stored = target.is_some(),
            "file transfer requested"
        );
        FileTransferRequest {
            sender: sender.clone(),
            recipient: target,
            recipient_name: recipient.to_string(),
            filename: filename.to_string(),
        }
    }

    async fn not_found(&self, sender: &SessionHandle, username: &str) {
        let reply = ServerToClient::UserNotFound {
            username: username.to_string(),
        };
        self.deliver(sender, &reply).await;
    }

    /// Queues `message` for `target`, evicting the target if its queue is gone.
    async fn deliver(&self, target: &SessionHandle, message: &ServerToClient) -> bool {
        match target.deliver(message.encode()) {
            Ok(()) => true,
            Err(DeliveryError::Full) => {
                warn!(recipient = target.username(), "outbound queue full; dropping message");
                false
            }
            Err(DeliveryError::Closed) => {
                self.evict(target).await;
                false
            }
        }
    }

    async fn evict(&self, target: &SessionHandle) {
        if self.registry.evict(target).await {
            warn!(username = target.username(), "delivery failed; session evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Outbox, outbound_queue};

    struct Fixture {
        registry: Arc<SessionRegistry>,
        router: MessageRouter,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(SessionRegistry::new());
            let router = MessageRouter::new(Arc::clone(&registry));
            Self { registry, router }
        }

        async fn join(&self, name: &str) -> (SessionHandle, Outbox) {
            let (tx, rx) = outbound_queue(16);
            let handle = self.registry.register(name, tx).await.expect("register");
            (handle, rx)
        }
    }

    fn drain(outbox: &mut Outbox) -> Vec<String> {
        let mut received = Vec::new();
        while let Ok(frame) = outbox.try_recv() {
            received.push(String::from_utf8_lossy(&frame).into_owned());
        }
        received
    }

    #[tokio::test]
    async fn unicast_reaches_only_the_recipient() {
        let fx = Fixture::new();
        let (_alice, mut alice_rx) = fx.join("alice").await;
        let (bob, mut bob_rx) = fx.join("bob").await;
        let (_carol, mut carol_rx) = fx.join("carol").await;

        fx.router.route(&bob, b"unicast:alice:hi").await;

        assert_eq!(drain(&mut alice_rx), vec!["Unicast from bob: hi"]);
        assert!(drain(&mut bob_rx).is_empty());
        assert!(drain(&mut carol_rx).is_empty());
    }

    #[tokio::test]
    async fn unicast_to_missing_user_replies_once() {
        let fx = Fixture::new();
        let (alice, mut alice_rx) = fx.join("alice").await;
        let (_bob, mut bob_rx) = fx.join("bob").await;

        fx.router.route(&alice, b"unicast:charlie:hi").await;

        assert_eq!(drain(&mut alice_rx), vec!["User charlie not found."]);
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn multicast_splits_present_and_absent() {
        let fx = Fixture::new();
        let (alice, mut alice_rx) = fx.join("alice").await;
        let (_bob, mut bob_rx) = fx.join("bob").await;

        fx.router.route(&alice, b"multicast:bob,dave,bob:lunch?").await;

        assert_eq!(drain(&mut bob_rx), vec!["Multicast from alice: lunch?"]);
        assert_eq!(drain(&mut alice_rx), vec!["User dave not found."]);
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let fx = Fixture::new();
        let (alice, mut alice_rx) = fx.join("alice").await;
        let mut others = Vec::new();
        for name in ["bob", "carol", "dave"] {
            others.push(fx.join(name).await);
        }

        let delivered = fx.router.broadcast(&alice, "hello").await;

        assert_eq!(delivered, 3);
        assert!(drain(&mut alice_rx).is_empty());
        for (_, rx) in &mut others {
            assert_eq!(drain(rx), vec!["Broadcast from alice: hello"]);
        }
    }

    #[tokio::test]
    async fn untagged_text_is_broadcast() {
        let fx = Fixture::new();
        let (alice, _alice_rx) = fx.join("alice").await;
        let (_bob, mut bob_rx) = fx.join("bob").await;

        fx.router.route(&alice, b"anyone around?").await;

        assert_eq!(drain(&mut bob_rx), vec!["Broadcast from alice: anyone around?"]);
    }

    #[tokio::test]
    async fn closed_targets_are_evicted_and_fanout_continues() {
        let fx = Fixture::new();
        let (alice, _alice_rx) = fx.join("alice").await;
        let (_bob, bob_rx) = fx.join("bob").await;
        let (_carol, mut carol_rx) = fx.join("carol").await;
        drop(bob_rx);

        let delivered = fx.router.broadcast(&alice, "still here?").await;

        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut carol_rx), vec!["Broadcast from alice: still here?"]);
        assert!(fx.registry.lookup("bob").await.is_none());
        assert!(fx.registry.lookup("carol").await.is_some());
    }

    #[tokio::test]
    async fn binary_and_malformed_frames_stay_local() {
        let fx = Fixture::new();
        let (alice, mut alice_rx) = fx.join("alice").await;
        let (_bob, mut bob_rx) = fx.join("bob").await;

        fx.router.route(&alice, &[0xff, 0x00, 0x9f]).await;
        fx.router.route(&alice, b"unicast:bob").await;
        fx.router.route(&alice, b"").await;

        assert!(drain(&mut bob_rx).is_empty());
        assert_eq!(
            drain(&mut alice_rx),
            vec!["Malformed command: expected unicast:<recipient>:<message>"]
        );
    }

    #[tokio::test]
    async fn file_command_offers_transfer_to_recipient() {
        let fx = Fixture::new();
        let (alice, mut alice_rx) = fx.join("alice").await;
        let (bob, mut bob_rx) = fx.join("bob").await;

        let Dispatch::Transfer(request) = fx.router.route(&alice, b"file:bob:notes.txt").await else {
            panic!("expected a transfer");
        };

        assert!(request.sender.same_session(&alice));
        assert!(request.recipient.as_ref().is_some_and(|r| r.same_session(&bob)));
        assert_eq!(request.filename, "notes.txt");
        assert_eq!(drain(&mut bob_rx), vec!["file:alice:notes.txt"]);
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn file_command_to_missing_user_still_claims_the_stream() {
        let fx = Fixture::new();
        let (alice, mut alice_rx) = fx.join("alice").await;

        let Dispatch::Transfer(request) = fx.router.route(&alice, b"file:zed:a.bin").await else {
            panic!("expected a transfer");
        };

        assert!(request.recipient.is_none());
        assert_eq!(request.recipient_name, "zed");
        assert_eq!(drain(&mut alice_rx), vec!["User zed not found."]);
    }
}
