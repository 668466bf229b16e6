use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::ManagedConnection;
use crate::error::Result;
use crate::identifiers::PeerDescriptor;
use crate::protocol::Message;

#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// Handshake completed with a peer.
    Connected(PeerDescriptor),
    Disconnected {
        peer: PeerDescriptor,
        graceful: bool,
    },
    Message(Message),
    NewConnection(ManagedConnection),
}

/// Receiving end of a subscription. Events queue until read; nothing is
/// dropped for a slow reader.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Fans events out to every live subscriber, each through its own unbounded
/// queue. Subscribers whose receiver was dropped are pruned on publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> TransportEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: TransportEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Fail instead of opening a connection when none exists.
    pub do_not_connect: bool,
}

impl SendOptions {
    pub fn do_not_connect() -> Self {
        Self {
            do_not_connect: true,
        }
    }
}

/// Message-level transport between peers. Connectors use it to carry their
/// signaling traffic over already established connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: Message, options: SendOptions) -> Result<()>;

    fn local_peer_descriptor(&self) -> PeerDescriptor;

    fn subscribe(&self) -> TransportEvents;
}
