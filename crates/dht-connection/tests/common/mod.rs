#![allow(dead_code)]

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dht_connection::{
    ConnectionError, ConnectionManager, ConnectionManagerConfig, EventBus, Message, MessageBody,
    NodeId, PeerDescriptor, Result, SendOptions, Simulator, Transport, TransportEvent,
    TransportEvents,
};
use parking_lot::Mutex;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn descriptor(byte: u8) -> PeerDescriptor {
    PeerDescriptor::new(NodeId::new(vec![byte; 8]))
}

pub async fn simulated_node(
    simulator: &Simulator,
    local: PeerDescriptor,
    config: ConnectionManagerConfig,
) -> ConnectionManager {
    let manager = ConnectionManager::simulated(config, local, simulator);
    manager.start().await.expect("start simulated node");
    manager
}

/// Waits for the first event `matcher` accepts, skipping the others.
pub async fn next_event<T>(
    events: &mut TransportEvents,
    mut matcher: impl FnMut(TransportEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if let Some(found) = matcher(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn connected(events: &mut TransportEvents) -> PeerDescriptor {
    next_event(events, |event| match event {
        TransportEvent::Connected(peer) => Some(peer),
        _ => None,
    })
    .await
}

pub async fn disconnected(events: &mut TransportEvents) -> (PeerDescriptor, bool) {
    next_event(events, |event| match event {
        TransportEvent::Disconnected { peer, graceful } => Some((peer, graceful)),
        _ => None,
    })
    .await
}

/// Payloads of application messages addressed to `service_id`.
pub async fn application_payload(
    events: &mut TransportEvents,
    service_id: &str,
) -> Vec<u8> {
    next_event(events, |event| match event {
        TransportEvent::Message(Message {
            service_id: id,
            body: MessageBody::Application(payload),
            ..
        }) if id == service_id => Some(payload.to_vec()),
        _ => None,
    })
    .await
}

/// Polls `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Events already queued on `events`, without waiting for more.
pub fn queued_events(events: &mut TransportEvents) -> Vec<TransportEvent> {
    let mut queued = Vec::new();
    while let Ok(event) = events.try_recv() {
        queued.push(event);
    }
    queued
}

/// Hands signaling straight to the other node, standing in for the overlay's
/// routing layer.
pub struct RelaySignaling {
    local: Mutex<PeerDescriptor>,
    events: EventBus,
    peer: Mutex<Weak<RelaySignaling>>,
}

impl RelaySignaling {
    pub fn pair(a: PeerDescriptor, b: PeerDescriptor) -> (Arc<Self>, Arc<Self>) {
        let build = |local| {
            Arc::new(Self {
                local: Mutex::new(local),
                events: EventBus::new(),
                peer: Mutex::new(Weak::new()),
            })
        };
        let (first, second) = (build(a), build(b));
        *first.peer.lock() = Arc::downgrade(&second);
        *second.peer.lock() = Arc::downgrade(&first);
        (first, second)
    }

    /// Updates the descriptor stamped on relayed messages, e.g. once the
    /// node's server endpoint is known.
    pub fn set_local(&self, local: PeerDescriptor) {
        *self.local.lock() = local;
    }
}

#[async_trait]
impl Transport for RelaySignaling {
    async fn send(&self, message: Message, _options: SendOptions) -> Result<()> {
        let peer = self
            .peer
            .lock()
            .upgrade()
            .ok_or_else(|| ConnectionError::SendFailed("relay peer gone".into()))?;
        peer.events
            .publish(TransportEvent::Message(message.with_source(self.local.lock().clone())));
        Ok(())
    }

    fn local_peer_descriptor(&self) -> PeerDescriptor {
        self.local.lock().clone()
    }

    fn subscribe(&self) -> TransportEvents {
        self.events.subscribe()
    }
}
