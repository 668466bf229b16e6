//! Transport connections and the connectors that create them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::identifiers::ConnectionId;

pub mod connector;
pub(crate) mod handshake;
pub mod managed;
pub mod simulator;
pub mod webrtc;
pub mod websocket;

pub use connector::{Connector, ConnectorContext, IncomingConnectionHandler};
pub use managed::{ConnectionState, ManagedConnection, ManagedEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    WebsocketClient,
    WebsocketServer,
    Webrtc,
    Simulator,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionType::WebsocketClient => "websocket-client",
            ConnectionType::WebsocketServer => "websocket-server",
            ConnectionType::Webrtc => "webrtc",
            ConnectionType::Simulator => "simulator",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Data(Bytes),
    Disconnected {
        graceful: bool,
        reason: Option<String>,
    },
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// A transport-specific bidirectional byte stream.
///
/// Implementations report `Connected`, `Data` and exactly one `Disconnected`
/// through the event receiver handed out next to them.
#[async_trait]
pub trait RawConnection: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    fn connection_type(&self) -> ConnectionType;

    /// Queues bytes for delivery without waiting for the transport.
    fn send(&self, data: Bytes) -> Result<()>;

    /// `graceful` marks a node that is leaving the network.
    async fn close(&self, graceful: bool, reason: Option<String>);
}

pub struct RawConnectionHandle {
    pub connection: Arc<dyn RawConnection>,
    pub events: ConnectionEvents,
}

impl RawConnectionHandle {
    pub fn new(connection: Arc<dyn RawConnection>, events: ConnectionEvents) -> Self {
        Self { connection, events }
    }
}

/// Emits raw connection events and guarantees a single `Disconnected`.
#[derive(Debug)]
pub(crate) struct RawEventSink {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    disconnected: AtomicBool,
}

impl RawEventSink {
    pub(crate) fn channel() -> (Arc<Self>, ConnectionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            tx,
            disconnected: AtomicBool::new(false),
        });
        (sink, rx)
    }

    pub(crate) fn connected(&self) {
        if !self.is_disconnected() {
            let _ = self.tx.send(ConnectionEvent::Connected);
        }
    }

    pub(crate) fn data(&self, data: Bytes) {
        if !self.is_disconnected() {
            let _ = self.tx.send(ConnectionEvent::Data(data));
        }
    }

    /// Returns `false` when the disconnect was already reported.
    pub(crate) fn disconnected(&self, graceful: bool, reason: Option<String>) -> bool {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self
            .tx
            .send(ConnectionEvent::Disconnected { graceful, reason });
        true
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sink_reports_disconnect_once_and_then_goes_quiet() {
        let (sink, mut events) = RawEventSink::channel();
        sink.connected();
        sink.data(Bytes::from_static(b"one"));
        assert!(sink.disconnected(true, Some("bye".into())));
        assert!(!sink.disconnected(false, None));
        sink.data(Bytes::from_static(b"late"));
        drop(sink);

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionEvent::Connected,
                ConnectionEvent::Data(Bytes::from_static(b"one")),
                ConnectionEvent::Disconnected {
                    graceful: true,
                    reason: Some("bye".into())
                },
            ]
        );
    }
}
