use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::handshake;
use super::managed::ManagedConnection;
use crate::error::Result;
use crate::identifiers::{PeerDescriptor, PeerKey, WebsocketEndpoint};
use crate::protocol::{HandshakeError, HandshakeRequest};
use crate::transport::Transport;

/// Receives connections created by connectors on behalf of remote peers.
pub trait IncomingConnectionHandler: Send + Sync {
    /// Returns `false` when the connection lost a duplicate race and must be
    /// rejected.
    fn on_incoming_connection(&self, connection: ManagedConnection) -> bool;

    /// Whether a connection to `peer` may be opened right now.
    fn can_connect(&self, peer: &PeerDescriptor) -> bool;
}

#[derive(Clone)]
pub struct ConnectorContext {
    pub local_peer_descriptor: PeerDescriptor,
    pub handler: Arc<dyn IncomingConnectionHandler>,
    pub signaling: Option<Arc<dyn Transport>>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Binds listening resources before the local descriptor is final.
    async fn listen(&self) -> Result<Option<WebsocketEndpoint>> {
        Ok(None)
    }

    async fn start(&self, context: ConnectorContext) -> Result<()>;

    fn can_form_connection(&self, local: &PeerDescriptor, target: &PeerDescriptor) -> bool;

    /// Whether every connection this connector forms is negotiated over the
    /// signaling transport.
    fn needs_signaling(&self) -> bool {
        false
    }

    /// Returns a connection that completes its handshake in the background.
    fn connect(&self, target: &PeerDescriptor) -> Result<ManagedConnection>;

    async fn stop(&self);
}

/// Runs the acceptor side of the handshake for a fresh incoming connection.
pub(crate) async fn admit_incoming(
    context: &ConnectorContext,
    connection: &ManagedConnection,
    request: &HandshakeRequest,
) -> bool {
    connection.set_connection_id(request.connection_id.clone());
    if let Some(error) = handshake::validate_request(&context.local_peer_descriptor, request) {
        tracing::debug!(
            target = "dht::connector",
            peer = %request.source_descriptor.key(),
            error = %error,
            "rejecting handshake"
        );
        connection.reject_handshake(error).await;
        return false;
    }
    if context.handler.on_incoming_connection(connection.clone()) {
        connection.accept_handshake();
        true
    } else {
        connection.reject_handshake(HandshakeError::Duplicate).await;
        false
    }
}

/// Connections a connector created whose handshake is still in flight.
#[derive(Clone, Default)]
pub(crate) struct PendingConnections {
    inner: Arc<Mutex<HashMap<PeerKey, ManagedConnection>>>,
}

impl PendingConnections {
    pub(crate) fn get(&self, peer: &PeerKey) -> Option<ManagedConnection> {
        self.inner.lock().get(peer).cloned()
    }

    pub(crate) fn contains(&self, peer: &PeerKey) -> bool {
        self.inner.lock().contains_key(peer)
    }

    pub(crate) fn drain(&self) -> Vec<ManagedConnection> {
        self.inner.lock().drain().map(|(_, connection)| connection).collect()
    }

    /// Tracks `connection` until its handshake completes or it closes.
    pub(crate) fn insert_until_settled(&self, connection: ManagedConnection) {
        let key = connection.remote_peer_descriptor().key();
        self.inner.lock().insert(key.clone(), connection.clone());
        let pending = self.inner.clone();
        tokio::spawn(async move {
            connection.settled().await;
            let mut pending = pending.lock();
            if pending
                .get(&key)
                .is_some_and(|current| current.same_as(&connection))
            {
                pending.remove(&key);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::managed::tests::RecordingConnection;
    use crate::connection::{ConnectionType, ManagedConnection};
    use crate::identifiers::{ConnectionId, NodeId};
    use crate::protocol::{Message, MessageBody, PROTOCOL_VERSION};

    struct FixedHandler(bool);

    impl IncomingConnectionHandler for FixedHandler {
        fn on_incoming_connection(&self, _connection: ManagedConnection) -> bool {
            self.0
        }

        fn can_connect(&self, _peer: &PeerDescriptor) -> bool {
            true
        }
    }

    fn descriptor(byte: u8) -> PeerDescriptor {
        PeerDescriptor::new(NodeId::new(vec![byte; 8]))
    }

    fn context(accept: bool) -> ConnectorContext {
        ConnectorContext {
            local_peer_descriptor: descriptor(1),
            handler: Arc::new(FixedHandler(accept)),
            signaling: None,
        }
    }

    fn request_to(target: PeerDescriptor) -> HandshakeRequest {
        HandshakeRequest {
            source_descriptor: descriptor(2),
            target_descriptor: Some(target),
            protocol_version: PROTOCOL_VERSION.into(),
            connection_id: ConnectionId::from("chosen-by-dialer"),
        }
    }

    fn response_error(raw: &RecordingConnection) -> Option<HandshakeError> {
        let sent = raw.sent_messages();
        match sent.first().map(|message: &Message| &message.body) {
            Some(MessageBody::HandshakeResponse(response)) => response.error,
            other => panic!("expected handshake response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn admitted_connection_completes_handshake() {
        let (raw, handle) = RecordingConnection::handle();
        let connection =
            ManagedConnection::incoming(descriptor(1), descriptor(2), ConnectionType::Simulator, Some(handle));
        assert!(admit_incoming(&context(true), &connection, &request_to(descriptor(1))).await);
        assert!(connection.is_handshake_completed());
        assert_eq!(connection.connection_id().as_str(), "chosen-by-dialer");
        assert_eq!(response_error(&raw), None);
    }

    #[tokio::test]
    async fn losing_duplicate_race_rejects_and_closes() {
        let (raw, handle) = RecordingConnection::handle();
        let connection =
            ManagedConnection::incoming(descriptor(1), descriptor(2), ConnectionType::Simulator, Some(handle));
        assert!(!admit_incoming(&context(false), &connection, &request_to(descriptor(1))).await);
        assert_eq!(response_error(&raw), Some(HandshakeError::Duplicate));
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn wrong_target_is_rejected_before_the_handler_runs() {
        let (raw, handle) = RecordingConnection::handle();
        let connection =
            ManagedConnection::incoming(descriptor(1), descriptor(2), ConnectionType::Simulator, Some(handle));
        assert!(!admit_incoming(&context(true), &connection, &request_to(descriptor(9))).await);
        assert_eq!(response_error(&raw), Some(HandshakeError::InvalidTargetPeerDescriptor));
    }

    #[tokio::test]
    async fn pending_entry_is_dropped_once_settled() {
        let pending = PendingConnections::default();
        let (_raw, handle) = RecordingConnection::handle();
        let connection =
            ManagedConnection::outgoing(descriptor(1), descriptor(2), ConnectionType::Simulator, handle);
        pending.insert_until_settled(connection.clone());
        assert!(pending.contains(&descriptor(2).key()));

        connection.close(false).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(!pending.contains(&descriptor(2).key()));
    }
}
