//! In-process transport used to run many nodes inside one test.
//!
//! Every connector registers under its node id with a shared [`Simulator`].
//! Connections are pairs of in-memory pipes. An optional fixed latency delays
//! every delivery while keeping per-direction ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::connector::{admit_incoming, Connector, ConnectorContext, PendingConnections};
use super::handshake;
use super::managed::ManagedConnection;
use super::{ConnectionEvents, ConnectionType, RawConnection, RawConnectionHandle, RawEventSink};
use crate::error::{ConnectionError, Result};
use crate::identifiers::{ConnectionId, PeerDescriptor, PeerKey};

const SIMULATOR_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
pub struct Simulator {
    inner: Arc<SimulatorInner>,
}

#[derive(Default)]
struct SimulatorInner {
    connectors: Mutex<HashMap<PeerKey, Weak<ConnectorInner>>>,
    latency: Option<Duration>,
}

impl Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Arc::new(SimulatorInner {
                connectors: Mutex::new(HashMap::new()),
                latency: Some(latency),
            }),
        }
    }

    pub fn latency(&self) -> Duration {
        self.inner.latency.unwrap_or(Duration::ZERO)
    }

    pub fn connector(&self) -> SimulatorConnector {
        SimulatorConnector {
            inner: Arc::new(ConnectorInner {
                simulator: self.clone(),
                context: Mutex::new(None),
                pending: PendingConnections::default(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn registered_count(&self) -> usize {
        self.inner
            .connectors
            .lock()
            .values()
            .filter(|connector| connector.strong_count() > 0)
            .count()
    }

    fn register(&self, key: PeerKey, connector: &Arc<ConnectorInner>) {
        self.inner
            .connectors
            .lock()
            .insert(key, Arc::downgrade(connector));
    }

    fn unregister(&self, key: &PeerKey) {
        self.inner.connectors.lock().remove(key);
    }

    fn lookup(&self, key: &PeerKey) -> Option<Arc<ConnectorInner>> {
        self.inner.connectors.lock().get(key).and_then(Weak::upgrade)
    }
}

enum Delivery {
    Data(Bytes),
    Close {
        graceful: bool,
        reason: Option<String>,
    },
}

/// One end of an in-memory connection pair.
pub struct SimulatorConnection {
    id: ConnectionId,
    sink: Arc<RawEventSink>,
    outbound: mpsc::UnboundedSender<(Instant, Delivery)>,
    latency: Duration,
}

impl SimulatorConnection {
    fn pair(
        latency: Duration,
    ) -> (
        (Arc<SimulatorConnection>, ConnectionEvents),
        (Arc<SimulatorConnection>, ConnectionEvents),
    ) {
        let id = ConnectionId::new();
        let (a_sink, a_events) = RawEventSink::channel();
        let (b_sink, b_events) = RawEventSink::channel();
        let (a_to_b, a_to_b_rx) = mpsc::unbounded_channel();
        let (b_to_a, b_to_a_rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(a_to_b_rx, b_sink.clone()));
        tokio::spawn(deliver(b_to_a_rx, a_sink.clone()));
        let a = Arc::new(SimulatorConnection {
            id: id.clone(),
            sink: a_sink,
            outbound: a_to_b,
            latency,
        });
        let b = Arc::new(SimulatorConnection {
            id,
            sink: b_sink,
            outbound: b_to_a,
            latency,
        });
        ((a, a_events), (b, b_events))
    }

    fn mark_connected(&self) {
        self.sink.connected();
    }

    fn deliver_at(&self) -> Instant {
        Instant::now() + self.latency
    }
}

async fn deliver(
    mut deliveries: mpsc::UnboundedReceiver<(Instant, Delivery)>,
    sink: Arc<RawEventSink>,
) {
    while let Some((deliver_at, delivery)) = deliveries.recv().await {
        tokio::time::sleep_until(deliver_at).await;
        match delivery {
            Delivery::Data(data) => sink.data(data),
            Delivery::Close { graceful, reason } => {
                sink.disconnected(graceful, reason);
                break;
            }
        }
    }
}

#[async_trait]
impl RawConnection for SimulatorConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id.clone()
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Simulator
    }

    fn send(&self, data: Bytes) -> Result<()> {
        if self.sink.is_disconnected() {
            return Err(ConnectionError::SendFailed("simulator connection closed".into()));
        }
        self.outbound
            .send((self.deliver_at(), Delivery::Data(data)))
            .map_err(|_| ConnectionError::SendFailed("simulator peer is gone".into()))
    }

    async fn close(&self, graceful: bool, reason: Option<String>) {
        if !self.sink.disconnected(graceful, reason.clone()) {
            return;
        }
        let _ = self
            .outbound
            .send((self.deliver_at(), Delivery::Close { graceful, reason }));
    }
}

#[derive(Clone)]
pub struct SimulatorConnector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    simulator: Simulator,
    context: Mutex<Option<ConnectorContext>>,
    pending: PendingConnections,
    stopped: AtomicBool,
}

impl ConnectorInner {
    fn context(&self) -> Option<ConnectorContext> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        self.context.lock().clone()
    }

    async fn accept_incoming(&self, raw: Arc<SimulatorConnection>, mut events: ConnectionEvents) {
        let Some(context) = self.context() else {
            raw.close(false, Some("simulated peer is not running".into())).await;
            return;
        };
        let request = match handshake::await_request(&mut events, SIMULATOR_HANDSHAKE_TIMEOUT).await {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(target = "dht::simulator", error = %err, "incoming handshake failed");
                raw.close(false, Some(err.to_string())).await;
                return;
            }
        };
        let managed = ManagedConnection::incoming(
            context.local_peer_descriptor.clone(),
            request.source_descriptor.clone(),
            ConnectionType::Simulator,
            Some(RawConnectionHandle::new(raw, events)),
        );
        admit_incoming(&context, &managed, &request).await;
    }
}

#[async_trait]
impl Connector for SimulatorConnector {
    fn name(&self) -> &'static str {
        "simulator"
    }

    async fn start(&self, context: ConnectorContext) -> Result<()> {
        self.inner
            .simulator
            .register(context.local_peer_descriptor.key(), &self.inner);
        *self.inner.context.lock() = Some(context);
        Ok(())
    }

    fn can_form_connection(&self, _local: &PeerDescriptor, _target: &PeerDescriptor) -> bool {
        true
    }

    fn connect(&self, target: &PeerDescriptor) -> Result<ManagedConnection> {
        let context = self
            .inner
            .context()
            .ok_or_else(|| ConnectionError::SendFailed("simulator connector is not running".into()))?;
        let local = context.local_peer_descriptor;
        if local.node_id == target.node_id {
            return Err(ConnectionError::CannotConnectToSelf(target.key().to_string()));
        }
        let key = target.key();
        if let Some(existing) = self.inner.pending.get(&key) {
            return Ok(existing);
        }

        let latency = self.inner.simulator.latency();
        let ((local_end, local_events), (remote_end, remote_events)) =
            SimulatorConnection::pair(latency);
        let managed = ManagedConnection::outgoing(
            local,
            target.clone(),
            ConnectionType::Simulator,
            RawConnectionHandle::new(local_end.clone(), local_events),
        );
        self.inner.pending.insert_until_settled(managed.clone());

        let simulator = self.inner.simulator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let Some(remote) = simulator.lookup(&key) else {
                tracing::debug!(target = "dht::simulator", peer = %key, "simulated peer not found");
                local_end
                    .close(false, Some("simulated peer not found".into()))
                    .await;
                return;
            };
            remote_end.mark_connected();
            local_end.mark_connected();
            remote.accept_incoming(remote_end, remote_events).await;
        });
        Ok(managed)
    }

    async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let context = self.inner.context.lock().take();
        if let Some(context) = context {
            self.inner
                .simulator
                .unregister(&context.local_peer_descriptor.key());
        }
        for connection in self.inner.pending.drain() {
            connection.close(false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionEvent, IncomingConnectionHandler, ManagedEvent};
    use crate::identifiers::NodeId;

    struct AcceptAll(Mutex<Vec<ManagedConnection>>);

    impl IncomingConnectionHandler for AcceptAll {
        fn on_incoming_connection(&self, connection: ManagedConnection) -> bool {
            self.0.lock().push(connection);
            true
        }

        fn can_connect(&self, _peer: &PeerDescriptor) -> bool {
            true
        }
    }

    fn descriptor(byte: u8) -> PeerDescriptor {
        PeerDescriptor::new(NodeId::new(vec![byte; 8]))
    }

    async fn started(
        simulator: &Simulator,
        local: PeerDescriptor,
    ) -> (SimulatorConnector, Arc<AcceptAll>) {
        let connector = simulator.connector();
        let handler = Arc::new(AcceptAll(Mutex::new(Vec::new())));
        connector
            .start(ConnectorContext {
                local_peer_descriptor: local,
                handler: handler.clone(),
                signaling: None,
            })
            .await
            .unwrap();
        (connector, handler)
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_but_preserves_order() {
        let ((a, _a_events), (_b, mut b_events)) = SimulatorConnection::pair(Duration::from_millis(100));
        let start = Instant::now();
        a.send(Bytes::from_static(b"1")).unwrap();
        a.send(Bytes::from_static(b"2")).unwrap();

        assert_eq!(b_events.recv().await, Some(ConnectionEvent::Data(Bytes::from_static(b"1"))));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(b_events.recv().await, Some(ConnectionEvent::Data(Bytes::from_static(b"2"))));
    }

    #[tokio::test]
    async fn closing_one_end_disconnects_the_other() {
        let ((a, mut a_events), (_b, mut b_events)) = SimulatorConnection::pair(Duration::ZERO);
        a.close(true, Some("leaving".into())).await;
        assert_eq!(
            b_events.recv().await,
            Some(ConnectionEvent::Disconnected {
                graceful: true,
                reason: Some("leaving".into())
            })
        );
        assert!(matches!(a_events.recv().await, Some(ConnectionEvent::Disconnected { .. })));
        assert!(a.send(Bytes::from_static(b"late")).is_err());
    }

    #[tokio::test]
    async fn connect_completes_handshake_on_both_sides() {
        let simulator = Simulator::new();
        let (dialer, _) = started(&simulator, descriptor(1)).await;
        let (_listener, accepted) = started(&simulator, descriptor(2)).await;

        let connection = dialer.connect(&descriptor(2)).unwrap();
        let mut events = connection.take_events().unwrap();
        assert!(matches!(events.recv().await, Some(ManagedEvent::HandshakeCompleted(peer)) if peer == descriptor(2)));

        let incoming = accepted.0.lock().first().cloned().unwrap();
        assert_eq!(incoming.remote_peer_descriptor(), &descriptor(1));
        assert_eq!(incoming.connection_id(), connection.connection_id());
    }

    #[tokio::test]
    async fn missing_peer_closes_the_connection() {
        let simulator = Simulator::new();
        let (dialer, _) = started(&simulator, descriptor(1)).await;
        let connection = dialer.connect(&descriptor(7)).unwrap();
        connection.disconnected().await;
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn connecting_to_self_is_refused() {
        let simulator = Simulator::new();
        let (dialer, _) = started(&simulator, descriptor(1)).await;
        assert!(matches!(
            dialer.connect(&descriptor(1)),
            Err(ConnectionError::CannotConnectToSelf(_))
        ));
    }
}
