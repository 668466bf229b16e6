//! Peer connection table with duplicate resolution, locking and garbage
//! collection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ConnectionManagerConfig;
use crate::connection::simulator::Simulator;
use crate::connection::webrtc::WebrtcConnector;
use crate::connection::websocket::WebsocketConnector;
use crate::connection::{
    Connector, ConnectorContext, IncomingConnectionHandler, ManagedConnection, ManagedEvent,
};
use crate::duplicate::DuplicateDetector;
use crate::error::{ConnectionError, Result};
use crate::gc::{select_for_disconnect, GcCandidate};
use crate::identifiers::{is_peer_id_smaller, NodeId, PeerDescriptor, PeerKey};
use crate::locks::ConnectionLockHandler;
use crate::protocol::{
    DisconnectMode, LockId, Message, MessageBody, RpcBody, RpcKind, RpcMessage, CONTROL_SERVICE_ID,
};
use crate::rpc::RpcCommunicator;
use crate::transport::{EventBus, SendOptions, Transport, TransportEvent, TransportEvents};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Owns every connection of the local node. Cloning yields another handle to
/// the same manager.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionManagerConfig,
    local: RwLock<PeerDescriptor>,
    state: Mutex<ManagerState>,
    connections: Mutex<HashMap<PeerKey, ManagedConnection>>,
    locks: Mutex<ConnectionLockHandler>,
    duplicates: Mutex<DuplicateDetector>,
    rpc: RpcCommunicator,
    connectors: Vec<Arc<dyn Connector>>,
    signaling: Option<Arc<dyn Transport>>,
    events: EventBus,
    /// Peers a `Connected` event went out for, until their `Disconnected`.
    announced: Mutex<HashSet<PeerKey>>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// A manager with WebSocket and WebRTC connectors. Signaling for both runs
    /// over `signaling`, or over the manager's own connections when `None`.
    pub fn new(
        config: ConnectionManagerConfig,
        local: PeerDescriptor,
        signaling: Option<Arc<dyn Transport>>,
    ) -> Self {
        let connectors: Vec<Arc<dyn Connector>> = vec![
            Arc::new(WebsocketConnector::new(config.websocket.clone())),
            Arc::new(WebrtcConnector::new(config.webrtc.clone())),
        ];
        Self::with_connectors(config, local, connectors, signaling)
    }

    pub fn simulated(
        config: ConnectionManagerConfig,
        local: PeerDescriptor,
        simulator: &Simulator,
    ) -> Self {
        Self::with_connectors(config, local, vec![Arc::new(simulator.connector())], None)
    }

    /// Connectors are tried in order; the first that can reach a peer is used.
    pub fn with_connectors(
        config: ConnectionManagerConfig,
        local: PeerDescriptor,
        connectors: Vec<Arc<dyn Connector>>,
        signaling: Option<Arc<dyn Transport>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                rpc: RpcCommunicator::new(CONTROL_SERVICE_ID, config.rpc_request_timeout),
                duplicates: Mutex::new(DuplicateDetector::new(config.duplicate_detector_capacity)),
                config,
                local: RwLock::new(local),
                state: Mutex::new(ManagerState::Idle),
                connections: Mutex::new(HashMap::new()),
                locks: Mutex::new(ConnectionLockHandler::new()),
                connectors,
                signaling,
                events: EventBus::new(),
                announced: Mutex::new(HashSet::new()),
                gc_task: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.inner.state.lock()
    }

    pub fn local_peer_descriptor(&self) -> PeerDescriptor {
        self.inner.local.read().clone()
    }

    pub fn subscribe(&self) -> TransportEvents {
        self.inner.events.subscribe()
    }

    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ManagerState::Idle {
                return Err(ConnectionError::CouldNotStart(format!(
                    "connection manager is {:?}",
                    *state
                )));
            }
            *state = ManagerState::Running;
        }
        if let Err(err) = self.start_connectors().await {
            *self.inner.state.lock() = ManagerState::Stopped;
            for connector in &self.inner.connectors {
                connector.stop().await;
            }
            return Err(err);
        }

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.gc_interval;
        *self.inner.gc_task.lock() = Some(tokio::spawn(run_gc(weak, interval)));

        tracing::info!(
            target = "dht::connection_manager",
            node_id = %self.local_peer_descriptor().node_id,
            websocket = ?self.local_peer_descriptor().websocket,
            "connection manager started"
        );
        Ok(())
    }

    async fn start_connectors(&self) -> Result<()> {
        for connector in &self.inner.connectors {
            match connector.listen().await {
                Ok(Some(endpoint)) => {
                    self.inner.local.write().websocket = Some(endpoint);
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(ConnectionError::CouldNotStart(format!(
                        "{} connector failed to listen: {err}",
                        connector.name()
                    )));
                }
            }
        }
        let context = ConnectorContext {
            local_peer_descriptor: self.local_peer_descriptor(),
            handler: Arc::new(ManagerHandler(Arc::downgrade(&self.inner))),
            signaling: Some(self.signaling()),
        };
        for connector in &self.inner.connectors {
            connector.start(context.clone()).await.map_err(|err| {
                ConnectionError::CouldNotStart(format!("{} connector: {err}", connector.name()))
            })?;
        }
        Ok(())
    }

    fn signaling(&self) -> Arc<dyn Transport> {
        match &self.inner.signaling {
            Some(signaling) => signaling.clone(),
            None => {
                let signaled: Vec<&str> = self
                    .inner
                    .connectors
                    .iter()
                    .filter(|connector| connector.needs_signaling())
                    .map(|connector| connector.name())
                    .collect();
                if !signaled.is_empty() {
                    tracing::warn!(
                        target = "dht::connection_manager",
                        connectors = ?signaled,
                        "no signaling transport configured; these connectors can only signal over existing connections"
                    );
                }
                Arc::new(OwnConnectionsSignaling(Arc::downgrade(&self.inner)))
            }
        }
    }

    /// Leaves the network: connections with a completed handshake get a
    /// `Leaving` notice, the rest are closed.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != ManagerState::Running {
                return;
            }
            *state = ManagerState::Stopping;
        }
        if let Some(task) = self.inner.gc_task.lock().take() {
            task.abort();
        }

        let connections: Vec<ManagedConnection> =
            self.inner.connections.lock().values().cloned().collect();
        let disconnect_timeout = self.inner.config.disconnect_timeout;
        join_all(connections.into_iter().map(|connection| async move {
            if connection.is_handshake_completed() {
                self.disconnect_connection(connection, DisconnectMode::Leaving)
                    .await;
            } else {
                let _ = tokio::time::timeout(disconnect_timeout, connection.disconnected()).await;
                connection
                    .close_with_reason(false, Some("connection manager stopped".into()))
                    .await;
            }
        }))
        .await;

        for connector in &self.inner.connectors {
            connector.stop().await;
        }
        self.inner.rpc.cancel_all();
        self.inner.connections.lock().clear();
        self.inner.announced.lock().clear();
        *self.inner.state.lock() = ManagerState::Stopped;
        tracing::info!(target = "dht::connection_manager", "connection manager stopped");
    }

    /// Queues `message` for its target, opening a connection unless
    /// `options.do_not_connect` is set.
    pub async fn send(&self, message: Message, options: SendOptions) -> Result<()> {
        if self.state() != ManagerState::Running {
            return Err(ConnectionError::SendFailed(
                "connection manager is not running".into(),
            ));
        }
        let target = message
            .target_descriptor
            .clone()
            .ok_or_else(|| ConnectionError::SendFailed("message has no target".into()))?;
        if self.is_connection_to_self(&target) {
            return Err(ConnectionError::CannotConnectToSelf(target.key().to_string()));
        }
        let bytes = message.with_source(self.local_peer_descriptor()).encode()?;

        let connection = match self.get_connection(&target) {
            Some(connection) => connection,
            None if options.do_not_connect => {
                return Err(ConnectionError::SendFailed(format!(
                    "no connection to {}",
                    target.key()
                )));
            }
            None => self.connect_to(&target)?,
        };
        connection.send(bytes)
    }

    fn connect_to(&self, target: &PeerDescriptor) -> Result<ManagedConnection> {
        let local = self.local_peer_descriptor();
        let connector = self
            .inner
            .connectors
            .iter()
            .find(|connector| connector.can_form_connection(&local, target))
            .ok_or_else(|| {
                ConnectionError::SendFailed(format!("no connector can reach {}", target.key()))
            })?;
        tracing::debug!(
            target = "dht::connection_manager",
            peer = %target.key(),
            connector = connector.name(),
            "opening connection"
        );
        let connection = connector.connect(target)?;
        Ok(self.register_outgoing(connection))
    }

    fn is_connection_to_self(&self, target: &PeerDescriptor) -> bool {
        let local = self.inner.local.read();
        if local.node_id == target.node_id {
            return true;
        }
        match (&local.websocket, &target.websocket) {
            (Some(own), Some(theirs)) => own.same_address(theirs),
            _ => false,
        }
    }

    fn register_outgoing(&self, connection: ManagedConnection) -> ManagedConnection {
        let key = connection.remote_peer_descriptor().key();
        {
            let mut connections = self.inner.connections.lock();
            if let Some(existing) = connections.get(&key) {
                if existing.same_as(&connection) {
                    return existing.clone();
                }
                let existing = existing.clone();
                drop(connections);
                tracing::debug!(
                    target = "dht::connection_manager",
                    peer = %key,
                    "connection formed concurrently, keeping the existing one"
                );
                tokio::spawn(async move {
                    connection
                        .close_with_reason(false, Some("superseded by existing connection".into()))
                        .await;
                });
                return existing;
            }
            connections.insert(key, connection.clone());
        }
        self.watch_connection(connection.clone());
        connection
    }

    /// Adds a connection created on behalf of a remote peer. A second
    /// connection to the same peer replaces the first one only when the remote
    /// id is the smaller one, so both ends keep the same connection.
    pub fn accept_new_connection(&self, connection: ManagedConnection) -> bool {
        if self.state() != ManagerState::Running {
            return false;
        }
        let remote = connection.remote_peer_descriptor().clone();
        let key = remote.key();
        let replaced = {
            let mut connections = self.inner.connections.lock();
            match connections.get(&key) {
                Some(existing) if existing.same_as(&connection) => return true,
                Some(existing) => {
                    let local_id = self.inner.local.read().node_id.clone();
                    if !is_peer_id_smaller(&remote.node_id, &local_id) {
                        tracing::debug!(
                            target = "dht::connection_manager",
                            peer = %key,
                            "rejecting duplicate connection"
                        );
                        return false;
                    }
                    let existing = existing.clone();
                    for data in existing.steal_output_buffer() {
                        if let Err(err) = connection.send(data) {
                            tracing::warn!(
                                target = "dht::connection_manager",
                                peer = %key,
                                error = %err,
                                "failed to move buffered message to replacing connection"
                            );
                        }
                    }
                    existing.report_buffer_sent_by_other_connection();
                    connections.insert(key.clone(), connection.clone());
                    Some(existing)
                }
                None => {
                    connections.insert(key.clone(), connection.clone());
                    None
                }
            }
        };
        if let Some(old) = replaced {
            tracing::debug!(
                target = "dht::connection_manager",
                peer = %key,
                old_connection_id = %old.connection_id(),
                "replacing connection with duplicate"
            );
            tokio::spawn(async move {
                old.close_with_reason(false, Some("replaced by duplicate connection".into()))
                    .await;
            });
        }
        self.watch_connection(connection);
        true
    }

    fn watch_connection(&self, connection: ManagedConnection) {
        let Some(mut events) = connection.take_events() else {
            tracing::warn!(
                target = "dht::connection_manager",
                peer = %connection.remote_peer_descriptor().key(),
                "connection events already taken"
            );
            return;
        };
        self.inner
            .events
            .publish(TransportEvent::NewConnection(connection.clone()));
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = ConnectionManager { inner };
                match event {
                    ManagedEvent::HandshakeCompleted(peer) => {
                        manager.on_handshake_completed(&connection, peer)
                    }
                    ManagedEvent::Data(bytes) => manager.on_data(&connection, bytes).await,
                    ManagedEvent::Disconnected { graceful, reason } => {
                        manager.on_disconnected(&connection, graceful, reason);
                        break;
                    }
                }
            }
        });
    }

    fn is_current(&self, connection: &ManagedConnection) -> bool {
        self.inner
            .connections
            .lock()
            .get(&connection.remote_peer_descriptor().key())
            .is_some_and(|current| current.same_as(connection))
    }

    fn on_handshake_completed(&self, connection: &ManagedConnection, peer: PeerDescriptor) {
        if !self.is_current(connection) {
            return;
        }
        if !self.inner.announced.lock().insert(peer.key()) {
            tracing::trace!(
                target = "dht::connection_manager",
                peer = %peer.key(),
                connection_id = %connection.connection_id(),
                "replacement connection ready"
            );
            return;
        }
        tracing::debug!(
            target = "dht::connection_manager",
            peer = %peer.key(),
            connection_type = %connection.connection_type(),
            connection_id = %connection.connection_id(),
            "connected"
        );
        self.inner.events.publish(TransportEvent::Connected(peer));
    }

    async fn on_data(&self, connection: &ManagedConnection, bytes: Bytes) {
        let message = match Message::decode(&bytes) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(
                    target = "dht::connection_manager",
                    peer = %connection.remote_peer_descriptor().key(),
                    error = %err,
                    "dropping undecodable message"
                );
                return;
            }
        };
        if self
            .inner
            .duplicates
            .lock()
            .check_and_record(&message.message_id)
        {
            tracing::trace!(
                target = "dht::connection_manager",
                message_id = %message.message_id,
                "dropping duplicate message"
            );
            return;
        }
        match message.body {
            MessageBody::Rpc(rpc) if message.service_id == CONTROL_SERVICE_ID => {
                self.on_control_rpc(connection, rpc).await;
            }
            _ => {
                self.inner.events.publish(TransportEvent::Message(message));
            }
        }
    }

    fn on_disconnected(&self, connection: &ManagedConnection, graceful: bool, reason: Option<String>) {
        let peer = connection.remote_peer_descriptor().clone();
        let key = peer.key();
        let removed = {
            let mut connections = self.inner.connections.lock();
            if connections
                .get(&key)
                .is_some_and(|current| current.same_as(connection))
            {
                connections.remove(&key);
                true
            } else {
                false
            }
        };
        if !removed {
            tracing::trace!(
                target = "dht::connection_manager",
                peer = %key,
                "replaced connection closed"
            );
            return;
        }
        self.inner.locks.lock().clear_all_locks(&key);
        tracing::debug!(
            target = "dht::connection_manager",
            peer = %key,
            graceful,
            reason = reason.as_deref().unwrap_or(""),
            "disconnected"
        );
        if self.inner.announced.lock().remove(&key) {
            self.inner
                .events
                .publish(TransportEvent::Disconnected { peer, graceful });
        }
    }

    async fn on_control_rpc(&self, connection: &ManagedConnection, rpc: RpcMessage) {
        if rpc.kind == RpcKind::Response {
            self.inner.rpc.handle_response(rpc);
            return;
        }
        let peer = connection.remote_peer_descriptor().clone();
        let key = peer.key();
        match &rpc.body {
            RpcBody::LockRequest { lock_id } => {
                self.inner
                    .locks
                    .lock()
                    .add_remote_locked(key.clone(), lock_id.clone());
                tracing::trace!(target = "dht::connection_manager", peer = %key, lock_id = %lock_id, "remote lock");
                let response = self
                    .inner
                    .rpc
                    .response(&peer, &rpc, RpcBody::LockResponse { accepted: true });
                self.reply(connection, response);
            }
            RpcBody::UnlockRequest { lock_id } => {
                self.inner.locks.lock().remove_remote_locked(&key, lock_id);
                tracing::trace!(target = "dht::connection_manager", peer = %key, lock_id = %lock_id, "remote unlock");
            }
            RpcBody::DisconnectNotice { mode } => {
                tracing::debug!(target = "dht::connection_manager", peer = %key, mode = ?mode, "disconnect notice");
                self.inner.locks.lock().clear_all_locks(&key);
                let response = self
                    .inner
                    .rpc
                    .response(&peer, &rpc, RpcBody::DisconnectNoticeResponse);
                self.reply(connection, response);
                connection
                    .close_with_reason(
                        *mode == DisconnectMode::Leaving,
                        Some("disconnect notice".into()),
                    )
                    .await;
            }
            other => {
                tracing::debug!(
                    target = "dht::connection_manager",
                    peer = %key,
                    body = ?other,
                    "unexpected control message"
                );
            }
        }
    }

    /// Sends on `connection` directly so replies work while stopping.
    fn reply(&self, connection: &ManagedConnection, message: Message) {
        let result = message
            .with_source(self.local_peer_descriptor())
            .encode()
            .and_then(|bytes| connection.send(bytes));
        if let Err(err) = result {
            tracing::debug!(
                target = "dht::connection_manager",
                peer = %connection.remote_peer_descriptor().key(),
                error = %err,
                "failed to send control response"
            );
        }
    }

    pub fn has_connection(&self, peer: &PeerDescriptor) -> bool {
        self.inner.connections.lock().contains_key(&peer.key())
    }

    pub fn get_connection(&self, peer: &PeerDescriptor) -> Option<ManagedConnection> {
        self.inner.connections.lock().get(&peer.key()).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn get_all_connection_peer_descriptors(&self) -> Vec<PeerDescriptor> {
        self.inner
            .connections
            .lock()
            .values()
            .filter(|connection| connection.is_handshake_completed())
            .map(|connection| connection.remote_peer_descriptor().clone())
            .collect()
    }

    /// Marks the connection as needed by `lock_id` and asks the peer to do the
    /// same. The local lock holds whether or not the peer answers.
    pub fn lock_connection(&self, target: &PeerDescriptor, lock_id: impl Into<LockId>) {
        if self.is_connection_to_self(target) {
            return;
        }
        let lock_id = lock_id.into();
        self.inner
            .locks
            .lock()
            .add_local_locked(target.key(), lock_id.clone());
        let (message, pending) = self
            .inner
            .rpc
            .request(target, RpcBody::LockRequest { lock_id });
        let manager = self.clone();
        let peer = target.key();
        tokio::spawn(async move {
            if let Err(err) = manager.send(message, SendOptions::default()).await {
                pending.cancel();
                tracing::debug!(target = "dht::connection_manager", peer = %peer, error = %err, "lock request not sent");
                return;
            }
            match pending.wait().await {
                Ok(RpcBody::LockResponse { accepted }) => {
                    tracing::trace!(target = "dht::connection_manager", peer = %peer, accepted, "lock response");
                }
                Ok(other) => {
                    tracing::debug!(target = "dht::connection_manager", peer = %peer, body = ?other, "unexpected lock response");
                }
                Err(err) => {
                    tracing::debug!(target = "dht::connection_manager", peer = %peer, error = %err, "lock request failed");
                }
            }
        });
    }

    pub fn unlock_connection(&self, target: &PeerDescriptor, lock_id: &str) {
        if self.is_connection_to_self(target) {
            return;
        }
        self.inner
            .locks
            .lock()
            .remove_local_locked(&target.key(), lock_id);
        if self.state() != ManagerState::Running {
            return;
        }
        let message = self.inner.rpc.notification(
            target,
            RpcBody::UnlockRequest {
                lock_id: lock_id.to_string(),
            },
        );
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.send(message, SendOptions::do_not_connect()).await {
                tracing::trace!(target = "dht::connection_manager", error = %err, "unlock request not sent");
            }
        });
    }

    pub fn weak_lock_connection(&self, target: &PeerDescriptor) {
        if self.is_connection_to_self(target) {
            return;
        }
        self.inner.locks.lock().add_weak_locked(target.key());
    }

    pub fn weak_unlock_connection(&self, target: &PeerDescriptor) {
        self.inner.locks.lock().remove_weak_locked(&target.key());
    }

    pub fn is_connection_locked(&self, peer: &PeerDescriptor) -> bool {
        self.inner.locks.lock().is_locked(&peer.key())
    }

    pub fn is_local_locked(&self, peer: &PeerDescriptor, lock_id: Option<&str>) -> bool {
        self.inner.locks.lock().is_local_locked(&peer.key(), lock_id)
    }

    pub fn is_remote_locked(&self, peer: &PeerDescriptor, lock_id: Option<&str>) -> bool {
        self.inner.locks.lock().is_remote_locked(&peer.key(), lock_id)
    }

    pub fn local_locked_count(&self) -> usize {
        self.inner.locks.lock().local_locked_count()
    }

    pub fn remote_locked_count(&self) -> usize {
        self.inner.locks.lock().remote_locked_count()
    }

    pub fn weak_locked_count(&self) -> usize {
        self.inner.locks.lock().weak_locked_count()
    }

    /// Sends a disconnect notice and waits for the peer to close, force
    /// closing once the disconnect timeout passes.
    pub async fn gracefully_disconnect(&self, peer: &PeerDescriptor, mode: DisconnectMode) {
        if let Some(connection) = self.get_connection(peer) {
            self.disconnect_connection(connection, mode).await;
        }
    }

    async fn disconnect_connection(&self, connection: ManagedConnection, mode: DisconnectMode) {
        let timeout = self.inner.config.disconnect_timeout;
        let peer = connection.remote_peer_descriptor().clone();
        let (message, pending) =
            self.inner
                .rpc
                .request_with_timeout(&peer, RpcBody::DisconnectNotice { mode }, timeout);
        self.reply(&connection, message);
        tokio::select! {
            _ = connection.disconnected() => {}
            _ = tokio::time::sleep(timeout) => {
                tracing::debug!(
                    target = "dht::connection_manager",
                    peer = %peer.key(),
                    "disconnect notice timed out, closing"
                );
            }
        }
        pending.cancel();
        connection
            .close_with_reason(mode == DisconnectMode::Leaving, Some("graceful disconnect".into()))
            .await;
    }

    /// Disconnects idle unlocked connections until at most `max_connections`
    /// remain. Returns how many were disconnected.
    pub async fn garbage_collect_connections(
        &self,
        max_connections: usize,
        idle_threshold: Duration,
    ) -> usize {
        let (excess, candidates) = {
            let connections = self.inner.connections.lock();
            if connections.len() <= max_connections {
                return 0;
            }
            let locks = self.inner.locks.lock();
            let now = Instant::now();
            let candidates: Vec<GcCandidate> = connections
                .iter()
                .filter(|(key, connection)| {
                    connection.is_handshake_completed() && !locks.is_locked(key)
                })
                .map(|(_, connection)| GcCandidate {
                    peer: connection.remote_peer_descriptor().clone(),
                    idle: now.saturating_duration_since(connection.last_used()),
                })
                .filter(|candidate| candidate.idle >= idle_threshold)
                .collect();
            (connections.len() - max_connections, candidates)
        };
        let local = self.inner.local.read().node_id.clone();
        let chosen = select_for_disconnect(&local, candidates, excess);
        if chosen.is_empty() {
            return 0;
        }
        tracing::debug!(
            target = "dht::connection_manager",
            count = chosen.len(),
            "garbage collecting connections"
        );
        let count = chosen.len();
        join_all(
            chosen
                .iter()
                .map(|peer| self.gracefully_disconnect(peer, DisconnectMode::Normal)),
        )
        .await;
        count
    }
}

async fn run_gc(inner: Weak<Inner>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = ConnectionManager { inner };
        let max = manager.inner.config.max_connections;
        let idle = manager.inner.config.gc_idle_threshold;
        manager.garbage_collect_connections(max, idle).await;
    }
}

#[async_trait]
impl Transport for ConnectionManager {
    async fn send(&self, message: Message, options: SendOptions) -> Result<()> {
        ConnectionManager::send(self, message, options).await
    }

    fn local_peer_descriptor(&self) -> PeerDescriptor {
        ConnectionManager::local_peer_descriptor(self)
    }

    fn subscribe(&self) -> TransportEvents {
        ConnectionManager::subscribe(self)
    }
}

struct ManagerHandler(Weak<Inner>);

impl ManagerHandler {
    fn manager(&self) -> Option<ConnectionManager> {
        self.0.upgrade().map(|inner| ConnectionManager { inner })
    }
}

impl IncomingConnectionHandler for ManagerHandler {
    fn on_incoming_connection(&self, connection: ManagedConnection) -> bool {
        self.manager()
            .is_some_and(|manager| manager.accept_new_connection(connection))
    }

    fn can_connect(&self, peer: &PeerDescriptor) -> bool {
        self.manager().is_some_and(|manager| {
            manager.state() == ManagerState::Running && !manager.has_connection(peer)
        })
    }
}

/// Signaling over the manager's own connections, used when no routing layer
/// provides a transport. Never opens connections for signaling traffic.
struct OwnConnectionsSignaling(Weak<Inner>);

#[async_trait]
impl Transport for OwnConnectionsSignaling {
    async fn send(&self, message: Message, _options: SendOptions) -> Result<()> {
        let inner = self
            .0
            .upgrade()
            .ok_or_else(|| ConnectionError::SendFailed("connection manager dropped".into()))?;
        let manager = ConnectionManager { inner };
        // A connection still in its handshake would only buffer the message.
        let routable = message
            .target_descriptor
            .as_ref()
            .and_then(|target| manager.get_connection(target))
            .is_some_and(|connection| connection.is_handshake_completed());
        if !routable {
            return Err(ConnectionError::SendFailed(
                "no established connection for signaling".into(),
            ));
        }
        manager.send(message, SendOptions::do_not_connect()).await
    }

    fn local_peer_descriptor(&self) -> PeerDescriptor {
        match self.0.upgrade() {
            Some(inner) => inner.local.read().clone(),
            None => PeerDescriptor::new(NodeId::new(Vec::new())),
        }
    }

    fn subscribe(&self) -> TransportEvents {
        match self.0.upgrade() {
            Some(inner) => inner.events.subscribe(),
            None => tokio::sync::mpsc::unbounded_channel().1,
        }
    }
}
