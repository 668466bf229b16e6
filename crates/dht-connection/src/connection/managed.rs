use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::handshake;
use super::{ConnectionEvent, ConnectionEvents, ConnectionType, RawConnection, RawConnectionHandle};
use crate::error::{ConnectionError, Result};
use crate::identifiers::{ConnectionId, PeerDescriptor};
use crate::protocol::{HandshakeError, Message, MessageBody};

/// How long a connection rejected as a duplicate keeps its output buffer
/// while waiting for the winning connection to take it over.
const DUPLICATE_REPLACEMENT_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Connected,
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandshakeRole {
    Outgoing,
    Incoming,
}

#[derive(Clone, Debug)]
pub enum ManagedEvent {
    HandshakeCompleted(PeerDescriptor),
    Data(Bytes),
    Disconnected {
        graceful: bool,
        reason: Option<String>,
    },
}

/// Owning wrapper around one raw transport connection to one peer.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct ManagedConnection {
    inner: Arc<Inner>,
}

struct Inner {
    local: PeerDescriptor,
    remote: PeerDescriptor,
    connection_type: ConnectionType,
    role: HandshakeRole,
    state: Mutex<State>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<ManagedEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ManagedEvent>>>,
    closed: AtomicBool,
}

struct State {
    connection_id: ConnectionId,
    raw: Option<Arc<dyn RawConnection>>,
    output_buffer: VecDeque<Bytes>,
    last_used: Instant,
    handshake_completed: bool,
    replaced: bool,
    rejected_as_duplicate: bool,
}

impl ManagedConnection {
    /// A connection this node dialed. It sends the handshake request once the
    /// transport reports `Connected`.
    pub fn outgoing(
        local: PeerDescriptor,
        remote: PeerDescriptor,
        connection_type: ConnectionType,
        raw: RawConnectionHandle,
    ) -> Self {
        let connection = Self::build(
            local,
            remote,
            connection_type,
            HandshakeRole::Outgoing,
            raw.connection.connection_id(),
        );
        connection.attach_implementation(raw);
        connection
    }

    /// A connection the remote dialed. The transport may be attached later.
    pub fn incoming(
        local: PeerDescriptor,
        remote: PeerDescriptor,
        connection_type: ConnectionType,
        raw: Option<RawConnectionHandle>,
    ) -> Self {
        let connection_id = raw
            .as_ref()
            .map(|handle| handle.connection.connection_id())
            .unwrap_or_default();
        let connection = Self::build(
            local,
            remote,
            connection_type,
            HandshakeRole::Incoming,
            connection_id,
        );
        if let Some(raw) = raw {
            connection.attach_implementation(raw);
        }
        connection
    }

    fn build(
        local: PeerDescriptor,
        remote: PeerDescriptor,
        connection_type: ConnectionType,
        role: HandshakeRole,
        connection_id: ConnectionId,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                local,
                remote,
                connection_type,
                role,
                state: Mutex::new(State {
                    connection_id,
                    raw: None,
                    output_buffer: VecDeque::new(),
                    last_used: Instant::now(),
                    handshake_completed: false,
                    replaced: false,
                    rejected_as_duplicate: false,
                }),
                state_tx,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn attach_implementation(&self, handle: RawConnectionHandle) {
        let RawConnectionHandle { connection, events } = handle;
        if self.is_closed() {
            tokio::spawn(async move {
                connection
                    .close(false, Some("managed connection already closed".into()))
                    .await;
            });
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if state.raw.is_some() {
                tracing::debug!(
                    target = "dht::connection",
                    peer = %self.inner.remote.key(),
                    "replacing transport of managed connection"
                );
            }
            state.raw = Some(connection);
        }
        tokio::spawn(pump(Arc::downgrade(&self.inner), events));
    }

    pub fn local_peer_descriptor(&self) -> &PeerDescriptor {
        &self.inner.local
    }

    pub fn remote_peer_descriptor(&self) -> &PeerDescriptor {
        &self.inner.remote
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.inner.connection_type
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.state.lock().connection_id.clone()
    }

    pub fn set_connection_id(&self, connection_id: ConnectionId) {
        self.inner.state.lock().connection_id = connection_id;
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_handshake_completed(&self) -> bool {
        self.inner.state.lock().handshake_completed
    }

    pub fn last_used(&self) -> Instant {
        self.inner.state.lock().last_used
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn same_as(&self, other: &ManagedConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Hands out the event stream. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ManagedEvent>> {
        self.inner.events_rx.lock().take()
    }

    /// Resolves once the connection is closed.
    pub async fn disconnected(&self) {
        let mut rx = self.subscribe_state();
        let _ = rx
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    /// Resolves once the handshake completed or the connection closed.
    pub async fn settled(&self) -> ConnectionState {
        let mut rx = self.subscribe_state();
        let result = rx
            .wait_for(|state| {
                matches!(state, ConnectionState::Connected | ConnectionState::Disconnected)
            })
            .await
            .map(|state| *state);
        result.unwrap_or(ConnectionState::Disconnected)
    }

    /// Sends immediately after the handshake, buffers before it.
    pub fn send(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(ConnectionError::SendFailed(format!(
                "connection to {} is closed",
                self.inner.remote.key()
            )));
        }
        let mut state = self.inner.state.lock();
        if state.replaced {
            return Err(ConnectionError::SendFailed(format!(
                "connection to {} was replaced",
                self.inner.remote.key()
            )));
        }
        state.last_used = Instant::now();
        if state.handshake_completed {
            if let Some(raw) = &state.raw {
                return raw.send(data);
            }
        }
        state.output_buffer.push_back(data);
        Ok(())
    }

    /// Takes the not yet delivered bytes. Later sends on this connection fail.
    pub fn steal_output_buffer(&self) -> Vec<Bytes> {
        let mut state = self.inner.state.lock();
        state.replaced = true;
        state.output_buffer.drain(..).collect()
    }

    pub fn report_buffer_sent_by_other_connection(&self) {
        self.inner.state.lock().replaced = true;
        tracing::trace!(
            target = "dht::connection",
            peer = %self.inner.remote.key(),
            connection_id = %self.connection_id(),
            "output buffer sent by other connection"
        );
    }

    pub fn accept_handshake(&self) {
        let response = match handshake::response_message(&self.inner.local, None) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(target = "dht::connection", error = %err, "failed to encode handshake response");
                return;
            }
        };
        let mut state = self.inner.state.lock();
        if state.handshake_completed || self.is_closed() {
            return;
        }
        let Some(raw) = state.raw.clone() else {
            tracing::warn!(
                target = "dht::connection",
                peer = %self.inner.remote.key(),
                "cannot accept handshake without a transport"
            );
            return;
        };
        if let Err(err) = raw.send(response) {
            tracing::debug!(target = "dht::connection", error = %err, "failed to send handshake response");
            return;
        }
        self.finish_handshake(&mut state);
    }

    pub async fn reject_handshake(&self, error: HandshakeError) {
        let raw = self.inner.state.lock().raw.clone();
        if let Some(raw) = raw {
            match handshake::response_message(&self.inner.local, Some(error)) {
                Ok(response) => {
                    let _ = raw.send(response);
                }
                Err(err) => {
                    tracing::warn!(target = "dht::connection", error = %err, "failed to encode handshake response");
                }
            }
        }
        self.close_with_reason(false, Some(error.to_string())).await;
    }

    pub async fn close(&self, graceful: bool) {
        self.close_with_reason(graceful, None).await;
    }

    /// Idempotent. Waits for the transport to close and then reports a single
    /// `Disconnected` event.
    pub async fn close_with_reason(&self, graceful: bool, reason: Option<String>) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let raw = {
            let mut state = self.inner.state.lock();
            state.output_buffer.clear();
            state.raw.clone()
        };
        if let Some(raw) = raw {
            raw.close(graceful, reason.clone()).await;
        }
        self.emit_disconnected(graceful, reason);
    }

    fn set_state(&self, next: ConnectionState) {
        self.inner.state_tx.send_if_modified(|current| {
            if *current == ConnectionState::Disconnected || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn emit_disconnected(&self, graceful: bool, reason: Option<String>) {
        tracing::trace!(
            target = "dht::connection",
            peer = %self.inner.remote.key(),
            connection_type = %self.inner.connection_type,
            graceful,
            reason = reason.as_deref().unwrap_or(""),
            "managed connection disconnected"
        );
        self.set_state(ConnectionState::Disconnected);
        let _ = self
            .inner
            .events_tx
            .send(ManagedEvent::Disconnected { graceful, reason });
    }

    fn finish_handshake(&self, state: &mut State) {
        state.handshake_completed = true;
        state.last_used = Instant::now();
        if let Some(raw) = state.raw.clone() {
            for data in state.output_buffer.drain(..) {
                if let Err(err) = raw.send(data) {
                    tracing::warn!(target = "dht::connection", error = %err, "failed to flush buffered message");
                }
            }
        }
        self.set_state(ConnectionState::Connected);
        let _ = self
            .inner
            .events_tx
            .send(ManagedEvent::HandshakeCompleted(self.inner.remote.clone()));
    }

    fn complete_handshake(&self) {
        let mut state = self.inner.state.lock();
        if state.handshake_completed || self.is_closed() {
            return;
        }
        self.finish_handshake(&mut state);
    }

    async fn on_raw_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => self.on_raw_connected(),
            ConnectionEvent::Data(bytes) => self.on_raw_data(bytes).await,
            ConnectionEvent::Disconnected { graceful, reason } => {
                self.on_raw_disconnected(graceful, reason)
            }
        }
    }

    fn on_raw_connected(&self) {
        self.set_state(ConnectionState::Handshaking);
        if self.inner.role != HandshakeRole::Outgoing {
            return;
        }
        let state = self.inner.state.lock();
        let request = match handshake::request_message(
            &self.inner.local,
            &self.inner.remote,
            &state.connection_id,
        ) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(target = "dht::connection", error = %err, "failed to encode handshake request");
                return;
            }
        };
        if let Some(raw) = &state.raw {
            if let Err(err) = raw.send(request) {
                tracing::debug!(target = "dht::connection", error = %err, "failed to send handshake request");
            }
        }
    }

    async fn on_raw_data(&self, bytes: Bytes) {
        let completed = {
            let mut state = self.inner.state.lock();
            if state.handshake_completed {
                state.last_used = Instant::now();
            }
            state.handshake_completed
        };
        if completed {
            let _ = self.inner.events_tx.send(ManagedEvent::Data(bytes));
            return;
        }

        let message = match Message::decode(&bytes) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(
                    target = "dht::connection",
                    peer = %self.inner.remote.key(),
                    error = %err,
                    "undecodable message before handshake"
                );
                return;
            }
        };
        match (self.inner.role, message.body) {
            (HandshakeRole::Outgoing, MessageBody::HandshakeResponse(response)) => {
                match response.error {
                    None => self.complete_handshake(),
                    Some(HandshakeError::Duplicate) => self.on_rejected_as_duplicate(),
                    Some(error) => {
                        tracing::debug!(
                            target = "dht::connection",
                            peer = %self.inner.remote.key(),
                            error = %error,
                            "handshake rejected"
                        );
                        self.close_with_reason(false, Some(format!("handshake rejected: {error}")))
                            .await;
                    }
                }
            }
            (HandshakeRole::Incoming, MessageBody::HandshakeRequest(request)) => {
                self.set_connection_id(request.connection_id.clone());
                match handshake::validate_request(&self.inner.local, &request) {
                    None => self.accept_handshake(),
                    Some(error) => self.reject_handshake(error).await,
                }
            }
            (_, body) => {
                tracing::trace!(
                    target = "dht::connection",
                    peer = %self.inner.remote.key(),
                    body = ?body,
                    "dropping message received before handshake"
                );
            }
        }
    }

    /// The remote keeps a connection of its own to us, which will replace this
    /// one and take over the buffered output. Close only if that never happens.
    fn on_rejected_as_duplicate(&self) {
        self.inner.state.lock().rejected_as_duplicate = true;
        tracing::debug!(
            target = "dht::connection",
            peer = %self.inner.remote.key(),
            "rejected as duplicate, waiting for replacement"
        );
        let connection = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DUPLICATE_REPLACEMENT_GRACE).await;
            connection
                .close_with_reason(false, Some("rejected as duplicate".into()))
                .await;
        });
    }

    fn on_raw_disconnected(&self, graceful: bool, reason: Option<String>) {
        {
            let state = self.inner.state.lock();
            if state.rejected_as_duplicate && !state.replaced {
                return;
            }
        }
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.state.lock().output_buffer.clear();
        self.emit_disconnected(graceful, reason);
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("remote", &self.inner.remote.key())
            .field("connection_type", &self.inner.connection_type)
            .field("state", &self.state())
            .finish()
    }
}

async fn pump(inner: Weak<Inner>, mut events: ConnectionEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let connection = ManagedConnection { inner };
        let finished = matches!(event, ConnectionEvent::Disconnected { .. });
        connection.on_raw_event(event).await;
        if finished {
            break;
        }
    }
}
