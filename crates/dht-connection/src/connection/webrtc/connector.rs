use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::connection::{LocalSignal, WebrtcConnection};
use super::negotiation::{
    is_private_candidate, replace_internal_ip_with_external_ip, NegotiationRole, SdpKind,
};
use crate::config::WebrtcConnectorConfig;
use crate::connection::{
    Connector, ConnectorContext, ConnectionType, ManagedConnection, RawConnection,
    RawConnectionHandle,
};
use crate::error::{ConnectionError, Result};
use crate::identifiers::{is_offerer, ConnectionId, PeerDescriptor, PeerKey};
use crate::protocol::{Message, MessageBody, RpcBody, RpcMessage, WEBRTC_CONNECTOR_SERVICE_ID};
use crate::transport::{SendOptions, Transport, TransportEvent};

/// Opens WebRTC data channels, exchanging offers, answers and candidates over
/// the signaling transport.
///
/// The side picked by [`is_offerer`] always creates the offer. When the other
/// side wants a connection it asks for one with a `WebrtcConnectionRequest`.
#[derive(Clone)]
pub struct WebrtcConnector {
    inner: Arc<Inner>,
}

struct Inner {
    config: WebrtcConnectorConfig,
    context: Mutex<Option<ConnectorContext>>,
    attempts: Mutex<HashMap<PeerKey, Attempt>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

#[derive(Clone)]
struct Attempt {
    managed: ManagedConnection,
    connection: Arc<WebrtcConnection>,
}

impl WebrtcConnector {
    pub fn new(config: WebrtcConnectorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                context: Mutex::new(None),
                attempts: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn attempt_count(&self) -> usize {
        self.inner.attempts.lock().len()
    }
}

impl Inner {
    fn context(&self) -> Option<ConnectorContext> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        self.context.lock().clone()
    }

    fn attempt(&self, peer: &PeerKey) -> Option<Attempt> {
        self.attempts.lock().get(peer).cloned()
    }

    fn connect(self: &Arc<Self>, target: &PeerDescriptor) -> Result<ManagedConnection> {
        let context = self
            .context()
            .ok_or_else(|| ConnectionError::SendFailed("webrtc connector is not running".into()))?;
        let local = &context.local_peer_descriptor;
        if local.node_id == target.node_id {
            return Err(ConnectionError::CannotConnectToSelf(target.key().to_string()));
        }
        if let Some(attempt) = self.attempt(&target.key()) {
            return Ok(attempt.managed);
        }
        let role = if is_offerer(&local.node_id, &target.node_id) {
            NegotiationRole::Offerer
        } else {
            NegotiationRole::Answerer
        };
        let attempt = self.create_attempt(&context, target, role)?;
        if role == NegotiationRole::Answerer {
            self.request_offer(&context, &attempt, target);
        }
        Ok(attempt.managed)
    }

    fn signaling(context: &ConnectorContext, target: &PeerDescriptor) -> Result<Arc<dyn Transport>> {
        context.signaling.clone().ok_or_else(|| {
            ConnectionError::SendFailed(format!("no signaling route to {}", target.key()))
        })
    }

    /// Registers a new attempt and starts its peer connection in the
    /// background. Local offers, answers and candidates are forwarded to
    /// `target` until the connection goes away.
    fn create_attempt(
        self: &Arc<Self>,
        context: &ConnectorContext,
        target: &PeerDescriptor,
        role: NegotiationRole,
    ) -> Result<Attempt> {
        let signaling = Self::signaling(context, target)?;
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (connection, events) = WebrtcConnection::new(self.config.clone(), role, signals_tx);
        let handle = RawConnectionHandle::new(connection.clone(), events);
        let local = context.local_peer_descriptor.clone();
        let managed = match role {
            NegotiationRole::Offerer => {
                ManagedConnection::outgoing(local, target.clone(), ConnectionType::Webrtc, handle)
            }
            NegotiationRole::Answerer => ManagedConnection::incoming(
                local,
                target.clone(),
                ConnectionType::Webrtc,
                Some(handle),
            ),
        };
        tracing::debug!(
            target = "dht::webrtc",
            peer = %target.key(),
            role = ?role,
            connection_id = %connection.connection_id(),
            "creating webrtc connection"
        );
        let attempt = Attempt {
            managed: managed.clone(),
            connection: connection.clone(),
        };
        self.attempts.lock().insert(target.key(), attempt.clone());

        tokio::spawn(forward_signals(
            Arc::downgrade(&connection),
            signals_rx,
            signaling,
            target.clone(),
            self.config.external_ip.clone(),
        ));

        let starting = attempt.clone();
        tokio::spawn(async move {
            if let Err(err) = starting.connection.start().await {
                tracing::warn!(target = "dht::webrtc", error = %err, "failed to start webrtc connection");
                starting
                    .managed
                    .close_with_reason(false, Some(err.to_string()))
                    .await;
            }
        });

        let inner = Arc::downgrade(self);
        let key = target.key();
        tokio::spawn(async move {
            managed.settled().await;
            if let Some(inner) = inner.upgrade() {
                let mut attempts = inner.attempts.lock();
                if attempts
                    .get(&key)
                    .is_some_and(|attempt| attempt.managed.same_as(&managed))
                {
                    attempts.remove(&key);
                }
            }
        });
        Ok(attempt)
    }

    /// Asks the designated offerer to start negotiating with us.
    fn request_offer(&self, context: &ConnectorContext, attempt: &Attempt, target: &PeerDescriptor) {
        let Ok(signaling) = Self::signaling(context, target) else {
            return;
        };
        let request = Message::rpc(
            WEBRTC_CONNECTOR_SERVICE_ID,
            target.clone(),
            RpcMessage::notification(RpcBody::WebrtcConnectionRequest),
        );
        let timeout = self.config.rpc_request_timeout;
        let managed = attempt.managed.clone();
        tokio::spawn(async move {
            let failure = match tokio::time::timeout(
                timeout,
                signaling.send(request, SendOptions::do_not_connect()),
            )
            .await
            {
                Ok(Ok(())) => return,
                Ok(Err(err)) => err.to_string(),
                Err(_) => "connection request timed out".to_string(),
            };
            tracing::debug!(
                target = "dht::webrtc",
                peer = %managed.remote_peer_descriptor().key(),
                error = %failure,
                "webrtc connection request failed"
            );
            managed.close_with_reason(false, Some(failure)).await;
        });
    }

    async fn on_signaling_message(self: &Arc<Self>, message: Message) {
        let MessageBody::Rpc(rpc) = message.body else {
            return;
        };
        let Some(context) = self.context() else {
            return;
        };
        let Some(source) = message.source_descriptor else {
            tracing::debug!(target = "dht::webrtc", "signaling message without source");
            return;
        };
        match rpc.body {
            RpcBody::WebrtcConnectionRequest => self.on_connection_request(&context, &source),
            RpcBody::RtcOffer {
                description,
                connection_id,
            } => {
                self.on_offer(&context, &source, description, connection_id)
                    .await
            }
            RpcBody::RtcAnswer {
                description,
                connection_id,
            } => self.on_answer(&source, description, connection_id).await,
            RpcBody::IceCandidate {
                candidate,
                mid,
                connection_id,
            } => {
                self.on_candidate(&source, candidate, mid, connection_id)
                    .await
            }
            other => {
                tracing::debug!(target = "dht::webrtc", body = ?other, "unexpected signaling message");
            }
        }
    }

    fn on_connection_request(self: &Arc<Self>, context: &ConnectorContext, source: &PeerDescriptor) {
        if !is_offerer(&context.local_peer_descriptor.node_id, &source.node_id) {
            tracing::debug!(target = "dht::webrtc", peer = %source.key(), "connection request from the offering side");
            return;
        }
        if self.attempts.lock().contains_key(&source.key()) || !context.handler.can_connect(source) {
            return;
        }
        match self.create_attempt(context, source, NegotiationRole::Offerer) {
            Ok(attempt) => {
                if !context.handler.on_incoming_connection(attempt.managed.clone()) {
                    tokio::spawn(async move {
                        attempt
                            .managed
                            .close_with_reason(false, Some("connection not needed".into()))
                            .await;
                    });
                }
            }
            Err(err) => {
                tracing::debug!(target = "dht::webrtc", peer = %source.key(), error = %err, "cannot answer connection request");
            }
        }
    }

    async fn on_offer(
        self: &Arc<Self>,
        context: &ConnectorContext,
        source: &PeerDescriptor,
        description: String,
        connection_id: ConnectionId,
    ) {
        let attempt = match self.attempt(&source.key()) {
            Some(attempt) => attempt,
            None => {
                let attempt =
                    match self.create_attempt(context, source, NegotiationRole::Answerer) {
                        Ok(attempt) => attempt,
                        Err(err) => {
                            tracing::debug!(target = "dht::webrtc", peer = %source.key(), error = %err, "cannot answer offer");
                            return;
                        }
                    };
                if !context.handler.on_incoming_connection(attempt.managed.clone()) {
                    attempt
                        .managed
                        .close_with_reason(false, Some("connection not needed".into()))
                        .await;
                    return;
                }
                attempt
            }
        };
        if !attempt.connection.would_accept_offer() {
            tracing::debug!(target = "dht::webrtc", peer = %source.key(), "ignoring colliding offer");
            return;
        }
        attempt.connection.set_connection_id(connection_id.clone());
        attempt.managed.set_connection_id(connection_id);
        if let Err(err) = attempt
            .connection
            .set_remote_description(description, SdpKind::Offer)
            .await
        {
            tracing::warn!(target = "dht::webrtc", peer = %source.key(), error = %err, "failed to apply offer");
            attempt
                .managed
                .close_with_reason(false, Some(err.to_string()))
                .await;
        }
    }

    /// The attempt for `source`, if its connection id matches.
    fn matching_attempt(&self, source: &PeerDescriptor, connection_id: &ConnectionId) -> Option<Attempt> {
        let attempt = self.attempt(&source.key())?;
        if attempt.connection.connection_id() != *connection_id {
            tracing::trace!(
                target = "dht::webrtc",
                peer = %source.key(),
                connection_id = %connection_id,
                "signaling for an unknown connection"
            );
            return None;
        }
        Some(attempt)
    }

    async fn on_answer(&self, source: &PeerDescriptor, description: String, connection_id: ConnectionId) {
        let Some(attempt) = self.matching_attempt(source, &connection_id) else {
            return;
        };
        if let Err(err) = attempt
            .connection
            .set_remote_description(description, SdpKind::Answer)
            .await
        {
            tracing::warn!(target = "dht::webrtc", peer = %source.key(), error = %err, "failed to apply answer");
            attempt
                .managed
                .close_with_reason(false, Some(err.to_string()))
                .await;
        }
    }

    async fn on_candidate(
        &self,
        source: &PeerDescriptor,
        candidate: String,
        mid: Option<String>,
        connection_id: ConnectionId,
    ) {
        let Some(attempt) = self.matching_attempt(source, &connection_id) else {
            return;
        };
        if !self.config.allow_private_addresses && is_private_candidate(&candidate) {
            tracing::trace!(target = "dht::webrtc", %candidate, "dropping private candidate");
            return;
        }
        attempt.connection.add_remote_candidate(candidate, mid).await;
    }
}

async fn forward_signals(
    connection: Weak<WebrtcConnection>,
    mut signals: mpsc::UnboundedReceiver<LocalSignal>,
    signaling: Arc<dyn Transport>,
    target: PeerDescriptor,
    external_ip: Option<String>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        let connection_id = connection.connection_id();
        drop(connection);
        let body = match signal {
            LocalSignal::Description {
                description,
                kind: SdpKind::Offer,
            } => RpcBody::RtcOffer {
                description,
                connection_id,
            },
            LocalSignal::Description {
                description,
                kind: SdpKind::Answer,
            } => RpcBody::RtcAnswer {
                description,
                connection_id,
            },
            LocalSignal::Candidate { candidate, mid } => {
                let candidate = match &external_ip {
                    Some(ip) => replace_internal_ip_with_external_ip(&candidate, ip),
                    None => candidate,
                };
                RpcBody::IceCandidate {
                    candidate,
                    mid,
                    connection_id,
                }
            }
        };
        let message = Message::rpc(
            WEBRTC_CONNECTOR_SERVICE_ID,
            target.clone(),
            RpcMessage::notification(body),
        );
        if let Err(err) = signaling.send(message, SendOptions::do_not_connect()).await {
            tracing::debug!(target = "dht::webrtc", peer = %target.key(), error = %err, "failed to send signaling");
        }
    }
}

#[async_trait]
impl Connector for WebrtcConnector {
    fn name(&self) -> &'static str {
        "webrtc"
    }

    async fn start(&self, context: ConnectorContext) -> Result<()> {
        let signaling = context.signaling.clone();
        *self.inner.context.lock() = Some(context);
        let Some(signaling) = signaling else {
            return Ok(());
        };
        let mut events = signaling.subscribe();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Message(message)
                        if message.service_id == WEBRTC_CONNECTOR_SERVICE_ID =>
                    {
                        inner.on_signaling_message(message).await;
                    }
                    _ => {}
                }
            }
        });
        self.inner.tasks.lock().push(task);
        Ok(())
    }

    fn can_form_connection(&self, local: &PeerDescriptor, target: &PeerDescriptor) -> bool {
        local.webrtc && target.webrtc
    }

    fn needs_signaling(&self) -> bool {
        true
    }

    fn connect(&self, target: &PeerDescriptor) -> Result<ManagedConnection> {
        self.inner.connect(target)
    }

    async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let attempts: Vec<Attempt> = self
            .inner
            .attempts
            .lock()
            .drain()
            .map(|(_, attempt)| attempt)
            .collect();
        for attempt in attempts {
            attempt
                .managed
                .close_with_reason(false, Some("webrtc connector stopped".into()))
                .await;
        }
    }
}
