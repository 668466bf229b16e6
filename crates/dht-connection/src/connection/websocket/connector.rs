use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::connection::WebsocketConnection;
use super::server::WebsocketServer;
use crate::config::WebsocketConnectorConfig;
use crate::connection::connector::{admit_incoming, PendingConnections};
use crate::connection::handshake;
use crate::connection::{
    Connector, ConnectorContext, ConnectionType, ManagedConnection, RawConnectionHandle,
};
use crate::error::{ConnectionError, Result};
use crate::identifiers::{PeerDescriptor, WebsocketEndpoint};
use crate::protocol::{
    Message, MessageBody, RpcBody, RpcMessage, WEBSOCKET_CONNECTOR_SERVICE_ID,
};
use crate::transport::{SendOptions, TransportEvent};

/// Dials peers that publish a WebSocket endpoint and serves the ones that
/// don't: those are asked over signaling to dial back.
#[derive(Clone)]
pub struct WebsocketConnector {
    inner: Arc<Inner>,
}

struct Inner {
    config: WebsocketConnectorConfig,
    server: Mutex<Option<WebsocketServer>>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<RawConnectionHandle>>>,
    context: Mutex<Option<ConnectorContext>>,
    pending: PendingConnections,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl WebsocketConnector {
    pub fn new(config: WebsocketConnectorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                server: Mutex::new(None),
                incoming: Mutex::new(None),
                context: Mutex::new(None),
                pending: PendingConnections::default(),
                tasks: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn listening_port(&self) -> Option<u16> {
        self.inner.server.lock().as_ref().map(WebsocketServer::port)
    }
}

impl Inner {
    fn context(&self) -> Option<ConnectorContext> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        self.context.lock().clone()
    }

    fn connect(self: &Arc<Self>, target: &PeerDescriptor) -> Result<ManagedConnection> {
        let context = self
            .context()
            .ok_or_else(|| ConnectionError::SendFailed("websocket connector is not running".into()))?;
        let local = context.local_peer_descriptor.clone();
        if local.node_id == target.node_id {
            return Err(ConnectionError::CannotConnectToSelf(target.key().to_string()));
        }
        if let Some(existing) = self.pending.get(&target.key()) {
            return Ok(existing);
        }
        match (&target.websocket, &local.websocket) {
            (Some(endpoint), own) => {
                if own.as_ref().is_some_and(|own| own.same_address(endpoint)) {
                    return Err(ConnectionError::CannotConnectToSelf(endpoint.url()));
                }
                tracing::debug!(
                    target = "dht::websocket",
                    peer = %target.key(),
                    url = %endpoint.url(),
                    "dialing websocket"
                );
                let handle = WebsocketConnection::connect(endpoint.url(), &self.config);
                let managed = ManagedConnection::outgoing(
                    local,
                    target.clone(),
                    ConnectionType::WebsocketClient,
                    handle,
                );
                self.pending.insert_until_settled(managed.clone());
                Ok(managed)
            }
            (None, Some(_)) => self.request_connection_from_peer(&context, target),
            (None, None) => Err(ConnectionError::SendFailed(format!(
                "neither side of {} has a websocket server",
                target.key()
            ))),
        }
    }

    /// Asks `target` to dial our server. The returned connection gets its
    /// transport when the dial-back arrives.
    fn request_connection_from_peer(
        self: &Arc<Self>,
        context: &ConnectorContext,
        target: &PeerDescriptor,
    ) -> Result<ManagedConnection> {
        let signaling = context.signaling.clone().ok_or_else(|| {
            ConnectionError::SendFailed(format!("no signaling route to {}", target.key()))
        })?;
        let managed = ManagedConnection::incoming(
            context.local_peer_descriptor.clone(),
            target.clone(),
            ConnectionType::WebsocketServer,
            None,
        );
        self.pending.insert_until_settled(managed.clone());
        let request = Message::rpc(
            WEBSOCKET_CONNECTOR_SERVICE_ID,
            target.clone(),
            RpcMessage::notification(RpcBody::WebsocketConnectionRequest),
        );
        let timeout = self.config.connect_timeout;
        let waiting = managed.clone();
        tokio::spawn(async move {
            if let Err(err) = signaling.send(request, SendOptions::do_not_connect()).await {
                tracing::debug!(
                    target = "dht::websocket",
                    peer = %waiting.remote_peer_descriptor().key(),
                    error = %err,
                    "dial-back request failed"
                );
                waiting
                    .close_with_reason(false, Some("dial-back request failed".into()))
                    .await;
                return;
            }
            if tokio::time::timeout(timeout, waiting.settled()).await.is_err() {
                waiting
                    .close_with_reason(false, Some("dial-back timed out".into()))
                    .await;
            }
        });
        Ok(managed)
    }

    async fn on_incoming_socket(&self, handle: RawConnectionHandle) {
        let RawConnectionHandle { connection, mut events } = handle;
        let Some(context) = self.context() else {
            connection
                .close(false, Some("websocket connector stopped".into()))
                .await;
            return;
        };
        let request =
            match handshake::await_request(&mut events, self.config.handshake_timeout).await {
                Ok(request) => request,
                Err(err) => {
                    tracing::debug!(target = "dht::websocket", error = %err, "incoming websocket handshake failed");
                    connection.close(false, Some(err.to_string())).await;
                    return;
                }
            };
        let source = request.source_descriptor.clone();
        let handle = RawConnectionHandle::new(connection, events);

        let dial_back = self.pending.get(&source.key()).filter(|pending| {
            pending.connection_type() == ConnectionType::WebsocketServer
                && !pending.is_handshake_completed()
                && !pending.is_closed()
        });
        if let Some(pending) = dial_back {
            tracing::debug!(target = "dht::websocket", peer = %source.key(), "dial-back arrived");
            pending.attach_implementation(handle);
            pending.set_connection_id(request.connection_id.clone());
            match handshake::validate_request(&context.local_peer_descriptor, &request) {
                None => pending.accept_handshake(),
                Some(error) => pending.reject_handshake(error).await,
            }
            return;
        }

        let managed = ManagedConnection::incoming(
            context.local_peer_descriptor.clone(),
            source,
            ConnectionType::WebsocketServer,
            Some(handle),
        );
        admit_incoming(&context, &managed, &request).await;
    }

    fn on_signaling_message(self: &Arc<Self>, message: Message) {
        let MessageBody::Rpc(rpc) = &message.body else {
            return;
        };
        if rpc.body != RpcBody::WebsocketConnectionRequest {
            tracing::debug!(target = "dht::websocket", body = ?rpc.body, "unexpected signaling message");
            return;
        }
        let Some(context) = self.context() else {
            return;
        };
        let Some(source) = message.source_descriptor else {
            tracing::debug!(target = "dht::websocket", "dial-back request without source");
            return;
        };
        if source.websocket.is_none() {
            tracing::debug!(target = "dht::websocket", peer = %source.key(), "dial-back requester has no server");
            return;
        }
        if self.pending.contains(&source.key()) || !context.handler.can_connect(&source) {
            return;
        }
        match self.connect(&source) {
            Ok(connection) => {
                if !context.handler.on_incoming_connection(connection.clone()) {
                    tokio::spawn(async move {
                        connection
                            .close_with_reason(false, Some("dial-back not needed".into()))
                            .await;
                    });
                }
            }
            Err(err) => {
                tracing::debug!(target = "dht::websocket", peer = %source.key(), error = %err, "dial-back failed");
            }
        }
    }
}

#[async_trait]
impl Connector for WebsocketConnector {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn listen(&self) -> Result<Option<WebsocketEndpoint>> {
        let Some(port_range) = self.inner.config.port_range else {
            return Ok(None);
        };
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let server = WebsocketServer::start(&self.inner.config, port_range, incoming_tx).await?;
        let endpoint = WebsocketEndpoint {
            host: self.inner.config.host.clone(),
            port: server.port(),
            tls: self.inner.config.tls.is_some(),
        };
        *self.inner.server.lock() = Some(server);
        *self.inner.incoming.lock() = Some(incoming_rx);
        Ok(Some(endpoint))
    }

    async fn start(&self, context: ConnectorContext) -> Result<()> {
        let signaling = context.signaling.clone();
        *self.inner.context.lock() = Some(context);

        let mut tasks = Vec::new();
        if let Some(mut incoming) = self.inner.incoming.lock().take() {
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(handle) = incoming.recv().await {
                    let inner = inner.clone();
                    tokio::spawn(async move { inner.on_incoming_socket(handle).await });
                }
            }));
        }
        if let Some(signaling) = signaling {
            let mut events = signaling.subscribe();
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        TransportEvent::Message(message)
                            if message.service_id == WEBSOCKET_CONNECTOR_SERVICE_ID =>
                        {
                            inner.on_signaling_message(message);
                        }
                        _ => {}
                    }
                }
            }));
        }
        self.inner.tasks.lock().extend(tasks);
        Ok(())
    }

    fn can_form_connection(&self, local: &PeerDescriptor, target: &PeerDescriptor) -> bool {
        target.websocket.is_some() || local.websocket.is_some()
    }

    fn connect(&self, target: &PeerDescriptor) -> Result<ManagedConnection> {
        self.inner.connect(target)
    }

    async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(server) = self.inner.server.lock().take() {
            server.stop();
        }
        for connection in self.inner.pending.drain() {
            connection
                .close_with_reason(false, Some("websocket connector stopped".into()))
                .await;
        }
    }
}
