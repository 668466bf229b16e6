use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use ::webrtc::api::setting_engine::SettingEngine;
use ::webrtc::api::APIBuilder;
use ::webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use ::webrtc::data_channel::data_channel_message::DataChannelMessage;
use ::webrtc::data_channel::RTCDataChannel;
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::RTCPeerConnection;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use webrtc_ice::udp_network::{EphemeralUDP, UDPNetwork};

use super::negotiation::{
    CandidateAction, Negotiation, NegotiationRole, NegotiationState, RemoteCandidate,
    RemoteDescriptionAction, SdpKind,
};
use crate::config::WebrtcConnectorConfig;
use crate::connection::{ConnectionEvents, ConnectionType, RawConnection, RawEventSink};
use crate::error::{ConnectionError, Result};
use crate::identifiers::ConnectionId;

const DATA_CHANNEL_LABEL: &str = "datachannel";

/// Signaling produced locally that has to reach the remote peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalSignal {
    Description { description: String, kind: SdpKind },
    Candidate { candidate: String, mid: Option<String> },
}

/// A peer connection carrying one ordered data channel.
///
/// Sends are queued and written by a drain task that pauses while the
/// channel's buffered amount is above the high watermark, until it falls
/// below the low one.
pub struct WebrtcConnection {
    this: Weak<WebrtcConnection>,
    id: Mutex<ConnectionId>,
    config: WebrtcConnectorConfig,
    sink: Arc<RawEventSink>,
    negotiation: Mutex<Negotiation>,
    peer_connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    started: watch::Sender<bool>,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    buffer_low: Arc<Notify>,
    signals: mpsc::UnboundedSender<LocalSignal>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebrtcConnection {
    pub fn new(
        config: WebrtcConnectorConfig,
        role: NegotiationRole,
        signals: mpsc::UnboundedSender<LocalSignal>,
    ) -> (Arc<Self>, ConnectionEvents) {
        let (sink, events) = RawEventSink::channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let connection = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            id: Mutex::new(ConnectionId::new()),
            config,
            sink,
            negotiation: Mutex::new(Negotiation::new(role)),
            peer_connection: Mutex::new(None),
            started: watch::Sender::new(false),
            data_channel: Mutex::new(None),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            buffer_low: Arc::new(Notify::new()),
            signals,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        (connection, events)
    }

    pub fn set_connection_id(&self, connection_id: ConnectionId) {
        *self.id.lock() = connection_id;
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation.lock().state()
    }

    pub fn would_accept_offer(&self) -> bool {
        self.negotiation.lock().would_accept_offer()
    }

    fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        self.peer_connection
            .lock()
            .clone()
            .ok_or_else(|| ConnectionError::WebRtc("peer connection not started".into()))
    }

    /// Waits until `start` has created the peer connection, or until the
    /// connection is closed.
    async fn started_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut started = self.started.subscribe();
        let _ = started.wait_for(|started| *started).await;
        self.peer_connection()
    }

    fn build_api(&self) -> Result<::webrtc::api::API> {
        let mut settings = SettingEngine::default();
        if let Some(range) = self.config.port_range {
            let ephemeral = EphemeralUDP::new(range.min, range.max)
                .map_err(|err| ConnectionError::WebRtc(err.to_string()))?;
            settings.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }
        Ok(APIBuilder::new().with_setting_engine(settings).build())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![server.url.clone()],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    /// Creates the peer connection. The offerer also opens the data channel
    /// and sends its offer.
    pub async fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::SendFailed("webrtc connection is closed".into()));
        }
        let api = self.build_api()?;
        let peer_connection = Arc::new(api.new_peer_connection(self.rtc_configuration()).await?);
        *self.peer_connection.lock() = Some(peer_connection.clone());
        self.register_peer_connection_handlers(&peer_connection);
        self.started.send_replace(true);

        let remote_description_timeout = self.config.remote_description_timeout;
        let weak = self.this.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            tokio::time::sleep(remote_description_timeout).await;
            let Some(connection) = weak.upgrade() else {
                return;
            };
            if !connection.negotiation.lock().has_remote_description() {
                tracing::debug!(
                    target = "dht::webrtc",
                    connection_id = %connection.connection_id(),
                    "no remote description received"
                );
                connection.close_in_background("remote description timed out".into());
            }
        }));

        if self.negotiation.lock().role() == NegotiationRole::Offerer {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let data_channel = peer_connection
                .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                .await?;
            self.setup_data_channel(data_channel).await;
            self.make_offer(&peer_connection).await?;
        }
        Ok(())
    }

    async fn make_offer(&self, peer_connection: &RTCPeerConnection) -> Result<()> {
        self.negotiation.lock().begin_offer();
        let offer = peer_connection.create_offer(None).await?;
        peer_connection.set_local_description(offer.clone()).await?;
        let _ = self.signals.send(LocalSignal::Description {
            description: offer.sdp,
            kind: SdpKind::Offer,
        });
        self.negotiation.lock().offer_sent();
        Ok(())
    }

    fn register_peer_connection_handlers(&self, peer_connection: &Arc<RTCPeerConnection>) {
        let signals = self.signals.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let signals = signals.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = signals.send(LocalSignal::Candidate {
                            candidate: init.candidate,
                            mid: init.sdp_mid,
                        });
                    }
                    Err(err) => {
                        tracing::debug!(target = "dht::webrtc", error = %err, "failed to serialize candidate");
                    }
                }
            })
        }));

        let weak = self.this.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(connection) = weak.upgrade() {
                        connection.on_state_change(state);
                    }
                })
            },
        ));

        let weak = self.this.clone();
        peer_connection.on_data_channel(Box::new(move |data_channel: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(connection) = weak.upgrade() {
                    tracing::trace!(target = "dht::webrtc", label = %data_channel.label(), "data channel received");
                    connection.setup_data_channel(data_channel).await;
                }
            })
        }));
    }

    fn on_state_change(&self, state: RTCPeerConnectionState) {
        tracing::trace!(
            target = "dht::webrtc",
            connection_id = %self.connection_id(),
            state = %state,
            "peer connection state changed"
        );
        match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Connected => {}
            RTCPeerConnectionState::Connecting => self.negotiation.lock().ice_checking(),
            RTCPeerConnectionState::Disconnected
            | RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Closed => {
                self.negotiation.lock().failed();
                self.close_in_background(format!("peer connection {state}"));
            }
            RTCPeerConnectionState::Unspecified => {
                let err = ConnectionError::IllegalRtcPeerConnectionState(state.to_string());
                tracing::warn!(target = "dht::webrtc", error = %err, "closing connection");
                self.negotiation.lock().failed();
                self.close_in_background(err.to_string());
            }
        }
    }

    async fn setup_data_channel(&self, data_channel: Arc<RTCDataChannel>) {
        *self.data_channel.lock() = Some(data_channel.clone());
        data_channel
            .set_buffered_amount_low_threshold(self.config.buffer_threshold_low)
            .await;

        let buffer_low = self.buffer_low.clone();
        data_channel
            .on_buffered_amount_low(Box::new(move || {
                let buffer_low = buffer_low.clone();
                Box::pin(async move {
                    buffer_low.notify_one();
                })
            }))
            .await;

        let weak = self.this.clone();
        let opened_channel = data_channel.clone();
        data_channel.on_open(Box::new(move || {
            let weak = weak.clone();
            let data_channel = opened_channel.clone();
            Box::pin(async move {
                if let Some(connection) = weak.upgrade() {
                    connection.on_data_channel_open(data_channel);
                }
            })
        }));

        let sink = self.sink.clone();
        data_channel.on_message(Box::new(move |message: DataChannelMessage| {
            sink.data(message.data);
            Box::pin(async {})
        }));

        let weak = self.this.clone();
        data_channel.on_close(Box::new(move || {
            if let Some(connection) = weak.upgrade() {
                connection.close_in_background("data channel closed".into());
            }
            Box::pin(async {})
        }));

        data_channel.on_error(Box::new(move |err: ::webrtc::Error| {
            tracing::debug!(target = "dht::webrtc", error = %err, "data channel error");
            Box::pin(async {})
        }));
    }

    fn on_data_channel_open(&self, data_channel: Arc<RTCDataChannel>) {
        self.negotiation.lock().opened();
        let Some(mut outbound) = self.outbound_rx.lock().take() else {
            return;
        };
        tracing::debug!(target = "dht::webrtc", connection_id = %self.connection_id(), "data channel open");
        let weak = self.this.clone();
        let buffer_low = self.buffer_low.clone();
        let high = self.config.buffer_threshold_high;
        let low = self.config.buffer_threshold_low;
        self.tasks.lock().push(tokio::spawn(async move {
            while let Some(data) = outbound.recv().await {
                if data_channel.buffered_amount().await >= high {
                    while data_channel.buffered_amount().await > low {
                        buffer_low.notified().await;
                    }
                }
                if let Err(err) = data_channel.send(&data).await {
                    tracing::debug!(target = "dht::webrtc", error = %err, "data channel send failed");
                    if let Some(connection) = weak.upgrade() {
                        connection.close_in_background(err.to_string());
                    }
                    break;
                }
            }
        }));
        self.sink.connected();
    }

    /// Applies a remote offer or answer. Offers are answered right away.
    pub async fn set_remote_description(&self, description: String, kind: SdpKind) -> Result<()> {
        if self.negotiation.lock().on_remote_description(kind) == RemoteDescriptionAction::Ignore {
            tracing::debug!(
                target = "dht::webrtc",
                connection_id = %self.connection_id(),
                kind = ?kind,
                "ignoring remote description"
            );
            return Ok(());
        }
        let peer_connection = self.started_peer_connection().await?;
        let remote = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(description)?,
            SdpKind::Answer => RTCSessionDescription::answer(description)?,
        };
        peer_connection.set_remote_description(remote).await?;
        let queued = self.negotiation.lock().remote_description_applied();
        for candidate in queued {
            self.apply_candidate(&peer_connection, candidate).await;
        }

        if kind == SdpKind::Offer {
            let answer = peer_connection.create_answer(None).await?;
            peer_connection.set_local_description(answer.clone()).await?;
            let _ = self.signals.send(LocalSignal::Description {
                description: answer.sdp,
                kind: SdpKind::Answer,
            });
            self.negotiation.lock().answer_sent();
        }
        Ok(())
    }

    pub async fn add_remote_candidate(&self, candidate: String, mid: Option<String>) {
        let candidate = RemoteCandidate { candidate, mid };
        let action = self.negotiation.lock().on_remote_candidate(candidate.clone());
        if action == CandidateAction::Queue {
            return;
        }
        match self.peer_connection() {
            Ok(peer_connection) => self.apply_candidate(&peer_connection, candidate).await,
            Err(err) => {
                tracing::debug!(target = "dht::webrtc", error = %err, "dropping remote candidate");
            }
        }
    }

    /// Closes from a task that `close` would otherwise abort.
    fn close_in_background(&self, reason: String) {
        if let Some(connection) = self.this.upgrade() {
            tokio::spawn(async move {
                connection.close(false, Some(reason)).await;
            });
        }
    }

    async fn apply_candidate(&self, peer_connection: &RTCPeerConnection, candidate: RemoteCandidate) {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.mid,
            sdp_mline_index: None,
            username_fragment: None,
        };
        if let Err(err) = peer_connection.add_ice_candidate(init).await {
            tracing::debug!(target = "dht::webrtc", error = %err, "failed to add remote candidate");
        }
    }
}

#[async_trait]
impl RawConnection for WebrtcConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id.lock().clone()
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Webrtc
    }

    fn send(&self, data: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::SendFailed("webrtc connection is closed".into()));
        }
        if data.len() > self.config.max_message_size {
            return Err(ConnectionError::SendFailed(format!(
                "message of {} bytes exceeds the {} byte limit",
                data.len(),
                self.config.max_message_size
            )));
        }
        self.outbound
            .send(data)
            .map_err(|_| ConnectionError::SendFailed("webrtc drain task ended".into()))
    }

    async fn close(&self, graceful: bool, reason: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let data_channel = self.data_channel.lock().take();
        if let Some(data_channel) = data_channel {
            if let Err(err) = data_channel.close().await {
                tracing::trace!(target = "dht::webrtc", error = %err, "data channel close failed");
            }
        }
        let peer_connection = self.peer_connection.lock().take();
        if let Some(peer_connection) = peer_connection {
            if let Err(err) = peer_connection.close().await {
                tracing::trace!(target = "dht::webrtc", error = %err, "peer connection close failed");
            }
        }
        self.started.send_replace(true);
        self.sink.disconnected(graceful, reason);
    }
}
