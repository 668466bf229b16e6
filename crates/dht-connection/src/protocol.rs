//! Wire envelope shared by every transport.
//!
//! Envelopes are encoded with bincode. The body variant doubles as the message
//! type: handshakes are only valid before a connection completes its handshake,
//! RPC bodies carry the control protocol and application bodies are opaque to
//! this layer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ConnectionError, Result};
use crate::identifiers::{ConnectionId, PeerDescriptor};

pub const PROTOCOL_VERSION: &str = "1.0";

pub const CONTROL_SERVICE_ID: &str = "system/connection-manager";
pub const WEBSOCKET_CONNECTOR_SERVICE_ID: &str = "system/websocket-connector";
pub const WEBRTC_CONNECTOR_SERVICE_ID: &str = "system/webrtc-connector";

pub type ServiceId = String;
pub type LockId = String;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub service_id: ServiceId,
    pub source_descriptor: Option<PeerDescriptor>,
    pub target_descriptor: Option<PeerDescriptor>,
    pub body: MessageBody,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    HandshakeRequest,
    HandshakeResponse,
    Rpc,
    Application,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MessageBody {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    Rpc(RpcMessage),
    Application(Bytes),
}

impl Message {
    pub fn new(service_id: impl Into<ServiceId>, body: MessageBody) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            service_id: service_id.into(),
            source_descriptor: None,
            target_descriptor: None,
            body,
        }
    }

    pub fn application(
        service_id: impl Into<ServiceId>,
        target: PeerDescriptor,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::new(service_id, MessageBody::Application(payload.into())).with_target(target)
    }

    pub fn rpc(service_id: impl Into<ServiceId>, target: PeerDescriptor, rpc: RpcMessage) -> Self {
        Self::new(service_id, MessageBody::Rpc(rpc)).with_target(target)
    }

    pub fn with_target(mut self, target: PeerDescriptor) -> Self {
        self.target_descriptor = Some(target);
        self
    }

    pub fn with_source(mut self, source: PeerDescriptor) -> Self {
        self.source_descriptor = Some(source);
        self
    }

    pub fn message_type(&self) -> MessageType {
        match self.body {
            MessageBody::HandshakeRequest(_) => MessageType::HandshakeRequest,
            MessageBody::HandshakeResponse(_) => MessageType::HandshakeResponse,
            MessageBody::Rpc(_) => MessageType::Rpc,
            MessageBody::Application(_) => MessageType::Application,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|err| ConnectionError::Encode(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|err| ConnectionError::Decode(err.to_string()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub source_descriptor: PeerDescriptor,
    pub target_descriptor: Option<PeerDescriptor>,
    pub protocol_version: String,
    pub connection_id: ConnectionId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub source_descriptor: PeerDescriptor,
    pub protocol_version: String,
    pub error: Option<HandshakeError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum HandshakeError {
    #[error("duplicate connection")]
    Duplicate,
    #[error("invalid target peer descriptor")]
    InvalidTargetPeerDescriptor,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
}

/// Versions are compatible when their major components match.
pub fn is_compatible_version(remote: &str) -> bool {
    fn major(version: &str) -> &str {
        version.split('.').next().unwrap_or(version)
    }
    major(remote) == major(PROTOCOL_VERSION)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcKind {
    Request,
    Response,
    Notification,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectMode {
    Normal,
    Leaving,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcBody {
    LockRequest {
        lock_id: LockId,
    },
    LockResponse {
        accepted: bool,
    },
    UnlockRequest {
        lock_id: LockId,
    },
    DisconnectNotice {
        mode: DisconnectMode,
    },
    DisconnectNoticeResponse,
    WebsocketConnectionRequest,
    WebrtcConnectionRequest,
    RtcOffer {
        description: String,
        connection_id: ConnectionId,
    },
    RtcAnswer {
        description: String,
        connection_id: ConnectionId,
    },
    IceCandidate {
        candidate: String,
        mid: Option<String>,
        connection_id: ConnectionId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub request_id: String,
    pub kind: RpcKind,
    pub body: RpcBody,
}

impl RpcMessage {
    pub fn request(body: RpcBody) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            kind: RpcKind::Request,
            body,
        }
    }

    pub fn notification(body: RpcBody) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            kind: RpcKind::Notification,
            body,
        }
    }

    pub fn response(request_id: impl Into<String>, body: RpcBody) -> Self {
        Self {
            request_id: request_id.into(),
            kind: RpcKind::Response,
            body,
        }
    }
}
