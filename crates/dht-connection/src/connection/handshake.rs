use std::time::Duration;

use bytes::Bytes;

use super::{ConnectionEvent, ConnectionEvents};
use crate::error::{ConnectionError, Result};
use crate::identifiers::{ConnectionId, PeerDescriptor};
use crate::protocol::{
    is_compatible_version, HandshakeError, HandshakeRequest, HandshakeResponse, Message,
    MessageBody, CONTROL_SERVICE_ID, PROTOCOL_VERSION,
};

pub(crate) fn request_message(
    local: &PeerDescriptor,
    target: &PeerDescriptor,
    connection_id: &ConnectionId,
) -> Result<Bytes> {
    Message::new(
        CONTROL_SERVICE_ID,
        MessageBody::HandshakeRequest(HandshakeRequest {
            source_descriptor: local.clone(),
            target_descriptor: Some(target.clone()),
            protocol_version: PROTOCOL_VERSION.to_string(),
            connection_id: connection_id.clone(),
        }),
    )
    .with_source(local.clone())
    .encode()
}

pub(crate) fn response_message(
    local: &PeerDescriptor,
    error: Option<HandshakeError>,
) -> Result<Bytes> {
    Message::new(
        CONTROL_SERVICE_ID,
        MessageBody::HandshakeResponse(HandshakeResponse {
            source_descriptor: local.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            error,
        }),
    )
    .with_source(local.clone())
    .encode()
}

pub(crate) fn validate_request(
    local: &PeerDescriptor,
    request: &HandshakeRequest,
) -> Option<HandshakeError> {
    if !is_compatible_version(&request.protocol_version) {
        return Some(HandshakeError::UnsupportedVersion);
    }
    match &request.target_descriptor {
        Some(target) if target != local => Some(HandshakeError::InvalidTargetPeerDescriptor),
        _ => None,
    }
}

/// Reads events of a freshly accepted connection until the dialer's
/// handshake request arrives.
pub(crate) async fn await_request(
    events: &mut ConnectionEvents,
    timeout: Duration,
) -> Result<HandshakeRequest> {
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected => {}
                ConnectionEvent::Data(bytes) => match Message::decode(&bytes) {
                    Ok(Message {
                        body: MessageBody::HandshakeRequest(request),
                        ..
                    }) => return Ok(request),
                    Ok(other) => {
                        tracing::debug!(
                            target = "dht::handshake",
                            message_type = ?other.message_type(),
                            "dropping message received before handshake"
                        );
                    }
                    Err(err) => return Err(err),
                },
                ConnectionEvent::Disconnected { reason, .. } => {
                    return Err(ConnectionError::Handshake(format!(
                        "disconnected before handshake: {}",
                        reason.unwrap_or_default()
                    )));
                }
            }
        }
        Err(ConnectionError::Handshake("event stream ended".into()))
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| ConnectionError::Handshake("timed out waiting for handshake request".into()))?
}
