use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::RpcError;
use crate::identifiers::PeerDescriptor;
use crate::protocol::{Message, RpcBody, RpcKind, RpcMessage, ServiceId};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<RpcBody>>>>;

/// Correlates RPC requests with their responses for one service id.
///
/// The communicator never touches the network: it builds envelopes and the
/// owner sends them through whatever transport it uses.
pub struct RpcCommunicator {
    service_id: ServiceId,
    timeout: Duration,
    pending: PendingMap,
}

impl RpcCommunicator {
    pub fn new(service_id: impl Into<ServiceId>, timeout: Duration) -> Self {
        Self {
            service_id: service_id.into(),
            timeout,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn request(&self, target: &PeerDescriptor, body: RpcBody) -> (Message, PendingResponse) {
        self.request_with_timeout(target, body, self.timeout)
    }

    pub fn request_with_timeout(
        &self,
        target: &PeerDescriptor,
        body: RpcBody,
        timeout: Duration,
    ) -> (Message, PendingResponse) {
        let rpc = RpcMessage::request(body);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(rpc.request_id.clone(), tx);
        let pending = PendingResponse {
            request_id: rpc.request_id.clone(),
            receiver: rx,
            timeout,
            pending: self.pending.clone(),
        };
        (Message::rpc(self.service_id.clone(), target.clone(), rpc), pending)
    }

    pub fn notification(&self, target: &PeerDescriptor, body: RpcBody) -> Message {
        Message::rpc(self.service_id.clone(), target.clone(), RpcMessage::notification(body))
    }

    pub fn response(&self, target: &PeerDescriptor, request: &RpcMessage, body: RpcBody) -> Message {
        Message::rpc(
            self.service_id.clone(),
            target.clone(),
            RpcMessage::response(request.request_id.clone(), body),
        )
    }

    /// Resolves the matching pending request. Returns `false` for unknown or
    /// already expired request ids.
    pub fn handle_response(&self, rpc: RpcMessage) -> bool {
        if rpc.kind != RpcKind::Response {
            return false;
        }
        let Some(waiter) = self.pending.lock().remove(&rpc.request_id) else {
            tracing::trace!(
                target = "dht::rpc",
                request_id = %rpc.request_id,
                "response for unknown request"
            );
            return false;
        };
        waiter.send(rpc.body).is_ok()
    }

    /// Fails every outstanding request with [`RpcError::Canceled`].
    pub fn cancel_all(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

pub struct PendingResponse {
    request_id: String,
    receiver: oneshot::Receiver<RpcBody>,
    timeout: Duration,
    pending: PendingMap,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn wait(self) -> Result<RpcBody, RpcError> {
        let PendingResponse {
            request_id,
            receiver,
            timeout,
            pending,
        } = self;
        let outcome = tokio::time::timeout(timeout, receiver).await;
        pending.lock().remove(&request_id);
        match outcome {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(RpcError::Canceled),
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// Forgets the request without waiting, e.g. when it could not be sent.
    pub fn cancel(self) {
        self.pending.lock().remove(&self.request_id);
    }
}
