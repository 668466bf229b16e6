use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Length of randomly generated node ids.
pub const NODE_ID_LENGTH: usize = 20;

/// Raw identity bytes of a node.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Vec<u8>);

impl NodeId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn random() -> Self {
        Self(rand::random::<[u8; NODE_ID_LENGTH]>().to_vec())
    }

    pub fn from_hex(value: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(value).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn key(&self) -> PeerKey {
        PeerKey(hex::encode(&self.0))
    }

    /// Kademlia XOR distance. The shorter id is treated as zero-padded on the right.
    pub fn distance(&self, other: &NodeId) -> Vec<u8> {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| self.0.get(i).copied().unwrap_or(0) ^ other.0.get(i).copied().unwrap_or(0))
            .collect()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// Stable map key derived from a [`NodeId`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(String);

impl PeerKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id shared by both ends of one logical connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsocketEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl WebsocketEndpoint {
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Parses a `ws://` or `wss://` entry point. The port defaults to the
    /// scheme's well-known port.
    pub fn parse(value: &str) -> Result<Self, String> {
        let url = Url::parse(value).map_err(|err| format!("invalid websocket url {value}: {err}"))?;
        let tls = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => return Err(format!("unsupported websocket scheme {other}")),
        };
        let host = url
            .host_str()
            .ok_or_else(|| format!("websocket url {value} has no host"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| format!("websocket url {value} has no port"))?;
        Ok(Self { host, port, tls })
    }

    pub fn same_address(&self, other: &WebsocketEndpoint) -> bool {
        self.host == other.host && self.port == other.port
    }
}

/// Identity and reachability record of a node.
///
/// Equality and hashing only look at `node_id`: two descriptors with the same id
/// describe the same peer even if their connectivity differs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub node_id: NodeId,
    pub websocket: Option<WebsocketEndpoint>,
    pub webrtc: bool,
}

impl PeerDescriptor {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            websocket: None,
            webrtc: false,
        }
    }

    pub fn with_websocket(mut self, host: impl Into<String>, port: u16, tls: bool) -> Self {
        self.websocket = Some(WebsocketEndpoint {
            host: host.into(),
            port,
            tls,
        });
        self
    }

    pub fn with_webrtc(mut self) -> Self {
        self.webrtc = true;
        self
    }

    pub fn key(&self) -> PeerKey {
        self.node_id.key()
    }
}

impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for PeerDescriptor {}

impl Hash for PeerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}

fn offering_hash(first: &PeerKey, second: &PeerKey) -> u32 {
    crc32c::crc32c(format!("{first},{second}").as_bytes())
}

/// Deterministic, antisymmetric ordering of two peer ids.
///
/// Used both to pick the WebRTC offerer and to pick the winner of a duplicate
/// connection race, so both decisions always agree.
pub fn is_peer_id_smaller(a: &NodeId, b: &NodeId) -> bool {
    let (a_key, b_key) = (a.key(), b.key());
    match offering_hash(&a_key, &b_key).cmp(&offering_hash(&b_key, &a_key)) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => a.as_bytes() < b.as_bytes(),
    }
}

/// The local side offers when its own id is the smaller one.
pub fn is_offerer(local: &NodeId, remote: &NodeId) -> bool {
    is_peer_id_smaller(local, remote)
}
