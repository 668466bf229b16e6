//! Connection management for a peer-to-peer overlay.
//!
//! A [`ConnectionManager`] keeps at most one live connection per remote peer,
//! whichever transport carried it (WebSocket, WebRTC or the in-process
//! simulator). It handshakes new connections and resolves simultaneous
//! connects. Application locks keep peers connected, and idle unlocked
//! connections are garbage collected.

pub mod config;
pub mod connection;
pub mod duplicate;
pub mod error;
pub mod gc;
pub mod identifiers;
pub mod locks;
pub mod manager;
pub mod protocol;
pub mod rpc;
pub mod transport;

pub use config::{
    ConnectionManagerConfig, IceServer, PortRange, TlsCertificate, WebrtcConnectorConfig,
    WebsocketConnectorConfig,
};
pub use connection::simulator::Simulator;
pub use connection::{
    ConnectionState, ConnectionType, Connector, ManagedConnection, ManagedEvent,
};
pub use error::{ConnectionError, Result, RpcError};
pub use identifiers::{
    is_offerer, is_peer_id_smaller, ConnectionId, NodeId, PeerDescriptor, PeerKey,
    WebsocketEndpoint,
};
pub use manager::{ConnectionManager, ManagerState};
pub use protocol::{DisconnectMode, Message, MessageBody, ServiceId};
pub use transport::{EventBus, SendOptions, Transport, TransportEvent, TransportEvents};
