//! WebSocket transport: a client connection, a server that accepts upgrades
//! (optionally over TLS) and the connector that picks between dialing and
//! asking the peer to dial back.

mod connection;
mod connector;
mod server;

pub use connection::WebsocketConnection;
pub use connector::WebsocketConnector;
