//! WebRTC transport: one ordered data channel per peer, negotiated over a
//! signaling transport.

mod connection;
mod connector;
pub mod negotiation;

pub use connection::{LocalSignal, WebrtcConnection};
pub use connector::WebrtcConnector;
pub use negotiation::{
    is_private_candidate, replace_internal_ip_with_external_ip, NegotiationRole, NegotiationState,
    SdpKind,
};
