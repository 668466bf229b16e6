mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{
    application_payload, connected, descriptor, disconnected, eventually, init_tracing,
    RelaySignaling,
};
use dht_connection::{
    ConnectionError, ConnectionManager, ConnectionManagerConfig, ConnectionType, Message,
    PortRange, SendOptions, Transport, WebsocketConnectorConfig,
};

const SERVICE: &str = "test/loopback";

fn server_config() -> ConnectionManagerConfig {
    ConnectionManagerConfig::default().with_websocket(WebsocketConnectorConfig {
        host: "127.0.0.1".into(),
        bind_address: "127.0.0.1".into(),
        port_range: Some(PortRange::new(0, 0).unwrap()),
        ..WebsocketConnectorConfig::default()
    })
}

#[tokio::test]
async fn client_reaches_server_over_websocket() {
    init_tracing();
    let server = ConnectionManager::new(server_config(), descriptor(1), None);
    server.start().await.unwrap();
    let server_descriptor = server.local_peer_descriptor();
    let endpoint = server_descriptor.websocket.clone().expect("server endpoint");
    assert_ne!(endpoint.port, 0);

    let client = ConnectionManager::new(ConnectionManagerConfig::default(), descriptor(2), None);
    client.start().await.unwrap();
    let mut server_events = server.subscribe();
    let mut client_events = client.subscribe();

    client
        .send(
            Message::application(SERVICE, server_descriptor.clone(), Bytes::from_static(b"ping")),
            SendOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(connected(&mut client_events).await, descriptor(1));
    assert_eq!(application_payload(&mut server_events, SERVICE).await, b"ping");

    let connection = client.get_connection(&server_descriptor).unwrap();
    assert_eq!(connection.connection_type(), ConnectionType::WebsocketClient);
    assert_eq!(
        server.get_connection(&descriptor(2)).unwrap().connection_id(),
        connection.connection_id()
    );

    server
        .send(
            Message::application(SERVICE, descriptor(2), Bytes::from_static(b"pong")),
            SendOptions::do_not_connect(),
        )
        .await
        .unwrap();
    assert_eq!(application_payload(&mut client_events, SERVICE).await, b"pong");

    client.stop().await;
    let (peer, graceful) = disconnected(&mut server_events).await;
    assert_eq!(peer, descriptor(2));
    assert!(graceful);

    server.stop().await;
}

#[tokio::test]
async fn peers_without_servers_cannot_connect() {
    init_tracing();
    let alice = ConnectionManager::new(ConnectionManagerConfig::default(), descriptor(1), None);
    let bob = ConnectionManager::new(ConnectionManagerConfig::default(), descriptor(2), None);
    alice.start().await.unwrap();
    bob.start().await.unwrap();

    let err = alice
        .send(
            Message::application(SERVICE, bob.local_peer_descriptor(), Bytes::from_static(b"hi")),
            SendOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::SendFailed(_)));
    assert!(!alice.has_connection(&descriptor(2)));

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn peer_without_server_dials_back() {
    init_tracing();
    let (server_signaling, client_signaling) = RelaySignaling::pair(descriptor(1), descriptor(2));
    let server = ConnectionManager::new(
        server_config(),
        descriptor(1),
        Some(server_signaling.clone() as Arc<dyn Transport>),
    );
    let client = ConnectionManager::new(
        ConnectionManagerConfig::default(),
        descriptor(2),
        Some(client_signaling as Arc<dyn Transport>),
    );
    server.start().await.unwrap();
    client.start().await.unwrap();
    server_signaling.set_local(server.local_peer_descriptor());
    let client_descriptor = client.local_peer_descriptor();
    assert!(client_descriptor.websocket.is_none());
    let mut server_events = server.subscribe();
    let mut client_events = client.subscribe();

    for payload in [&b"one"[..], b"two", b"three"] {
        server
            .send(
                Message::application(SERVICE, client_descriptor.clone(), Bytes::copy_from_slice(payload)),
                SendOptions::default(),
            )
            .await
            .unwrap();
    }
    assert_eq!(connected(&mut server_events).await, descriptor(2));
    for expected in [&b"one"[..], b"two", b"three"] {
        assert_eq!(application_payload(&mut client_events, SERVICE).await, expected);
    }

    eventually(|| {
        match (
            server.get_connection(&descriptor(2)),
            client.get_connection(&descriptor(1)),
        ) {
            (Some(ours), Some(theirs)) => {
                ours.is_handshake_completed()
                    && theirs.is_handshake_completed()
                    && ours.connection_id() == theirs.connection_id()
            }
            _ => false,
        }
    })
    .await;
    let accepted = server.get_connection(&descriptor(2)).unwrap();
    assert_eq!(accepted.connection_type(), ConnectionType::WebsocketServer);
    assert_eq!(
        client.get_connection(&descriptor(1)).unwrap().connection_type(),
        ConnectionType::WebsocketClient
    );
    assert_eq!(server.connection_count(), 1);
    assert_eq!(client.connection_count(), 1);

    client.stop().await;
    server.stop().await;
}
