mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{
    application_payload, descriptor, eventually, init_tracing, queued_events, simulated_node,
};
use dht_connection::{
    ConnectionManager, ConnectionManagerConfig, Message, SendOptions, Simulator, TransportEvent,
};

const SERVICE: &str = "test/echo";
const BURST: u8 = 10;

#[tokio::test]
async fn simultaneous_connects_converge_on_one_connection() {
    init_tracing();
    let simulator = Simulator::with_latency(Duration::from_millis(20));
    let alice = simulated_node(&simulator, descriptor(1), ConnectionManagerConfig::default()).await;
    let bob = simulated_node(&simulator, descriptor(2), ConnectionManagerConfig::default()).await;
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();
    let announcements = [alice.subscribe(), bob.subscribe()];

    let burst = |node: ConnectionManager, target: u8| async move {
        for index in 0..BURST {
            node.send(
                Message::application(SERVICE, descriptor(target), vec![index]),
                SendOptions::default(),
            )
            .await
            .unwrap();
        }
    };
    tokio::join!(burst(alice.clone(), 2), burst(bob.clone(), 1));

    for index in 0..BURST {
        assert_eq!(application_payload(&mut bob_events, SERVICE).await, vec![index]);
        assert_eq!(application_payload(&mut alice_events, SERVICE).await, vec![index]);
    }

    eventually(|| {
        match (alice.get_connection(&descriptor(2)), bob.get_connection(&descriptor(1))) {
            (Some(ours), Some(theirs)) => {
                ours.is_handshake_completed()
                    && theirs.is_handshake_completed()
                    && ours.connection_id() == theirs.connection_id()
            }
            _ => false,
        }
    })
    .await;
    assert_eq!(alice.connection_count(), 1);
    assert_eq!(bob.connection_count(), 1);

    // A replaced entry must not announce the peer a second time.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for mut events in announcements {
        let connected = queued_events(&mut events)
            .into_iter()
            .filter(|event| matches!(event, TransportEvent::Connected(_)))
            .count();
        assert_eq!(connected, 1);
    }

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn messages_sent_before_the_handshake_arrive_in_order() {
    init_tracing();
    let simulator = Simulator::with_latency(Duration::from_millis(5));
    let alice = simulated_node(&simulator, descriptor(1), ConnectionManagerConfig::default()).await;
    let bob = simulated_node(&simulator, descriptor(2), ConnectionManagerConfig::default()).await;
    let mut bob_events = bob.subscribe();

    for index in 0..5u8 {
        alice
            .send(
                Message::application(SERVICE, descriptor(2), vec![index]),
                SendOptions::default(),
            )
            .await
            .unwrap();
    }
    assert!(!alice
        .get_connection(&descriptor(2))
        .unwrap()
        .is_handshake_completed());

    for index in 0..5u8 {
        assert_eq!(application_payload(&mut bob_events, SERVICE).await, vec![index]);
    }

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn duplicate_messages_are_delivered_once() {
    init_tracing();
    let simulator = Simulator::new();
    let alice = simulated_node(&simulator, descriptor(1), ConnectionManagerConfig::default()).await;
    let bob = simulated_node(&simulator, descriptor(2), ConnectionManagerConfig::default()).await;
    let mut bob_events = bob.subscribe();

    let message = Message::application(SERVICE, descriptor(2), Bytes::from_static(b"once"));
    alice.send(message.clone(), SendOptions::default()).await.unwrap();
    alice.send(message, SendOptions::default()).await.unwrap();
    alice
        .send(
            Message::application(SERVICE, descriptor(2), Bytes::from_static(b"after")),
            SendOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(application_payload(&mut bob_events, SERVICE).await, b"once");
    assert_eq!(application_payload(&mut bob_events, SERVICE).await, b"after");

    alice.stop().await;
    bob.stop().await;
}
