mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{connected, descriptor, disconnected, eventually, init_tracing, simulated_node};
use dht_connection::{ConnectionManagerConfig, Message, SendOptions, Simulator};

fn collecting_config() -> ConnectionManagerConfig {
    ConnectionManagerConfig::default()
        .with_max_connections(1)
        .with_gc_interval(Duration::from_secs(1))
        .with_gc_idle_threshold(Duration::from_secs(2))
}

#[tokio::test(start_paused = true)]
async fn idle_unlocked_connections_are_collected() {
    init_tracing();
    let simulator = Simulator::new();
    let hub = simulated_node(&simulator, descriptor(1), collecting_config()).await;
    let locked = simulated_node(&simulator, descriptor(2), ConnectionManagerConfig::default()).await;
    let idle = simulated_node(&simulator, descriptor(3), ConnectionManagerConfig::default()).await;
    let other = simulated_node(&simulator, descriptor(4), ConnectionManagerConfig::default()).await;
    let mut hub_events = hub.subscribe();
    let mut idle_events = idle.subscribe();

    hub.lock_connection(&descriptor(2), "routing");
    for byte in [3, 4] {
        hub.send(
            Message::application("test/ping", descriptor(byte), Bytes::from_static(b"ping")),
            SendOptions::default(),
        )
        .await
        .unwrap();
    }
    for _ in 0..3 {
        connected(&mut hub_events).await;
    }
    assert_eq!(hub.connection_count(), 3);

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(hub.connection_count(), 1);
    assert!(hub.has_connection(&descriptor(2)));
    let (peer, graceful) = disconnected(&mut idle_events).await;
    assert_eq!(peer, descriptor(1));
    assert!(!graceful);
    assert!(!other.has_connection(&descriptor(1)));
    assert!(locked.has_connection(&descriptor(1)));

    for node in [&hub, &locked, &idle, &other] {
        node.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn nothing_is_collected_below_the_limit() {
    init_tracing();
    let simulator = Simulator::new();
    let config = collecting_config().with_max_connections(4);
    let hub = simulated_node(&simulator, descriptor(1), config).await;
    let peer = simulated_node(&simulator, descriptor(2), ConnectionManagerConfig::default()).await;
    let mut hub_events = hub.subscribe();

    hub.send(
        Message::application("test/ping", descriptor(2), Bytes::from_static(b"ping")),
        SendOptions::default(),
    )
    .await
    .unwrap();
    connected(&mut hub_events).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(hub.has_connection(&descriptor(2)));
    assert_eq!(hub.garbage_collect_connections(4, Duration::ZERO).await, 0);

    hub.stop().await;
    peer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn recently_used_connections_survive_manual_collection() {
    init_tracing();
    let simulator = Simulator::new();
    let hub = simulated_node(&simulator, descriptor(1), ConnectionManagerConfig::default()).await;
    let first = simulated_node(&simulator, descriptor(2), ConnectionManagerConfig::default()).await;
    let second = simulated_node(&simulator, descriptor(3), ConnectionManagerConfig::default()).await;
    let mut hub_events = hub.subscribe();

    for byte in [2, 3] {
        hub.send(
            Message::application("test/ping", descriptor(byte), Bytes::from_static(b"ping")),
            SendOptions::default(),
        )
        .await
        .unwrap();
    }
    connected(&mut hub_events).await;
    connected(&mut hub_events).await;

    assert_eq!(
        hub.garbage_collect_connections(0, Duration::from_secs(60)).await,
        0
    );
    assert_eq!(hub.connection_count(), 2);
    assert_eq!(hub.garbage_collect_connections(1, Duration::ZERO).await, 1);
    eventually(|| hub.connection_count() == 1).await;

    for node in [&hub, &first, &second] {
        node.stop().await;
    }
}
