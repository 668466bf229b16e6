mod common;

use common::{connected, descriptor, eventually, init_tracing, simulated_node};
use dht_connection::{ConnectionManagerConfig, DisconnectMode, Simulator};

#[tokio::test]
async fn lock_is_mirrored_on_the_remote_side() {
    init_tracing();
    let simulator = Simulator::new();
    let alice = simulated_node(&simulator, descriptor(1), ConnectionManagerConfig::default()).await;
    let bob = simulated_node(&simulator, descriptor(2), ConnectionManagerConfig::default()).await;
    let mut alice_events = alice.subscribe();

    alice.lock_connection(&descriptor(2), "routing");
    assert!(alice.is_local_locked(&descriptor(2), Some("routing")));
    assert_eq!(connected(&mut alice_events).await, descriptor(2));

    eventually(|| bob.is_remote_locked(&descriptor(1), Some("routing"))).await;
    assert!(bob.is_connection_locked(&descriptor(1)));
    assert_eq!(bob.remote_locked_count(), 1);
    assert!(!bob.is_local_locked(&descriptor(1), None));

    alice.unlock_connection(&descriptor(2), "routing");
    assert!(!alice.is_connection_locked(&descriptor(2)));
    eventually(|| !bob.is_remote_locked(&descriptor(1), None)).await;

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn locks_with_different_ids_are_independent() {
    init_tracing();
    let simulator = Simulator::new();
    let alice = simulated_node(&simulator, descriptor(1), ConnectionManagerConfig::default()).await;
    let bob = simulated_node(&simulator, descriptor(2), ConnectionManagerConfig::default()).await;

    alice.lock_connection(&descriptor(2), "routing");
    alice.lock_connection(&descriptor(2), "storage");
    eventually(|| {
        bob.is_remote_locked(&descriptor(1), Some("routing"))
            && bob.is_remote_locked(&descriptor(1), Some("storage"))
    })
    .await;

    alice.unlock_connection(&descriptor(2), "routing");
    eventually(|| !bob.is_remote_locked(&descriptor(1), Some("routing"))).await;
    assert!(bob.is_remote_locked(&descriptor(1), Some("storage")));
    assert!(alice.is_local_locked(&descriptor(2), Some("storage")));

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn disconnect_clears_locks_on_both_sides() {
    init_tracing();
    let simulator = Simulator::new();
    let alice = simulated_node(&simulator, descriptor(1), ConnectionManagerConfig::default()).await;
    let bob = simulated_node(&simulator, descriptor(2), ConnectionManagerConfig::default()).await;

    alice.lock_connection(&descriptor(2), "routing");
    eventually(|| bob.is_remote_locked(&descriptor(1), Some("routing"))).await;

    alice
        .gracefully_disconnect(&descriptor(2), DisconnectMode::Normal)
        .await;
    eventually(|| !alice.has_connection(&descriptor(2)) && !bob.has_connection(&descriptor(1))).await;
    assert!(!alice.is_connection_locked(&descriptor(2)));
    assert!(!bob.is_connection_locked(&descriptor(1)));
    assert_eq!(bob.remote_locked_count(), 0);

    alice.stop().await;
    bob.stop().await;
}
