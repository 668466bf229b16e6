use std::collections::{HashMap, HashSet};

use crate::identifiers::PeerKey;
use crate::protocol::LockId;

/// Registry of the reasons a connection must be kept open.
///
/// Local locks are taken by services on this node, remote locks mirror lock
/// requests received from the peer and weak locks are anonymous short-lived
/// pins. A peer is locked while it appears in any of the three registries.
/// Every operation is idempotent.
#[derive(Debug, Default)]
pub struct ConnectionLockHandler {
    local_locks: HashMap<PeerKey, HashSet<LockId>>,
    remote_locks: HashMap<PeerKey, HashSet<LockId>>,
    weak_locks: HashSet<PeerKey>,
}

fn add(registry: &mut HashMap<PeerKey, HashSet<LockId>>, peer: PeerKey, lock_id: LockId) {
    registry.entry(peer).or_default().insert(lock_id);
}

fn remove(registry: &mut HashMap<PeerKey, HashSet<LockId>>, peer: &PeerKey, lock_id: &str) {
    if let Some(locks) = registry.get_mut(peer) {
        locks.remove(lock_id);
        if locks.is_empty() {
            registry.remove(peer);
        }
    }
}

fn contains(
    registry: &HashMap<PeerKey, HashSet<LockId>>,
    peer: &PeerKey,
    lock_id: Option<&str>,
) -> bool {
    match (registry.get(peer), lock_id) {
        (Some(locks), Some(lock_id)) => locks.contains(lock_id),
        (Some(_), None) => true,
        (None, _) => false,
    }
}

impl ConnectionLockHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_local_locked(&mut self, peer: PeerKey, lock_id: LockId) {
        add(&mut self.local_locks, peer, lock_id);
    }

    pub fn remove_local_locked(&mut self, peer: &PeerKey, lock_id: &str) {
        remove(&mut self.local_locks, peer, lock_id);
    }

    pub fn add_remote_locked(&mut self, peer: PeerKey, lock_id: LockId) {
        add(&mut self.remote_locks, peer, lock_id);
    }

    pub fn remove_remote_locked(&mut self, peer: &PeerKey, lock_id: &str) {
        remove(&mut self.remote_locks, peer, lock_id);
    }

    pub fn add_weak_locked(&mut self, peer: PeerKey) {
        self.weak_locks.insert(peer);
    }

    pub fn remove_weak_locked(&mut self, peer: &PeerKey) {
        self.weak_locks.remove(peer);
    }

    pub fn is_locked(&self, peer: &PeerKey) -> bool {
        self.local_locks.contains_key(peer)
            || self.remote_locks.contains_key(peer)
            || self.weak_locks.contains(peer)
    }

    /// `lock_id = None` asks whether any local lock is held for the peer.
    pub fn is_local_locked(&self, peer: &PeerKey, lock_id: Option<&str>) -> bool {
        contains(&self.local_locks, peer, lock_id)
    }

    /// `lock_id = None` asks whether any remote lock is held for the peer.
    pub fn is_remote_locked(&self, peer: &PeerKey, lock_id: Option<&str>) -> bool {
        contains(&self.remote_locks, peer, lock_id)
    }

    pub fn is_weak_locked(&self, peer: &PeerKey) -> bool {
        self.weak_locks.contains(peer)
    }

    pub fn clear_all_locks(&mut self, peer: &PeerKey) {
        self.local_locks.remove(peer);
        self.remote_locks.remove(peer);
        self.weak_locks.remove(peer);
    }

    pub fn local_locked_count(&self) -> usize {
        self.local_locks.len()
    }

    pub fn remote_locked_count(&self) -> usize {
        self.remote_locks.len()
    }

    pub fn weak_locked_count(&self) -> usize {
        self.weak_locks.len()
    }
}
