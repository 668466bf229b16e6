use std::time::Duration;

use crate::identifiers::{NodeId, PeerDescriptor};

/// An unlocked, idle connection that garbage collection may close.
#[derive(Clone, Debug)]
pub struct GcCandidate {
    pub peer: PeerDescriptor,
    pub idle: Duration,
}

/// Picks up to `count` candidates, farthest from `local` first and the longest
/// idle among equally distant ones.
pub fn select_for_disconnect(
    local: &NodeId,
    mut candidates: Vec<GcCandidate>,
    count: usize,
) -> Vec<PeerDescriptor> {
    candidates.sort_by(|a, b| {
        let a_distance = local.distance(&a.peer.node_id);
        let b_distance = local.distance(&b.peer.node_id);
        b_distance
            .cmp(&a_distance)
            .then_with(|| b.idle.cmp(&a.idle))
    });
    candidates
        .into_iter()
        .take(count)
        .map(|candidate| candidate.peer)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(first_byte: u8, idle_secs: u64) -> GcCandidate {
        GcCandidate {
            peer: PeerDescriptor::new(NodeId::new(vec![first_byte, 0, 0, 0])),
            idle: Duration::from_secs(idle_secs),
        }
    }

    #[test]
    fn farthest_peers_go_first() {
        let local = NodeId::new(vec![0, 0, 0, 0]);
        let chosen = select_for_disconnect(
            &local,
            vec![candidate(0x01, 60), candidate(0x80, 30), candidate(0x10, 90)],
            2,
        );
        let firsts: Vec<u8> = chosen.iter().map(|peer| peer.node_id.as_bytes()[0]).collect();
        assert_eq!(firsts, vec![0x80, 0x10]);
    }

    #[test]
    fn count_larger_than_candidates_returns_all() {
        let local = NodeId::new(vec![0, 0, 0, 0]);
        let chosen = select_for_disconnect(&local, vec![candidate(0x01, 1)], 10);
        assert_eq!(chosen.len(), 1);
    }

    #[test]
    fn zero_count_selects_nothing() {
        let local = NodeId::new(vec![0, 0, 0, 0]);
        assert!(select_for_disconnect(&local, vec![candidate(0x01, 1)], 0).is_empty());
    }
}
