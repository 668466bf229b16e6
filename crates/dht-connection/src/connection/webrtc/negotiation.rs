//! Offer/answer bookkeeping of one WebRTC connection, kept free of any network
//! types so glare and candidate queueing can be tested directly.

use std::net::IpAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferSent,
    AnswerSent,
    IceGathering,
    Open,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteDescriptionAction {
    Apply,
    Ignore,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateAction {
    Apply,
    Queue,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCandidate {
    pub candidate: String,
    pub mid: Option<String>,
}

#[derive(Debug)]
pub struct Negotiation {
    role: NegotiationRole,
    state: NegotiationState,
    making_offer: bool,
    remote_description_set: bool,
    pending_candidates: Vec<RemoteCandidate>,
}

impl Negotiation {
    pub fn new(role: NegotiationRole) -> Self {
        Self {
            role,
            state: NegotiationState::New,
            making_offer: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, NegotiationState::Open | NegotiationState::Failed)
    }

    pub fn begin_offer(&mut self) {
        self.making_offer = true;
    }

    pub fn offer_sent(&mut self) {
        self.making_offer = false;
        if self.state == NegotiationState::New {
            self.state = NegotiationState::OfferSent;
        }
    }

    /// The designated offerer ignores a colliding offer while it is making its
    /// own; the other side accepts ours instead.
    pub fn would_accept_offer(&self) -> bool {
        !(self.making_offer && self.role == NegotiationRole::Offerer)
    }

    pub fn on_remote_description(&mut self, kind: SdpKind) -> RemoteDescriptionAction {
        if self.state == NegotiationState::Failed {
            return RemoteDescriptionAction::Ignore;
        }
        match kind {
            SdpKind::Offer if self.would_accept_offer() => RemoteDescriptionAction::Apply,
            SdpKind::Offer => RemoteDescriptionAction::Ignore,
            SdpKind::Answer if self.state == NegotiationState::OfferSent => {
                RemoteDescriptionAction::Apply
            }
            SdpKind::Answer => RemoteDescriptionAction::Ignore,
        }
    }

    /// Returns the candidates that arrived before the remote description.
    pub fn remote_description_applied(&mut self) -> Vec<RemoteCandidate> {
        self.remote_description_set = true;
        if self.state == NegotiationState::OfferSent {
            self.state = NegotiationState::IceGathering;
        }
        std::mem::take(&mut self.pending_candidates)
    }

    pub fn answer_sent(&mut self) {
        if !self.is_terminal() {
            self.state = NegotiationState::AnswerSent;
        }
    }

    pub fn ice_checking(&mut self) {
        if matches!(
            self.state,
            NegotiationState::OfferSent | NegotiationState::AnswerSent
        ) {
            self.state = NegotiationState::IceGathering;
        }
    }

    pub fn on_remote_candidate(&mut self, candidate: RemoteCandidate) -> CandidateAction {
        if self.remote_description_set {
            CandidateAction::Apply
        } else {
            self.pending_candidates.push(candidate);
            CandidateAction::Queue
        }
    }

    pub fn opened(&mut self) {
        if self.state != NegotiationState::Failed {
            self.state = NegotiationState::Open;
        }
    }

    pub fn failed(&mut self) {
        self.making_offer = false;
        self.pending_candidates.clear();
        self.state = NegotiationState::Failed;
    }
}

fn candidate_fields(candidate: &str) -> Vec<&str> {
    candidate.split_whitespace().collect()
}

/// Whether the candidate's connection address is loopback, link-local, private
/// or an mDNS name.
pub fn is_private_candidate(candidate: &str) -> bool {
    let fields = candidate_fields(candidate);
    let Some(address) = fields.get(4) else {
        return false;
    };
    if address.ends_with(".local") {
        return true;
    }
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
        Ok(IpAddr::V6(ip)) => {
            let first = ip.segments()[0];
            ip.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

/// Rewrites the address of a host candidate. Other candidate types pass
/// through unchanged.
pub fn replace_internal_ip_with_external_ip(candidate: &str, external_ip: &str) -> String {
    let mut fields = candidate_fields(candidate);
    if fields.len() > 7 && fields[7] == "host" {
        fields[4] = external_ip;
        fields.join(" ")
    } else {
        candidate.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(text: &str) -> RemoteCandidate {
        RemoteCandidate {
            candidate: text.into(),
            mid: Some("0".into()),
        }
    }

    #[test]
    fn offerer_walks_to_open() {
        let mut negotiation = Negotiation::new(NegotiationRole::Offerer);
        negotiation.begin_offer();
        negotiation.offer_sent();
        assert_eq!(negotiation.state(), NegotiationState::OfferSent);
        assert_eq!(
            negotiation.on_remote_description(SdpKind::Answer),
            RemoteDescriptionAction::Apply
        );
        negotiation.remote_description_applied();
        assert_eq!(negotiation.state(), NegotiationState::IceGathering);
        negotiation.opened();
        assert_eq!(negotiation.state(), NegotiationState::Open);
    }

    #[test]
    fn answerer_walks_to_open() {
        let mut negotiation = Negotiation::new(NegotiationRole::Answerer);
        assert_eq!(
            negotiation.on_remote_description(SdpKind::Offer),
            RemoteDescriptionAction::Apply
        );
        negotiation.remote_description_applied();
        negotiation.answer_sent();
        assert_eq!(negotiation.state(), NegotiationState::AnswerSent);
        negotiation.ice_checking();
        assert_eq!(negotiation.state(), NegotiationState::IceGathering);
        negotiation.opened();
        assert_eq!(negotiation.state(), NegotiationState::Open);
    }

    #[test]
    fn offerer_ignores_colliding_offer_while_making_its_own() {
        let mut negotiation = Negotiation::new(NegotiationRole::Offerer);
        negotiation.begin_offer();
        assert_eq!(
            negotiation.on_remote_description(SdpKind::Offer),
            RemoteDescriptionAction::Ignore
        );
        negotiation.offer_sent();
        assert_eq!(
            negotiation.on_remote_description(SdpKind::Offer),
            RemoteDescriptionAction::Apply
        );
    }

    #[test]
    fn answerer_accepts_offers_even_while_making_one() {
        let mut negotiation = Negotiation::new(NegotiationRole::Answerer);
        negotiation.begin_offer();
        assert!(negotiation.would_accept_offer());
        assert_eq!(
            negotiation.on_remote_description(SdpKind::Offer),
            RemoteDescriptionAction::Apply
        );
    }

    #[test]
    fn unexpected_answer_is_ignored() {
        let mut negotiation = Negotiation::new(NegotiationRole::Answerer);
        assert_eq!(
            negotiation.on_remote_description(SdpKind::Answer),
            RemoteDescriptionAction::Ignore
        );
    }

    #[test]
    fn early_candidates_are_queued_until_description() {
        let mut negotiation = Negotiation::new(NegotiationRole::Answerer);
        let first = candidate("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        let second = candidate("candidate:2 1 udp 1 10.0.0.2 5000 typ host");
        assert_eq!(negotiation.on_remote_candidate(first.clone()), CandidateAction::Queue);
        assert_eq!(negotiation.on_remote_candidate(second.clone()), CandidateAction::Queue);
        assert_eq!(negotiation.pending_candidate_count(), 2);

        assert_eq!(negotiation.remote_description_applied(), vec![first, second]);
        assert_eq!(
            negotiation.on_remote_candidate(candidate("candidate:3 1 udp 1 1.2.3.4 5000 typ host")),
            CandidateAction::Apply
        );
    }

    #[test]
    fn failed_negotiation_ignores_descriptions() {
        let mut negotiation = Negotiation::new(NegotiationRole::Offerer);
        negotiation.offer_sent();
        negotiation.failed();
        negotiation.opened();
        assert_eq!(negotiation.state(), NegotiationState::Failed);
        assert_eq!(
            negotiation.on_remote_description(SdpKind::Answer),
            RemoteDescriptionAction::Ignore
        );
    }

    #[test]
    fn private_candidates_are_detected() {
        assert!(is_private_candidate("candidate:1 1 udp 2130706431 192.168.1.20 5000 typ host"));
        assert!(is_private_candidate("candidate:1 1 udp 2130706431 127.0.0.1 5000 typ host"));
        assert!(is_private_candidate("candidate:1 1 udp 2130706431 fe80::1 5000 typ host"));
        assert!(is_private_candidate("candidate:1 1 udp 2130706431 abcd.local 5000 typ host"));
        assert!(!is_private_candidate("candidate:1 1 udp 1694498815 8.8.8.8 5000 typ srflx"));
        assert!(!is_private_candidate("garbage"));
    }

    #[test]
    fn only_host_candidates_are_rewritten() {
        assert_eq!(
            replace_internal_ip_with_external_ip(
                "candidate:1 1 udp 2130706431 10.0.0.5 5000 typ host",
                "203.0.113.7"
            ),
            "candidate:1 1 udp 2130706431 203.0.113.7 5000 typ host"
        );
        let srflx = "candidate:2 1 udp 1694498815 198.51.100.1 6000 typ srflx raddr 10.0.0.5 rport 5000";
        assert_eq!(replace_internal_ip_with_external_ip(srflx, "203.0.113.7"), srflx);
    }
}
