use crate::wire::handshake::{Handshake, HandshakeType};

/// One fully reassembled handshake message plus the metadata a pull rule
/// matches against and the raw bytes needed to feed the running transcript
/// hash for Finished/CertificateVerify.
#[derive(Clone)]
struct CachedMessage {
    handshake_type: HandshakeType,
    is_client: bool,
    epoch: u16,
    message_seq: u16,
    raw: Vec<u8>,
    handshake: Handshake,
}

/// A rule describing one message a flight wants to pull out of the cache:
/// which type, whose epoch, from which side, and whether its absence should
/// fail the pull (`optional == false`) or simply be skipped.
/// Grounded on the teacher's `HandshakeCachePullRule`/`full_pull_map` used
/// throughout `flight/flight0.rs`, `flight1.rs`, `flight3.rs`, `flight6.rs`
/// to reconstruct a flight's expected set of messages regardless of the
/// order records happened to arrive on the wire.
pub struct PullRule {
    pub handshake_type: HandshakeType,
    pub epoch: u16,
    pub is_client: bool,
    pub optional: bool,
}

/// Accumulates every handshake message sent or received over the life of a
/// handshake, in the exact bytes exchanged on the wire (fragment headers
/// stripped, flight framing stripped) so the running transcript hash used
/// by Finished and CertificateVerify always matches what the peer computed.
#[derive(Default)]
pub struct HandshakeCache {
    messages: Vec<CachedMessage>,
}

impl HandshakeCache {
    pub fn new() -> Self {
        HandshakeCache { messages: vec![] }
    }

    pub fn push(&mut self, handshake: Handshake, raw: Vec<u8>, epoch: u16, is_client: bool) {
        self.messages.push(CachedMessage {
            handshake_type: handshake.message.handshake_type(),
            is_client,
            epoch,
            message_seq: handshake.header.message_seq,
            raw,
            handshake,
        });
    }

    /// Pulls one message matching each rule, in rule order, deduplicating
    /// by `(handshake_type, is_client)` so a retransmitted copy of the same
    /// message does not get pulled twice. Returns `None` if any non-optional
    /// rule has no match.
    pub fn full_pull_map(&self, rules: &[PullRule]) -> Option<Vec<Option<Handshake>>> {
        let mut out = Vec::with_capacity(rules.len());
        for rule in rules {
            let found = self
                .messages
                .iter()
                .find(|m| m.handshake_type == rule.handshake_type && m.is_client == rule.is_client && m.epoch == rule.epoch)
                .map(|m| m.handshake.clone());

            if found.is_none() && !rule.optional {
                return None;
            }
            out.push(found);
        }
        Some(out)
    }

    /// Concatenated raw bytes of every message in transcript order, the
    /// input to the running handshake hash Finished/CertificateVerify sign
    /// over (RFC 5246 §7.4.9).
    pub fn transcript(&self) -> Vec<u8> {
        let mut out = vec![];
        for m in &self.messages {
            out.extend_from_slice(&m.raw);
        }
        out
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod handshake_cache_test {
    use super::*;
    use crate::wire::handshake::{Handshake, HandshakeMessage, ServerHelloDone};

    #[test]
    fn pull_map_finds_matching_message() {
        let mut cache = HandshakeCache::new();
        let handshake = Handshake::new(HandshakeMessage::ServerHelloDone(ServerHelloDone));
        cache.push(handshake, vec![1, 2, 3], 0, false);

        let rules = [PullRule {
            handshake_type: HandshakeType::ServerHelloDone,
            epoch: 0,
            is_client: false,
            optional: false,
        }];
        let pulled = cache.full_pull_map(&rules).unwrap();
        assert!(pulled[0].is_some());
    }

    #[test]
    fn pull_map_fails_on_missing_required_message() {
        let cache = HandshakeCache::new();
        let rules = [PullRule {
            handshake_type: HandshakeType::ServerHelloDone,
            epoch: 0,
            is_client: false,
            optional: false,
        }];
        assert!(cache.full_pull_map(&rules).is_none());
    }

    #[test]
    fn pull_map_allows_missing_optional_message() {
        let cache = HandshakeCache::new();
        let rules = [PullRule {
            handshake_type: HandshakeType::CertificateRequest,
            epoch: 0,
            is_client: false,
            optional: true,
        }];
        let pulled = cache.full_pull_map(&rules).unwrap();
        assert!(pulled[0].is_none());
    }
}
