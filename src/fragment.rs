use std::collections::HashMap;

use crate::wire::handshake::HandshakeHeader;

/// Tracks the byte ranges received so far for one fragmented handshake
/// message (RFC 6347 §4.2.3). Completeness is determined by whether the
/// accepted intervals union to cover `[0, total_length)`, per spec.md §3's
/// fragment-completeness invariant — not by counting fragments, since
/// retransmitted or overlapping fragments must not corrupt reassembly.
struct PartialMessage {
    total_length: u32,
    buffer: Vec<u8>,
    received: Vec<(u32, u32)>, // half-open [start, end) byte ranges
}

impl PartialMessage {
    fn new(header: &HandshakeHeader) -> Self {
        PartialMessage {
            total_length: header.length,
            buffer: vec![0u8; header.length as usize],
            received: vec![],
        }
    }

    fn insert(&mut self, offset: u32, data: &[u8]) {
        let end = offset + data.len() as u32;
        if end > self.total_length {
            return;
        }
        self.buffer[offset as usize..end as usize].copy_from_slice(data);
        self.received.push((offset, end));
        self.received.sort_unstable();
        self.merge_intervals();
    }

    fn merge_intervals(&mut self) {
        let mut merged: Vec<(u32, u32)> = vec![];
        for (start, end) in self.received.drain(..) {
            if let Some(last) = merged.last_mut() {
                if start <= last.1 {
                    last.1 = last.1.max(end);
                    continue;
                }
            }
            merged.push((start, end));
        }
        self.received = merged;
    }

    fn is_complete(&self) -> bool {
        self.received.len() == 1 && self.received[0] == (0, self.total_length)
    }
}

/// Keyed by `message_seq`, holds in-flight fragment reassembly state for a
/// single handshake flight. Grounded on the teacher's fragment push/pop
/// handling in `conn.rs::handle_incoming_packet`, generalized from one
/// `Conn` per peer to a plain data structure a `Handshaker` owns.
#[derive(Default)]
pub struct FragmentBuffer {
    partial: HashMap<u16, PartialMessage>,
}

impl FragmentBuffer {
    pub fn new() -> Self {
        FragmentBuffer { partial: HashMap::new() }
    }

    /// Pushes one fragment. Returns the reassembled message body once the
    /// union of received fragments covers the whole message.
    pub fn push(&mut self, header: &HandshakeHeader, fragment: &[u8]) -> Option<Vec<u8>> {
        let entry = self
            .partial
            .entry(header.message_seq)
            .or_insert_with(|| PartialMessage::new(header));
        entry.insert(header.fragment_offset, fragment);

        if entry.is_complete() {
            let message = self.partial.remove(&header.message_seq).unwrap();
            Some(message.buffer)
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod fragment_test {
    use super::*;
    use crate::wire::handshake::HandshakeType;

    fn header(message_seq: u16, length: u32, fragment_offset: u32, fragment_length: u32) -> HandshakeHeader {
        HandshakeHeader {
            handshake_type: HandshakeType::ClientHello,
            length,
            message_seq,
            fragment_offset,
            fragment_length,
        }
    }

    #[test]
    fn reassembles_in_order_fragments() {
        let mut buf = FragmentBuffer::new();
        assert!(buf.push(&header(1, 10, 0, 5), &[0, 1, 2, 3, 4]).is_none());
        let full = buf.push(&header(1, 10, 5, 5), &[5, 6, 7, 8, 9]).unwrap();
        assert_eq!(full, (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn reassembles_out_of_order_and_overlapping_fragments() {
        let mut buf = FragmentBuffer::new();
        assert!(buf.push(&header(2, 10, 5, 5), &[5, 6, 7, 8, 9]).is_none());
        assert!(buf.push(&header(2, 10, 3, 4), &[3, 4, 5, 6]).is_none());
        let full = buf.push(&header(2, 10, 0, 4), &[0, 1, 2, 3]).unwrap();
        assert_eq!(full, (0..10).collect::<Vec<u8>>());
    }
}
