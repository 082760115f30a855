//! Fragment reassembly for Session traffic.
//!
//! Fragments of one application message share a sequence number and carry
//! `fragment_index` 0..count. The transport is reliable and ordered, so the
//! collector only verifies order, it never sorts. An entry completes when
//! the received count reaches the declared count; it stays registered (in
//! `Dispatched` state) until the application handler resolves, so a
//! duplicated final fragment cannot reopen it.

use crate::error::{ProtocolError, Result};
use crate::header::CommonHeader;

/// Reassembly state of one sequence number
#[derive(Debug, PartialEq, Eq)]
enum Phase {
    /// Fragments still arriving
    Collecting,
    /// Buffer handed to the application; entry retained to absorb duplicates
    Dispatched,
}

/// Reassembly buffer for one application message
#[derive(Debug)]
pub struct PendingMessage {
    fragment_count: u16,
    received: u16,
    buffer: Vec<u8>,
    phase: Phase,
}

impl PendingMessage {
    /// Start a buffer from the first observed fragment header.
    #[must_use]
    pub fn new(header: &CommonHeader) -> Self {
        Self {
            fragment_count: header.fragment_count,
            received: 0,
            buffer: Vec::new(),
            phase: Phase::Collecting,
        }
    }

    /// Append one fragment payload.
    ///
    /// Returns `true` if the fragment was absorbed, `false` if the entry is
    /// already dispatched (late duplicate, dropped silently).
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Violation` when the fragment's declared count
    /// disagrees with the first fragment or its index is out of order.
    pub fn add_fragment(&mut self, header: &CommonHeader, payload: &[u8]) -> Result<bool> {
        if self.phase == Phase::Dispatched {
            return Ok(false);
        }
        if header.fragment_count != self.fragment_count {
            return Err(ProtocolError::violation("fragment count changed mid-message"));
        }
        if header.fragment_index != self.received {
            return Err(ProtocolError::violation("fragment out of order"));
        }

        self.buffer.extend_from_slice(payload);
        self.received += 1;
        Ok(true)
    }

    /// All declared fragments received?
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received == self.fragment_count
    }

    /// Take the assembled buffer and mark the entry dispatched.
    ///
    /// The caller removes the entry once the application handler resolves.
    #[must_use]
    pub fn take_buffer(&mut self) -> Vec<u8> {
        self.phase = Phase::Dispatched;
        std::mem::take(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MessageType;

    fn fragment_header(index: u16, count: u16) -> CommonHeader {
        let mut header = CommonHeader::new(MessageType::Session);
        header.sequence_number = 9;
        header.fragment_index = index;
        header.fragment_count = count;
        header
    }

    #[test]
    fn test_single_fragment_message() {
        let header = fragment_header(0, 1);
        let mut pending = PendingMessage::new(&header);
        assert!(pending.add_fragment(&header, b"payload").unwrap());
        assert!(pending.is_complete());
        assert_eq!(pending.take_buffer(), b"payload");
    }

    #[test]
    fn test_fragments_concatenate_in_arrival_order() {
        let mut pending = PendingMessage::new(&fragment_header(0, 3));
        for (i, part) in [b"aa".as_ref(), b"bb", b"cc"].iter().enumerate() {
            assert!(!pending.is_complete());
            pending
                .add_fragment(&fragment_header(i as u16, 3), part)
                .unwrap();
        }
        assert!(pending.is_complete());
        assert_eq!(pending.take_buffer(), b"aabbcc");
    }

    #[test]
    fn test_incomplete_with_missing_fragment() {
        let mut pending = PendingMessage::new(&fragment_header(0, 3));
        pending
            .add_fragment(&fragment_header(0, 3), b"aa")
            .unwrap();
        pending
            .add_fragment(&fragment_header(1, 3), b"bb")
            .unwrap();
        assert!(!pending.is_complete());
    }

    #[test]
    fn test_out_of_order_fragment_rejected() {
        let mut pending = PendingMessage::new(&fragment_header(0, 3));
        pending
            .add_fragment(&fragment_header(0, 3), b"aa")
            .unwrap();
        assert!(pending
            .add_fragment(&fragment_header(2, 3), b"cc")
            .is_err());
    }

    #[test]
    fn test_count_change_rejected() {
        let mut pending = PendingMessage::new(&fragment_header(0, 3));
        pending
            .add_fragment(&fragment_header(0, 3), b"aa")
            .unwrap();
        assert!(pending
            .add_fragment(&fragment_header(1, 4), b"bb")
            .is_err());
    }

    #[test]
    fn test_duplicate_final_fragment_absorbed_after_dispatch() {
        let header = fragment_header(0, 1);
        let mut pending = PendingMessage::new(&header);
        pending.add_fragment(&header, b"payload").unwrap();
        let _ = pending.take_buffer();

        // Late duplicate lands in the dispatched entry and is dropped.
        assert!(!pending.add_fragment(&header, b"payload").unwrap());
        assert!(pending.is_complete());
    }
}
