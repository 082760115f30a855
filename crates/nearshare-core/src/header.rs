//! CommonHeader encoding and decoding.
//!
//! The header opens every frame. Its payload-size field is reserved during
//! serialization and back-patched once the body has been written, so the
//! declared size always equals the bytes that follow the header.

use crate::wire::{Reader, WireError, Writer};

/// Top-level message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Key exchange and authentication handshake
    Connect = 0,
    /// Channel management
    Control = 1,
    /// Application traffic (encrypted, possibly fragmented)
    Session = 2,
    /// Acknowledgment frame
    Ack = 3,
    /// Reliability layer response (always benign)
    ReliabilityResponse = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Connect),
            1 => Ok(Self::Control),
            2 => Ok(Self::Session),
            3 => Ok(Self::Ack),
            4 => Ok(Self::ReliabilityResponse),
            other => Err(WireError::InvalidTag(other)),
        }
    }
}

/// Header flags bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags(u16);

impl MessageFlags {
    /// Body is AES-CBC ciphertext followed by an HMAC trailer
    pub const ENCRYPTED: u16 = 0x0001;
    /// Receiver must emit an Ack frame on delivery
    pub const SHOULD_ACK: u16 = 0x0002;
    /// Sender is the hosting side of the session
    pub const SESSION_HOST: u16 = 0x0004;

    /// Empty flag set
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Wrap a raw flags word (unknown bits preserved)
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Add the encrypted flag
    #[must_use]
    pub fn with_encrypted(mut self) -> Self {
        self.0 |= Self::ENCRYPTED;
        self
    }

    /// Add the should-ack flag
    #[must_use]
    pub fn with_should_ack(mut self) -> Self {
        self.0 |= Self::SHOULD_ACK;
        self
    }

    /// Add the session-host flag
    #[must_use]
    pub fn with_session_host(mut self) -> Self {
        self.0 |= Self::SESSION_HOST;
        self
    }

    /// Encrypted flag set?
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    /// Should-ack flag set?
    #[must_use]
    pub fn should_ack(&self) -> bool {
        self.0 & Self::SHOULD_ACK != 0
    }

    /// Raw flags word
    #[must_use]
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

/// Additional-header type tags recognized by this implementation.
///
/// The table on the wire is ordered and may carry tags outside this set;
/// those are preserved verbatim on re-serialization.
pub mod header_tag {
    /// Table terminator
    pub const END: u8 = 0;
    /// Correlates a reply with the request id it answers (8 bytes LE)
    pub const REPLY_TO_ID: u8 = 1;
    /// Opaque correlation vector
    pub const CORRELATION_VECTOR: u8 = 2;
    /// Watermark id
    pub const WATERMARK_ID: u8 = 3;
    /// Compatibility tag required on StartChannelResponse
    pub const CHANNEL_COMPAT: u8 = 129;
}

/// One entry of the ordered additional-headers table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalHeader {
    /// Type tag (known values in [`header_tag`])
    pub tag: u8,
    /// Raw entry bytes
    pub data: Vec<u8>,
}

impl AdditionalHeader {
    /// Build a ReplyToId entry for the given request id.
    #[must_use]
    pub fn reply_to(request_id: u32) -> Self {
        Self {
            tag: header_tag::REPLY_TO_ID,
            data: u64::from(request_id).to_le_bytes().to_vec(),
        }
    }

    /// The literal compatibility entry every StartChannelResponse carries.
    #[must_use]
    pub fn channel_compat() -> Self {
        Self {
            tag: header_tag::CHANNEL_COMPAT,
            data: vec![0x30, 0x00, 0x00, 0x01],
        }
    }
}

/// Mask for the host-flag bit inside the remote half of a session id.
pub const SESSION_HOST_BIT: u32 = 0x8000_0000;

/// Local half of a packed session id.
#[must_use]
pub fn session_local(session_id: u64) -> u32 {
    (session_id >> 32) as u32
}

/// Remote half of a packed session id, host bit masked off.
#[must_use]
pub fn session_remote(session_id: u64) -> u32 {
    (session_id as u32) & !SESSION_HOST_BIT
}

/// Pack a session id from its halves.
#[must_use]
pub fn pack_session_id(local: u32, remote: u32) -> u64 {
    (u64::from(local) << 32) | u64::from(remote)
}

/// The outer frame header present on every message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonHeader {
    /// Top-level dispatch type
    pub message_type: MessageType,
    /// Flags bitmap
    pub flags: MessageFlags,
    /// Per-session, per-direction monotone counter
    pub sequence_number: u32,
    /// Opaque correlation id echoed in replies
    pub request_id: u32,
    /// Index of this fragment (zero for unfragmented messages)
    pub fragment_index: u16,
    /// Total fragments of the message
    pub fragment_count: u16,
    /// Packed `(local << 32) | remote` session id
    pub session_id: u64,
    /// Target channel (zero outside Session traffic)
    pub channel_id: u64,
    /// Declared body size (ciphertext size when encrypted)
    pub payload_size: u32,
    /// Ordered additional-headers table
    pub additional_headers: Vec<AdditionalHeader>,
}

/// Byte offset of the payload-size field inside a serialized header.
const PAYLOAD_SIZE_OFFSET: usize = 1 + 2 + 4 + 4 + 2 + 2 + 8 + 8;

impl CommonHeader {
    /// Minimal header for the given type.
    #[must_use]
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: MessageFlags::new(),
            sequence_number: 0,
            request_id: 0,
            fragment_index: 0,
            fragment_count: 1,
            session_id: 0,
            channel_id: 0,
            payload_size: 0,
            additional_headers: Vec::new(),
        }
    }

    /// Parse a header from the front of a frame.
    ///
    /// # Errors
    ///
    /// Returns `WireError` on unknown message type, truncation, a fragment
    /// index not below its count, or a malformed additional-headers table.
    pub fn parse(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let type_byte = reader.read_u8()?;
        let message_type = MessageType::try_from(type_byte)?;
        let flags = MessageFlags::from_bits(reader.read_u16()?);
        let sequence_number = reader.read_u32()?;
        let request_id = reader.read_u32()?;
        let fragment_index = reader.read_u16()?;
        let fragment_count = reader.read_u16()?;
        let session_id = reader.read_u64()?;
        let channel_id = reader.read_u64()?;
        let payload_size = reader.read_u32()?;

        if fragment_count == 0 || fragment_index >= fragment_count {
            return Err(WireError::LengthOutOfRange(u64::from(fragment_index)));
        }

        let mut additional_headers = Vec::new();
        loop {
            let tag = reader.read_u8()?;
            if tag == header_tag::END {
                break;
            }
            let len = reader.read_varint()?;
            if len > u64::from(u16::MAX) {
                return Err(WireError::LengthOutOfRange(len));
            }
            let data = reader.read_bytes(len as usize)?.to_vec();
            additional_headers.push(AdditionalHeader { tag, data });
        }

        Ok(Self {
            message_type,
            flags,
            sequence_number,
            request_id,
            fragment_index,
            fragment_count,
            session_id,
            channel_id,
            payload_size,
            additional_headers,
        })
    }

    /// Serialize the header, including the stored payload size.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.write(&mut w);
        w.into_bytes()
    }

    fn write(&self, w: &mut Writer) {
        w.write_u8(self.message_type as u8);
        w.write_u16(self.flags.as_u16());
        w.write_u32(self.sequence_number);
        w.write_u32(self.request_id);
        w.write_u16(self.fragment_index);
        w.write_u16(self.fragment_count);
        w.write_u64(self.session_id);
        w.write_u64(self.channel_id);
        w.write_u32(self.payload_size);
        for header in &self.additional_headers {
            w.write_u8(header.tag);
            w.write_varint(header.data.len() as u64);
            w.write_bytes(&header.data);
        }
        w.write_u8(header_tag::END);
    }

    /// Serialize the header followed by a body produced by `body_fn`,
    /// back-patching the payload-size field with the bytes the body wrote.
    ///
    /// # Errors
    ///
    /// Propagates errors from `body_fn`.
    pub fn write_frame<F>(&self, body_fn: F) -> Result<Vec<u8>, WireError>
    where
        F: FnOnce(&mut Writer) -> Result<(), WireError>,
    {
        debug_assert!(self.fragment_index < self.fragment_count);

        let mut w = Writer::new();
        self.write(&mut w);
        let body_start = w.len();
        body_fn(&mut w)?;
        let body_len = (w.len() - body_start) as u32;
        w.patch_u32(PAYLOAD_SIZE_OFFSET, body_len);
        Ok(w.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> CommonHeader {
        CommonHeader {
            message_type: MessageType::Session,
            flags: MessageFlags::new().with_encrypted().with_should_ack(),
            sequence_number: 42,
            request_id: 7,
            fragment_index: 2,
            fragment_count: 5,
            session_id: pack_session_id(0x0e, 0xabcd),
            channel_id: 1,
            payload_size: 100,
            additional_headers: vec![
                AdditionalHeader::reply_to(7),
                AdditionalHeader {
                    tag: 200,
                    data: vec![1, 2, 3],
                },
            ],
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let bytes = header.serialize();
        let parsed = CommonHeader::parse(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_unknown_tags_preserved_in_order() {
        let header = sample_header();
        let bytes = header.serialize();
        let parsed = CommonHeader::parse(&mut Reader::new(&bytes)).unwrap();

        assert_eq!(parsed.additional_headers.len(), 2);
        assert_eq!(parsed.additional_headers[0].tag, header_tag::REPLY_TO_ID);
        assert_eq!(parsed.additional_headers[1].tag, 200);
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let mut bytes = sample_header().serialize();
        bytes[0] = 0x7f;
        assert_eq!(
            CommonHeader::parse(&mut Reader::new(&bytes)),
            Err(WireError::InvalidTag(0x7f))
        );
    }

    #[test]
    fn test_fragment_index_must_be_below_count() {
        let mut header = sample_header();
        header.fragment_index = 5;
        header.fragment_count = 5;
        let bytes = header.serialize();
        assert!(CommonHeader::parse(&mut Reader::new(&bytes)).is_err());
    }

    #[test]
    fn test_zero_fragment_count_rejected() {
        let mut header = sample_header();
        header.fragment_index = 0;
        header.fragment_count = 0;
        let bytes = header.serialize();
        assert!(CommonHeader::parse(&mut Reader::new(&bytes)).is_err());
    }

    #[test]
    fn test_write_frame_backpatches_payload_size() {
        let mut header = CommonHeader::new(MessageType::Control);
        header.payload_size = 9999; // overwritten by write_frame

        let frame = header
            .write_frame(|w| {
                w.write_bytes(b"hello");
                Ok(())
            })
            .unwrap();

        let mut reader = Reader::new(&frame);
        let parsed = CommonHeader::parse(&mut reader).unwrap();
        assert_eq!(parsed.payload_size, 5);
        assert_eq!(reader.read_to_end(), b"hello");
    }

    #[test]
    fn test_session_id_packing() {
        let id = pack_session_id(0x0e, 0x1234);
        assert_eq!(session_local(id), 0x0e);
        assert_eq!(session_remote(id), 0x1234);
    }

    #[test]
    fn test_session_remote_masks_host_bit() {
        let id = pack_session_id(0, 0x9000_0001);
        assert_eq!(session_remote(id), 0x1000_0001);
    }

    #[test]
    fn test_reply_to_header_bytes() {
        let h = AdditionalHeader::reply_to(0x0102_0304);
        assert_eq!(h.data, vec![0x04, 0x03, 0x02, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn test_channel_compat_literal() {
        let h = AdditionalHeader::channel_compat();
        assert_eq!(h.tag, 129);
        assert_eq!(h.data, vec![0x30, 0x00, 0x00, 0x01]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_headers() -> impl Strategy<Value = Vec<AdditionalHeader>> {
            prop::collection::vec(
                (1u8..=255, prop::collection::vec(any::<u8>(), 0..64))
                    .prop_map(|(tag, data)| AdditionalHeader { tag, data }),
                0..4,
            )
        }

        proptest! {
            #[test]
            fn prop_header_roundtrip(
                type_byte in 0u8..=4,
                flags in any::<u16>(),
                seq in any::<u32>(),
                request_id in any::<u32>(),
                count in 1u16..=16,
                session_id in any::<u64>(),
                channel_id in any::<u64>(),
                payload_size in any::<u32>(),
                extra in arb_headers()
            ) {
                let header = CommonHeader {
                    message_type: MessageType::try_from(type_byte).unwrap(),
                    flags: MessageFlags::from_bits(flags),
                    sequence_number: seq,
                    request_id,
                    fragment_index: count - 1,
                    fragment_count: count,
                    session_id,
                    channel_id,
                    payload_size,
                    additional_headers: extra,
                };

                let bytes = header.serialize();
                let parsed = CommonHeader::parse(&mut Reader::new(&bytes)).unwrap();
                prop_assert_eq!(&parsed, &header);
                prop_assert_eq!(parsed.serialize(), bytes);
            }

            #[test]
            fn prop_parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
                let _ = CommonHeader::parse(&mut Reader::new(&data));
            }
        }
    }
}
