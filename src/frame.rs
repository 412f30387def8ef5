use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::ConnectionError;
use crate::safe_converter::PrecheckedCast;

/// The top 8 bits of every length word carry this version; peers disagreeing on it
///  cannot talk to each other at all, so a mismatch is a fatal protocol error.
pub const HANDSHAKE_VERSION: u8 = 7;

pub const MSG_HEADER_BYTES: usize = 7;

/// Maximum payload length expressible in the 24 bits left of the length word.
pub const MAX_MSG_SIZE: u32 = 0x00ff_ffff;

/// Set on the type byte when the sender expects an inline reply on the same socket.
pub const DIRECT_ACK_BIT: u8 = 0x20;

/// Reserved message id for handshake frames and single-shot reply frames.
pub const NO_MSG_ID: u16 = 0;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MsgType {
    /// a complete logical message in a single frame
    Normal = 0x4c,
    /// a piece of a multi-frame logical message
    Chunk = 0x4d,
    /// the last piece - triggers assembly and dispatch
    EndChunk = 0x4e,
}

pub fn is_valid_msg_type(raw: u8) -> bool {
    MsgType::try_from(raw).is_ok()
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MsgHeader {
    pub msg_type: MsgType,
    pub direct_ack: bool,
    pub msg_id: u16,
    pub payload_len: u32,
}

impl MsgHeader {
    pub const SERIALIZED_LEN: usize = MSG_HEADER_BYTES;

    pub fn ser(&self, buf: &mut impl BufMut) {
        assert!(self.payload_len <= MAX_MSG_SIZE,
                "message exceeded max size of {}", MAX_MSG_SIZE);

        buf.put_u32((HANDSHAKE_VERSION as u32) << 24 | self.payload_len);
        let mut type_byte: u8 = self.msg_type.into();
        if self.direct_ack {
            type_byte |= DIRECT_ACK_BIT;
        }
        buf.put_u8(type_byte);
        buf.put_u16(self.msg_id);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<MsgHeader, ConnectionError> {
        let length_word = buf.try_get_u32()
            .map_err(|_| ConnectionError::Protocol("incomplete message header".to_string()))?;

        let version = (length_word >> 24) as u8;
        if version != HANDSHAKE_VERSION {
            return Err(ConnectionError::Protocol(format!(
                "detected wrong handshake version: expected {} but found {}", HANDSHAKE_VERSION, version)));
        }
        let payload_len = length_word & MAX_MSG_SIZE;

        let raw_type = buf.try_get_u8()
            .map_err(|_| ConnectionError::Protocol("incomplete message header".to_string()))?;
        // the ack bit is transport decoration, not part of the type
        let direct_ack = raw_type & DIRECT_ACK_BIT != 0;
        let msg_type = MsgType::try_from(raw_type & !DIRECT_ACK_BIT)
            .map_err(|_| ConnectionError::Protocol(format!("unknown p2p message type: {:#04x}", raw_type)))?;

        let msg_id = buf.try_get_u16()
            .map_err(|_| ConnectionError::Protocol("incomplete message header".to_string()))?;

        Ok(MsgHeader {
            msg_type,
            direct_ack,
            msg_id,
            payload_len,
        })
    }
}

/// Frame a payload into a freshly allocated buffer, ready for the wire.
pub fn prepare_message(msg_type: MsgType, direct_ack: bool, msg_id: u16, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MSG_HEADER_BYTES + payload.len());
    MsgHeader {
        msg_type,
        direct_ack,
        msg_id,
        payload_len: payload.len().prechecked_cast(),
    }
        .ser(&mut buf);
    buf.put_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::normal(MsgType::Normal, false, 0, 0)]
    #[case::normal_with_payload(MsgType::Normal, false, 17, 1000)]
    #[case::chunk(MsgType::Chunk, false, 42, 9999)]
    #[case::end_chunk(MsgType::EndChunk, false, 42, 500)]
    #[case::direct_ack(MsgType::Normal, true, 3, 12)]
    #[case::max_len(MsgType::Normal, false, u16::MAX, MAX_MSG_SIZE)]
    fn test_ser_deser(#[case] msg_type: MsgType, #[case] direct_ack: bool, #[case] msg_id: u16, #[case] payload_len: u32) {
        let original = MsgHeader { msg_type, direct_ack, msg_id, payload_len };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), MSG_HEADER_BYTES);

        let mut b: &[u8] = &buf;
        let deser = MsgHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    #[should_panic]
    fn test_ser_rejects_oversize() {
        let header = MsgHeader {
            msg_type: MsgType::Normal,
            direct_ack: false,
            msg_id: 0,
            payload_len: MAX_MSG_SIZE + 1,
        };
        header.ser(&mut BytesMut::new());
    }

    #[test]
    fn test_deser_rejects_wrong_version() {
        let mut buf = BytesMut::new();
        buf.put_u32((6u32) << 24 | 100);
        buf.put_u8(MsgType::Normal.into());
        buf.put_u16(0);

        let mut b: &[u8] = &buf;
        let err = MsgHeader::deser(&mut b).unwrap_err();
        assert!(err.to_string().contains("wrong handshake version"));
    }

    #[test]
    fn test_valid_msg_types_are_exactly_the_three_wire_types() {
        for raw in 0..=u8::MAX {
            let expected = raw == 0x4c || raw == 0x4d || raw == 0x4e;
            assert_eq!(is_valid_msg_type(raw), expected, "type byte {:#04x}", raw);
        }
    }

    #[test]
    fn test_direct_ack_bit_is_cleared_before_type_validation() {
        let mut buf = BytesMut::new();
        buf.put_u32((HANDSHAKE_VERSION as u32) << 24 | 4);
        buf.put_u8(0x4c | DIRECT_ACK_BIT);
        buf.put_u16(9);

        let mut b: &[u8] = &buf;
        let header = MsgHeader::deser(&mut b).unwrap();
        assert_eq!(header.msg_type, MsgType::Normal);
        assert!(header.direct_ack);
    }

    #[rstest]
    #[case::zero(0x00)]
    #[case::below(0x4b)]
    #[case::above(0x4f)]
    #[case::ack_bit_only(DIRECT_ACK_BIT)]
    fn test_deser_rejects_unknown_type(#[case] raw_type: u8) {
        let mut buf = BytesMut::new();
        buf.put_u32((HANDSHAKE_VERSION as u32) << 24);
        buf.put_u8(raw_type);
        buf.put_u16(0);

        let mut b: &[u8] = &buf;
        assert!(MsgHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_prepare_message_round_trip() {
        let framed = prepare_message(MsgType::Normal, true, 7, b"hello");

        let mut b: &[u8] = &framed;
        let header = MsgHeader::deser(&mut b).unwrap();
        assert_eq!(header.payload_len, 5);
        assert_eq!(header.msg_id, 7);
        assert!(header.direct_ack);
        assert_eq!(b, b"hello");
    }
}
