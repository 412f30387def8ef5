use bytes::{Buf, BufMut};

use crate::error::ConnectionError;
use crate::frame::HANDSHAKE_VERSION;
use crate::member::MemberId;

pub const REPLY_CODE_OK: u8 = 69;
pub const REPLY_CODE_OK_WITH_ASYNC_INFO: u8 = 70;

/// First frame on every new connection, sent by the initiator. Everything the acceptor
///  needs to classify the socket travels here: who is dialing, which socket family the
///  connection belongs to, and the domino count of the dialing task.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeRequest {
    pub member: MemberId,
    pub shared_resource: bool,
    pub preserve_order: bool,
    pub unique_id: u64,
    pub version_ordinal: u16,
    pub domino_count: u32,
}

impl HandshakeRequest {
    pub fn ser(&self, buf: &mut impl BufMut) {
        // A zero lead byte distinguishes this protocol from ancestors that started the
        //  handshake with a serialized network address - no valid address begins with 0.
        buf.put_u8(0);
        buf.put_u8(HANDSHAKE_VERSION);
        self.member.ser(buf);
        buf.put_u8(self.shared_resource as u8);
        buf.put_u8(self.preserve_order as u8);
        buf.put_u64(self.unique_id);
        buf.put_u16(self.version_ordinal);
        buf.put_u32(self.domino_count);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<HandshakeRequest, ConnectionError> {
        let reserved = buf.try_get_u8()
            .map_err(|_| truncated())?;
        if reserved != 0 {
            return Err(ConnectionError::Protocol(format!(
                "detected an older, incompatible peer during handshake (initial byte was {})", reserved)));
        }

        let version = buf.try_get_u8()
            .map_err(|_| truncated())?;
        if version != HANDSHAKE_VERSION {
            return Err(ConnectionError::Protocol(format!(
                "detected wrong handshake version: expected {} but found {}", HANDSHAKE_VERSION, version)));
        }

        let member = MemberId::try_deser(buf)
            .map_err(|e| ConnectionError::Protocol(format!("malformed member id in handshake: {}", e)))?;
        let shared_resource = buf.try_get_u8().map_err(|_| truncated())? != 0;
        let preserve_order = buf.try_get_u8().map_err(|_| truncated())? != 0;
        let unique_id = buf.try_get_u64().map_err(|_| truncated())?;
        let version_ordinal = buf.try_get_u16().map_err(|_| truncated())?;
        let domino_count = buf.try_get_u32().map_err(|_| truncated())?;

        Ok(HandshakeRequest {
            member,
            shared_resource,
            preserve_order,
            unique_id,
            version_ordinal,
            domino_count,
        })
    }
}

/// The acceptor's answer. Current acceptors always send the async-info shape so the
///  initiator can adopt the receiver's queueing parameters; the bare OK code remains
///  decodable because it is still valid on the wire.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandshakeReply {
    Ok,
    OkWithAsyncInfo {
        async_distribution_timeout_ms: u32,
        async_queue_timeout_ms: u32,
        async_max_queue_size_mib: u32,
        version_ordinal: u16,
    },
}

impl HandshakeReply {
    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            HandshakeReply::Ok => {
                buf.put_u8(REPLY_CODE_OK);
            }
            HandshakeReply::OkWithAsyncInfo {
                async_distribution_timeout_ms,
                async_queue_timeout_ms,
                async_max_queue_size_mib,
                version_ordinal,
            } => {
                buf.put_u8(REPLY_CODE_OK_WITH_ASYNC_INFO);
                buf.put_u32(*async_distribution_timeout_ms);
                buf.put_u32(*async_queue_timeout_ms);
                buf.put_u32(*async_max_queue_size_mib);
                buf.put_u16(*version_ordinal);
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<HandshakeReply, ConnectionError> {
        let code = buf.try_get_u8().map_err(|_| truncated())?;
        match code {
            REPLY_CODE_OK => Ok(HandshakeReply::Ok),
            REPLY_CODE_OK_WITH_ASYNC_INFO => Ok(HandshakeReply::OkWithAsyncInfo {
                async_distribution_timeout_ms: buf.try_get_u32().map_err(|_| truncated())?,
                async_queue_timeout_ms: buf.try_get_u32().map_err(|_| truncated())?,
                async_max_queue_size_mib: buf.try_get_u32().map_err(|_| truncated())?,
                version_ordinal: buf.try_get_u16().map_err(|_| truncated())?,
            }),
            _ => Err(ConnectionError::Protocol(format!("unknown handshake reply code: {}", code))),
        }
    }
}

fn truncated() -> ConnectionError {
    ConnectionError::Protocol("truncated handshake frame".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn request(shared: bool, ordered: bool, domino: u32) -> HandshakeRequest {
        HandshakeRequest {
            member: MemberId::localhost(77),
            shared_resource: shared,
            preserve_order: ordered,
            unique_id: 0xdead_beef_cafe,
            version_ordinal: 3,
            domino_count: domino,
        }
    }

    #[rstest]
    #[case::shared_ordered(request(true, true, 0))]
    #[case::shared_unordered(request(true, false, 0))]
    #[case::thread_owned(request(false, true, 2))]
    fn test_request_ser_deser(#[case] original: HandshakeRequest) {
        let mut buf = BytesMut::new();
        original.ser(&mut buf);

        let mut b: &[u8] = &buf;
        let deser = HandshakeRequest::try_deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_request_rejects_nonzero_lead_byte() {
        let mut buf = BytesMut::new();
        request(true, true, 0).ser(&mut buf);
        buf[0] = 192;

        let mut b: &[u8] = &buf;
        let err = HandshakeRequest::try_deser(&mut b).unwrap_err();
        assert!(err.to_string().contains("older, incompatible peer"));
    }

    #[test]
    fn test_request_rejects_wrong_version() {
        let mut buf = BytesMut::new();
        request(true, true, 0).ser(&mut buf);
        buf[1] = HANDSHAKE_VERSION - 1;

        let mut b: &[u8] = &buf;
        let err = HandshakeRequest::try_deser(&mut b).unwrap_err();
        assert!(err.to_string().contains("wrong handshake version"));
    }

    #[rstest]
    #[case::ok(HandshakeReply::Ok)]
    #[case::with_async_info(HandshakeReply::OkWithAsyncInfo {
        async_distribution_timeout_ms: 20,
        async_queue_timeout_ms: 60_000,
        async_max_queue_size_mib: 1,
        version_ordinal: 3,
    })]
    fn test_reply_ser_deser(#[case] original: HandshakeReply) {
        let mut buf = BytesMut::new();
        original.ser(&mut buf);

        let mut b: &[u8] = &buf;
        let deser = HandshakeReply::try_deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_reply_rejects_unknown_code() {
        let mut b: &[u8] = &[71];
        assert!(HandshakeReply::try_deser(&mut b).is_err());
    }
}
