//! Call and reply headers.
//!
//! The transport only needs the transaction id and the message direction;
//! everything after those two words is an opaque body handed to the
//! dispatcher.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SvcError};

/// Direction word of a call message.
pub const CALL: u32 = 0;

/// Direction word of a reply message.
pub const REPLY: u32 = 1;

const HEADER_LEN: usize = 8;

/// A decoded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMessage {
    pub xid: u32,
    pub body: Bytes,
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyMessage {
    pub xid: u32,
    pub body: Bytes,
}

/// Converts between records and messages.
pub trait MessageCodec: Send + Sync + fmt::Debug {
    fn decode_call(&self, record: Bytes) -> Result<CallMessage>;
    fn encode_reply(&self, reply: &ReplyMessage, dst: &mut BytesMut);
    fn encode_call(&self, call: &CallMessage, dst: &mut BytesMut);
    fn decode_reply(&self, record: Bytes) -> Result<ReplyMessage>;
}

/// `xid:u32be, direction:u32be, body`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderCodec;

impl HeaderCodec {
    fn split(mut record: Bytes, expected: u32) -> Result<(u32, Bytes)> {
        if record.len() < HEADER_LEN {
            return Err(SvcError::Decode(format!(
                "record of {} bytes is shorter than a message header",
                record.len()
            )));
        }
        let xid = record.get_u32();
        let direction = record.get_u32();
        if direction != expected {
            return Err(SvcError::Decode(format!(
                "xid {xid}: expected direction {expected}, got {direction}"
            )));
        }
        Ok((xid, record))
    }

    fn join(xid: u32, direction: u32, body: &[u8], dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32(xid);
        dst.put_u32(direction);
        dst.put_slice(body);
    }
}

impl MessageCodec for HeaderCodec {
    fn decode_call(&self, record: Bytes) -> Result<CallMessage> {
        let (xid, body) = Self::split(record, CALL)?;
        Ok(CallMessage { xid, body })
    }

    fn encode_reply(&self, reply: &ReplyMessage, dst: &mut BytesMut) {
        Self::join(reply.xid, REPLY, &reply.body, dst);
    }

    fn encode_call(&self, call: &CallMessage, dst: &mut BytesMut) {
        Self::join(call.xid, CALL, &call.body, dst);
    }

    fn decode_reply(&self, record: Bytes) -> Result<ReplyMessage> {
        let (xid, body) = Self::split(record, REPLY)?;
        Ok(ReplyMessage { xid, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_header_layout() {
        let mut dst = BytesMut::new();
        HeaderCodec.encode_call(
            &CallMessage {
                xid: 0x0102_0304,
                body: Bytes::from_static(b"args"),
            },
            &mut dst,
        );
        assert_eq!(&dst[..8], &[1, 2, 3, 4, 0, 0, 0, 0]);
        let call = HeaderCodec.decode_call(dst.freeze()).unwrap();
        assert_eq!(call.xid, 0x0102_0304);
        assert_eq!(call.body.as_ref(), b"args");
    }

    #[test]
    fn reply_is_not_a_call() {
        let mut dst = BytesMut::new();
        HeaderCodec.encode_reply(
            &ReplyMessage {
                xid: 7,
                body: Bytes::new(),
            },
            &mut dst,
        );
        assert_eq!(&dst[4..8], &[0, 0, 0, 1]);
        assert!(matches!(
            HeaderCodec.decode_call(dst.clone().freeze()),
            Err(SvcError::Decode(_))
        ));
        assert_eq!(HeaderCodec.decode_reply(dst.freeze()).unwrap().xid, 7);
    }

    #[test]
    fn short_record_is_rejected() {
        assert!(matches!(
            HeaderCodec.decode_call(Bytes::from_static(b"\0\0\0\x01")),
            Err(SvcError::Decode(_))
        ));
    }
}
