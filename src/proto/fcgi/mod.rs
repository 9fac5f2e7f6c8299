//! The FastCGI record protocol, per the FastCGI 1.0 specification.
//!
//! Records are framed by an 8-byte header:
//!
//! ```text
//!  0        1        2        3        4        5        6        7
//!  version  type     reqId_hi reqId_lo cLen_hi  cLen_lo  padLen   reserved
//! ```
//!
//! followed by `content_length` payload bytes and `padding_length` bytes of
//! padding. The decoder discards padding; the encoder emits none (padding is
//! permitted, not required).

pub(crate) mod conn;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub use self::conn::{FcgiConnection, FcgiProvider, TcpFcgiProvider};
#[cfg(unix)]
pub use self::conn::UnixFcgiProvider;

const VERSION_1: u8 = 1;
const HEADER_LEN: usize = 8;

/// Largest payload a single record can carry.
pub const MAX_PAYLOAD: usize = 65_535;

/// The record types of FastCGI 1.0 used by a responder client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
}

impl RecordType {
    fn from_u8(v: u8) -> Option<RecordType> {
        Some(match v {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            _ => return None,
        })
    }
}

/// The application role requested in `BeginRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

/// One FastCGI record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub rtype: RecordType,
    pub request_id: u16,
    pub payload: Bytes,
}

impl Record {
    pub fn new(rtype: RecordType, request_id: u16, payload: Bytes) -> Record {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Record {
            rtype,
            request_id,
            payload,
        }
    }

    /// Interprets the payload as an `EndRequest` body.
    pub fn end_request(&self) -> Option<EndRequest> {
        if self.rtype != RecordType::EndRequest || self.payload.len() < 8 {
            return None;
        }
        let mut p = &self.payload[..];
        Some(EndRequest {
            app_status: p.get_u32(),
            protocol_status: p.get_u8(),
        })
    }
}

/// The body of an `EndRequest` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: u8,
}

/// `protocol_status` for a normally completed request.
pub const REQUEST_COMPLETE: u8 = 0;

pub(crate) fn begin_request_body(role: Role) -> Bytes {
    let mut body = BytesMut::with_capacity(8);
    body.put_u16(role as u16);
    body.put_u8(0); // flags: no keep-alive requested
    body.put_bytes(0, 5);
    body.freeze()
}

/// Framing codec for [`Record`]s.
#[derive(Debug, Default)]
pub struct FcgiCodec;

impl Decoder for FcgiCodec {
    type Item = Record;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> crate::Result<Option<Record>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src[0] != VERSION_1 {
            return Err(crate::Error::new_fcgi_parse("unsupported FastCGI version"));
        }
        let rtype = RecordType::from_u8(src[1])
            .ok_or_else(|| crate::Error::new_fcgi_parse("unknown record type"))?;
        let request_id = u16::from_be_bytes([src[2], src[3]]);
        let content_len = u16::from_be_bytes([src[4], src[5]]) as usize;
        let padding_len = src[6] as usize;
        if src.len() < HEADER_LEN + content_len + padding_len {
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(content_len).freeze();
        src.advance(padding_len);
        Ok(Some(Record {
            rtype,
            request_id,
            payload,
        }))
    }
}

impl Encoder<Record> for FcgiCodec {
    type Error = crate::Error;

    fn encode(&mut self, rec: Record, dst: &mut BytesMut) -> crate::Result<()> {
        if rec.payload.len() > MAX_PAYLOAD {
            return Err(crate::Error::new_fcgi_parse("record payload too large"));
        }
        dst.reserve(HEADER_LEN + rec.payload.len());
        dst.put_u8(VERSION_1);
        dst.put_u8(rec.rtype as u8);
        dst.put_u16(rec.request_id);
        dst.put_u16(rec.payload.len() as u16);
        dst.put_u8(0); // padding length
        dst.put_u8(0); // reserved
        dst.extend_from_slice(&rec.payload);
        Ok(())
    }
}

/// Appends one name/value pair in FastCGI encoding: each length is one byte
/// when below 128, otherwise four big-endian bytes with the top bit set.
pub fn encode_pair(dst: &mut BytesMut, name: &[u8], value: &[u8]) {
    put_len(dst, name.len());
    put_len(dst, value.len());
    dst.extend_from_slice(name);
    dst.extend_from_slice(value);
}

fn put_len(dst: &mut BytesMut, len: usize) {
    if len < 128 {
        dst.put_u8(len as u8);
    } else {
        dst.put_u32(len as u32 | 0x8000_0000);
    }
}

/// Decodes a complete name/value block, as found in `Params` payloads.
pub fn decode_pairs(mut buf: &[u8]) -> crate::Result<Vec<(Bytes, Bytes)>> {
    let mut pairs = Vec::new();
    while !buf.is_empty() {
        let name_len = read_len(&mut buf)?;
        let value_len = read_len(&mut buf)?;
        if buf.len() < name_len + value_len {
            return Err(crate::Error::new_fcgi_parse("truncated name/value pair"));
        }
        let name = Bytes::copy_from_slice(&buf[..name_len]);
        let value = Bytes::copy_from_slice(&buf[name_len..name_len + value_len]);
        buf = &buf[name_len + value_len..];
        pairs.push((name, value));
    }
    Ok(pairs)
}

fn read_len(buf: &mut &[u8]) -> crate::Result<usize> {
    if buf.is_empty() {
        return Err(crate::Error::new_fcgi_parse("truncated length"));
    }
    if buf[0] & 0x80 == 0 {
        let len = buf[0] as usize;
        *buf = &buf[1..];
        Ok(len)
    } else {
        if buf.len() < 4 {
            return Err(crate::Error::new_fcgi_parse("truncated length"));
        }
        let len = u32::from_be_bytes([buf[0] & 0x7f, buf[1], buf[2], buf[3]]) as usize;
        *buf = &buf[4..];
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(rec: Record) -> Record {
        let mut buf = BytesMut::new();
        FcgiCodec.encode(rec, &mut buf).unwrap();
        FcgiCodec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn record_roundtrip() {
        for (rtype, id, payload) in [
            (RecordType::BeginRequest, 1u16, Bytes::from_static(b"")),
            (RecordType::Stdin, 7, Bytes::from_static(b"name=value")),
            (RecordType::Stdout, 0xbeef, Bytes::from(vec![0x5a; MAX_PAYLOAD])),
        ] {
            let rec = Record::new(rtype, id, payload.clone());
            let back = roundtrip(rec);
            assert_eq!(back.rtype, rtype);
            assert_eq!(back.request_id, id);
            assert_eq!(back.payload, payload);
        }
    }

    #[test]
    fn decoder_waits_for_full_record() {
        let mut buf = BytesMut::new();
        FcgiCodec
            .encode(
                Record::new(RecordType::Stdout, 1, Bytes::from_static(b"hello")),
                &mut buf,
            )
            .unwrap();
        let mut partial = BytesMut::new();
        for &b in buf.iter() {
            assert!(FcgiCodec.decode(&mut partial).unwrap().is_none());
            partial.put_u8(b);
        }
        let rec = FcgiCodec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(&rec.payload[..], b"hello");
        assert!(partial.is_empty());
    }

    #[test]
    fn decoder_discards_padding() {
        let mut buf = BytesMut::new();
        buf.put_u8(VERSION_1);
        buf.put_u8(RecordType::Stdout as u8);
        buf.put_u16(9);
        buf.put_u16(2);
        buf.put_u8(6); // padding
        buf.put_u8(0);
        buf.extend_from_slice(b"ok");
        buf.put_bytes(0xff, 6);
        let rec = FcgiCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&rec.payload[..], b"ok");
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_rejects_bad_version() {
        let mut buf = BytesMut::from(&[9u8, 1, 0, 1, 0, 0, 0, 0][..]);
        assert!(FcgiCodec.decode(&mut buf).unwrap_err().is_parse());
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let rec = Record {
            rtype: RecordType::Stdin,
            request_id: 1,
            payload: Bytes::from(vec![0; MAX_PAYLOAD + 1]),
        };
        assert!(FcgiCodec.encode(rec, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn begin_request_body_layout() {
        let body = begin_request_body(Role::Responder);
        assert_eq!(&body[..], &[0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn end_request_body_parses() {
        let mut payload = BytesMut::new();
        payload.put_u32(77);
        payload.put_u8(REQUEST_COMPLETE);
        payload.put_bytes(0, 3);
        let rec = Record::new(RecordType::EndRequest, 1, payload.freeze());
        let end = rec.end_request().unwrap();
        assert_eq!(end.app_status, 77);
        assert_eq!(end.protocol_status, REQUEST_COMPLETE);
    }

    #[test]
    fn pair_roundtrip() {
        let mut buf = BytesMut::new();
        let long_name = vec![b'n'; 300];
        let long_value = vec![b'v'; 70_000];
        encode_pair(&mut buf, b"SCRIPT_FILENAME", b"/srv/www/x.php");
        encode_pair(&mut buf, b"QUERY_STRING", b"");
        encode_pair(&mut buf, &long_name, &long_value);
        let pairs = decode_pairs(&buf).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(&pairs[0].0[..], b"SCRIPT_FILENAME");
        assert_eq!(&pairs[0].1[..], b"/srv/www/x.php");
        assert_eq!(&pairs[1].1[..], b"");
        assert_eq!(pairs[2].0.len(), 300);
        assert_eq!(pairs[2].1.len(), 70_000);
    }

    #[test]
    fn short_length_prefix_is_single_byte() {
        let mut buf = BytesMut::new();
        encode_pair(&mut buf, b"A", b"B");
        assert_eq!(&buf[..], &[1, 1, b'A', b'B']);
    }
}
