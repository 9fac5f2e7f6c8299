//! HTTP/1 framing: request-head decoding, message-body decoding and
//! response-head encoding.
//!
//! The head decoder is a thin layer over `httparse`; body decoders implement
//! RFC 7230 §3.3.3 framing for requests (`Content-Length` or
//! `Transfer-Encoding: chunked`).

use std::cmp;
use std::time::SystemTime;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use tokio_util::codec::Decoder;

use super::DEFAULT_MAX_BUFFER_SIZE;

const MAX_HEADERS: usize = 100;

/// A parsed request line plus headers, before any body bytes.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Decodes one request head from the stream buffer.
pub(crate) struct HeadDecoder;

impl Decoder for HeadDecoder {
    type Item = RequestHead;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> crate::Result<Option<RequestHead>> {
        if src.is_empty() {
            return Ok(None);
        }
        let (len, head) = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut req = httparse::Request::new(&mut headers);
            let len = match req.parse(src).map_err(crate::Error::new_http_parse)? {
                httparse::Status::Complete(len) => len,
                httparse::Status::Partial => {
                    if src.len() > DEFAULT_MAX_BUFFER_SIZE {
                        return Err(crate::Error::new_too_large());
                    }
                    return Ok(None);
                }
            };
            tracing::trace!("parsed request head, {} headers", req.headers.len());

            let method = req
                .method
                .expect("method is set on Complete")
                .parse::<Method>()
                .map_err(crate::Error::new_http_parse)?;
            let target = req.path.expect("path is set on Complete").to_owned();
            let version = if req.version.expect("version is set on Complete") == 1 {
                Version::HTTP_11
            } else {
                Version::HTTP_10
            };
            let mut map = HeaderMap::with_capacity(req.headers.len());
            for h in req.headers.iter() {
                let name = HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(crate::Error::new_http_parse)?;
                let value =
                    HeaderValue::from_bytes(h.value).map_err(crate::Error::new_http_parse)?;
                map.append(name, value);
            }
            (
                len,
                RequestHead {
                    method,
                    target,
                    version,
                    headers: map,
                },
            )
        };
        src.advance(len);
        Ok(Some(head))
    }
}

/// How the bytes after a request head are framed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
}

/// Determines request-body framing per RFC 7230 §3.3.3.
///
/// A request with a `Transfer-Encoding` whose final coding is not `chunked`
/// is malformed, as is a `Content-Length` that is repeated with conflicting
/// values or is not a number.
pub(crate) fn body_kind(head: &RequestHead) -> crate::Result<BodyKind> {
    if let Some(te) = head.headers.get(header::TRANSFER_ENCODING) {
        if head.version == Version::HTTP_10 {
            return Err(crate::Error::new_http_parse(
                "transfer-encoding in HTTP/1.0 request",
            ));
        }
        let te = te
            .to_str()
            .map_err(|_| crate::Error::new_http_parse("invalid transfer-encoding"))?;
        if te.split(',').map(str::trim).last() == Some("chunked") {
            Ok(BodyKind::Chunked)
        } else {
            Err(crate::Error::new_http_parse(
                "transfer-encoding without final chunked",
            ))
        }
    } else {
        let mut values = head.headers.get_all(header::CONTENT_LENGTH).iter();
        match values.next() {
            None => Ok(BodyKind::Empty),
            Some(first) => {
                if values.any(|other| other != first) {
                    return Err(crate::Error::new_http_parse(
                        "conflicting content-length headers",
                    ));
                }
                let n = first
                    .to_str()
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .ok_or_else(|| crate::Error::new_http_parse("invalid content-length"))?;
                if n == 0 {
                    Ok(BodyKind::Empty)
                } else {
                    Ok(BodyKind::Length(n))
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Size,
    Data,
    DataCrlf,
    Trailer,
    Done,
}

enum Kind {
    Empty,
    Length(u64),
    Chunked(ChunkedState, u64),
}

/// Decodes message-body bytes according to a [`BodyKind`].
///
/// Emits data chunks as they arrive; [`BodyDecoder::is_eof`] reports when
/// the body is complete and the decoder must not be driven further.
pub(crate) struct BodyDecoder {
    kind: Kind,
}

impl BodyDecoder {
    pub(crate) fn new(kind: BodyKind) -> BodyDecoder {
        let kind = match kind {
            BodyKind::Empty => Kind::Empty,
            BodyKind::Length(n) => Kind::Length(n),
            BodyKind::Chunked => Kind::Chunked(ChunkedState::Size, 0),
        };
        BodyDecoder { kind }
    }

    pub(crate) fn is_eof(&self) -> bool {
        match &self.kind {
            Kind::Empty => true,
            Kind::Length(rem) => *rem == 0,
            Kind::Chunked(state, _) => *state == ChunkedState::Done,
        }
    }
}

impl Decoder for BodyDecoder {
    type Item = Bytes;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> crate::Result<Option<Bytes>> {
        match &mut self.kind {
            Kind::Empty => Ok(None),
            Kind::Length(rem) => {
                if *rem == 0 || src.is_empty() {
                    return Ok(None);
                }
                let take = cmp::min(src.len() as u64, *rem) as usize;
                *rem -= take as u64;
                Ok(Some(src.split_to(take).freeze()))
            }
            Kind::Chunked(state, rem) => decode_chunked(state, rem, src),
        }
    }
}

fn decode_chunked(
    state: &mut ChunkedState,
    rem: &mut u64,
    src: &mut BytesMut,
) -> crate::Result<Option<Bytes>> {
    loop {
        match *state {
            ChunkedState::Size => {
                let line = match find_crlf(src) {
                    Some(pos) => src.split_to(pos + 2),
                    None => {
                        if src.len() > 18 {
                            return Err(crate::Error::new_http_parse("chunk size line too long"));
                        }
                        return Ok(None);
                    }
                };
                let digits = &line[..line.len() - 2];
                let digits = match digits.iter().position(|&b| b == b';') {
                    Some(pos) => &digits[..pos],
                    None => digits,
                };
                let size = std::str::from_utf8(digits)
                    .ok()
                    .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
                    .ok_or_else(|| crate::Error::new_http_parse("invalid chunk size"))?;
                *rem = size;
                *state = if size == 0 {
                    ChunkedState::Trailer
                } else {
                    ChunkedState::Data
                };
            }
            ChunkedState::Data => {
                if src.is_empty() {
                    return Ok(None);
                }
                let take = cmp::min(src.len() as u64, *rem) as usize;
                *rem -= take as u64;
                if *rem == 0 {
                    *state = ChunkedState::DataCrlf;
                }
                return Ok(Some(src.split_to(take).freeze()));
            }
            ChunkedState::DataCrlf => {
                if src.len() < 2 {
                    return Ok(None);
                }
                if &src[..2] != b"\r\n" {
                    return Err(crate::Error::new_http_parse("missing CRLF after chunk"));
                }
                src.advance(2);
                *state = ChunkedState::Size;
            }
            ChunkedState::Trailer => {
                match find_crlf(src) {
                    None => return Ok(None),
                    Some(0) => {
                        src.advance(2);
                        *state = ChunkedState::Done;
                        // an empty chunk marks the end, so a framed read
                        // completes instead of waiting for more input
                        return Ok(Some(Bytes::new()));
                    }
                    // a trailer field, ignored
                    Some(pos) => {
                        src.advance(pos + 2);
                    }
                }
            }
            ChunkedState::Done => return Ok(None),
        }
    }
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|w| w == b"\r\n")
}

/// Appends a response status line and headers, terminated by the blank line.
pub(crate) fn encode_head(dst: &mut BytesMut, status: StatusCode, headers: &HeaderMap) {
    extend_status_line(dst, status);
    extend_headers(dst, headers);
    dst.extend_from_slice(b"\r\n");
}

pub(crate) fn extend_status_line(dst: &mut BytesMut, status: StatusCode) {
    dst.extend_from_slice(b"HTTP/1.1 ");
    dst.extend_from_slice(status.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    dst.extend_from_slice(b"\r\n");
}

/// Appends a request line and headers, for forwarding to an upstream.
pub(crate) fn encode_request_head(
    dst: &mut BytesMut,
    method: &Method,
    target: &str,
    headers: &HeaderMap,
) {
    dst.extend_from_slice(method.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(target.as_bytes());
    dst.extend_from_slice(b" HTTP/1.1\r\n");
    extend_headers(dst, headers);
    dst.extend_from_slice(b"\r\n");
}

pub(crate) fn extend_headers(dst: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
}

/// Appends a `Date` header with the current time.
pub(crate) fn extend_date(dst: &mut BytesMut) {
    dst.extend_from_slice(b"date: ");
    dst.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
    dst.extend_from_slice(b"\r\n");
}

/// Appends one chunk of a `chunked` transfer coding.
pub(crate) fn encode_chunk(dst: &mut BytesMut, data: &[u8]) {
    dst.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

/// Appends the last-chunk marker.
pub(crate) fn encode_last_chunk(dst: &mut BytesMut) {
    dst.extend_from_slice(b"0\r\n\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> crate::Result<Option<RequestHead>> {
        let mut buf = BytesMut::from(input);
        HeadDecoder.decode(&mut buf)
    }

    #[test]
    fn parses_request_head() {
        let head = parse(b"GET /hello?x=1 HTTP/1.1\r\nHost: a.test\r\nX-Two: b\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/hello?x=1");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.get("host").unwrap(), "a.test");
        assert_eq!(head.headers.get("x-two").unwrap(), "b");
    }

    #[test]
    fn partial_head_remains() {
        assert!(parse(b"GET / HTTP/1.1\r\nHost:").unwrap().is_none());
    }

    #[test]
    fn leftover_bytes_stay_in_buffer() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n\r\nleftover"[..]);
        let head = HeadDecoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(&buf[..], b"leftover");
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(parse(b"\x00\x01GET\r\n\r\n").unwrap_err().is_parse());
    }

    #[test]
    fn body_kind_from_headers() {
        let head = parse(b"POST / HTTP/1.1\r\nContent-Length: 12\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(body_kind(&head).unwrap(), BodyKind::Length(12));

        let head = parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(body_kind(&head).unwrap(), BodyKind::Chunked);

        let head = parse(b"GET / HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!(body_kind(&head).unwrap(), BodyKind::Empty);

        let head = parse(b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(body_kind(&head).unwrap_err().is_parse());

        let head = parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(body_kind(&head).unwrap_err().is_parse());
    }

    #[test]
    fn length_body_decodes_in_pieces() {
        let mut dec = BodyDecoder::new(BodyKind::Length(10));
        let mut buf = BytesMut::from(&b"hello"[..]);
        assert_eq!(&dec.decode(&mut buf).unwrap().unwrap()[..], b"hello");
        assert!(!dec.is_eof());
        let mut buf = BytesMut::from(&b"worldEXTRA"[..]);
        assert_eq!(&dec.decode(&mut buf).unwrap().unwrap()[..], b"world");
        assert!(dec.is_eof());
        assert_eq!(&buf[..], b"EXTRA");
    }

    #[test]
    fn chunked_body_decodes_across_fragments() {
        let mut dec = BodyDecoder::new(BodyKind::Chunked);
        let mut collected = Vec::new();
        let mut buf = BytesMut::new();
        for fragment in [
            &b"5\r\nhel"[..],
            &b"lo\r\n6;ext=1\r\n world\r\n"[..],
            &b"0\r\nX-Trail: v\r\n\r\nNEXT"[..],
        ] {
            buf.extend_from_slice(fragment);
            while let Some(chunk) = dec.decode(&mut buf).unwrap() {
                collected.extend_from_slice(&chunk);
            }
        }
        assert!(dec.is_eof());
        assert_eq!(&collected[..], b"hello world");
        assert_eq!(&buf[..], b"NEXT");
    }

    #[test]
    fn chunked_rejects_bad_size() {
        let mut dec = BodyDecoder::new(BodyKind::Chunked);
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(dec.decode(&mut buf).unwrap_err().is_parse());
    }

    #[test]
    fn encodes_response_head() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let mut dst = BytesMut::new();
        encode_head(&mut dst, StatusCode::NOT_FOUND, &headers);
        assert_eq!(
            &dst[..],
            &b"HTTP/1.1 404 Not Found\r\ncontent-type: text/plain\r\n\r\n"[..]
        );
    }

    #[test]
    fn encodes_chunks() {
        let mut dst = BytesMut::new();
        encode_chunk(&mut dst, b"hello world");
        encode_last_chunk(&mut dst);
        assert_eq!(&dst[..], &b"b\r\nhello world\r\n0\r\n\r\n"[..]);
    }
}
