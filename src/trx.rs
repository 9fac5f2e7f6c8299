//! The HTTP transaction threaded through the service pipeline.
//!
//! A [`Transaction`] pairs one parsed request with the client stream it
//! arrived on and the helpers for writing the response. Services inspect
//! and mutate it; the first service to send a response ends the pipeline.

use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap};
use http::{Method, StatusCode, Version};

use crate::proto::h1::{self, BodyDecoder, RequestHead};
use crate::stream::Stream;

const SERVER_TOKEN: &str = concat!("strand/", env!("CARGO_PKG_VERSION"));

enum ResponseState {
    None,
    /// Head written; body follows as raw bytes of a known length.
    Counting,
    /// Head written; body follows as `chunked` transfer coding.
    Chunked,
    Done,
}

/// One request/response exchange on a client stream.
pub struct Transaction {
    strm: Rc<Stream>,
    head: RequestHead,
    body: BodyDecoder,
    response: ResponseState,
    status: Option<StatusCode>,
    bytes_sent: u64,
    keep_alive: bool,
}

impl Transaction {
    pub(crate) fn new(strm: Rc<Stream>, head: RequestHead) -> crate::Result<Transaction> {
        let kind = h1::body_kind(&head)?;
        let keep_alive = allows_keep_alive(&head);
        Ok(Transaction {
            strm,
            head,
            body: BodyDecoder::new(kind),
            response: ResponseState::None,
            status: None,
            bytes_sent: 0,
            keep_alive,
        })
    }

    /// The client stream this transaction arrived on.
    pub fn stream(&self) -> &Rc<Stream> {
        &self.strm
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    /// The full request target, including any query string.
    pub fn target(&self) -> &str {
        &self.head.target
    }

    /// The path portion of the request target.
    pub fn path(&self) -> &str {
        match self.head.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.head.target,
        }
    }

    /// The query string, without the `?`.
    pub fn query(&self) -> Option<&str> {
        self.head.target.split_once('?').map(|(_, q)| q)
    }

    /// Rewrites the path portion, keeping the query string.
    pub fn set_path<P: Into<String>>(&mut self, path: P) {
        let path = path.into();
        self.head.target = match self.head.target.split_once('?') {
            Some((_, q)) => format!("{}?{}", path, q),
            None => path,
        };
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.head.headers
    }

    /// A single header value, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The raw `Host` header.
    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.strm.peer_addr()
    }

    pub fn has_tls(&self) -> bool {
        self.strm.has_tls()
    }

    /// Whether a response (or its head) has been sent.
    pub fn response_sent(&self) -> bool {
        !matches!(self.response, ResponseState::None)
    }

    /// The status of the response sent, when one was sent through the
    /// transaction's own helpers.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Response bytes written so far (body only).
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Whether the connection can carry another request after this one.
    pub(crate) fn keep_alive(&self) -> bool {
        self.keep_alive && self.body.is_eof() && matches!(self.response, ResponseState::Done)
    }

    /// Reads the next request-body chunk; `None` once the body is complete.
    pub async fn read_body_chunk(&mut self) -> crate::Result<Option<Bytes>> {
        if self.body.is_eof() {
            return Ok(None);
        }
        match self.strm.read(&mut self.body).await? {
            None => Err(crate::Error::new_incomplete()),
            Some(chunk) if chunk.is_empty() => Ok(None),
            Some(chunk) => Ok(Some(chunk)),
        }
    }

    /// Collects the whole request body.
    pub async fn read_body(&mut self) -> crate::Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read_body_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    /// The declared request-body length, when the request carried one.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Sends a complete response.
    ///
    /// `Content-Length`, `Date` and `Server` are filled in unless already
    /// present in `headers`. A `HEAD` request gets the head only.
    pub async fn send_response(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) -> crate::Result<()> {
        if self.response_sent() {
            return Err(crate::Error::new_user_response());
        }
        let mut buf = BytesMut::with_capacity(256 + body.len());
        self.extend_response_head(&mut buf, status, headers, Some(body.len() as u64));
        let head_len = buf.len();
        if !body.is_empty() && self.head.method != Method::HEAD {
            buf.extend_from_slice(body);
        }
        self.strm.write(&buf).await?;
        self.response = ResponseState::Done;
        self.status = Some(status);
        self.bytes_sent += (buf.len() - head_len) as u64;
        Ok(())
    }

    /// Sends a minimal plain-text response for `status`.
    pub async fn send_status(&mut self, status: StatusCode) -> crate::Result<()> {
        let reason = status.canonical_reason().unwrap_or("Unknown");
        let body = format!("{} {}\r\n", status.as_str(), reason);
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain"),
        );
        self.send_response(status, &headers, body.as_bytes()).await
    }

    /// Starts a streaming response.
    ///
    /// With a `Content-Length` in `headers` the body is written raw;
    /// otherwise the response uses the `chunked` transfer coding. Follow
    /// with [`write_chunk`][Self::write_chunk] and
    /// [`finish_response`][Self::finish_response].
    pub async fn begin_response(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> crate::Result<()> {
        if self.response_sent() {
            return Err(crate::Error::new_user_response());
        }
        let counted = headers.contains_key(header::CONTENT_LENGTH);
        let mut buf = BytesMut::with_capacity(256);
        if counted {
            self.extend_response_head(&mut buf, status, headers, None);
        } else {
            let mut headers = headers.clone();
            headers.insert(
                header::TRANSFER_ENCODING,
                header::HeaderValue::from_static("chunked"),
            );
            self.extend_response_head(&mut buf, status, &headers, None);
        }
        self.strm.write(&buf).await?;
        self.response = if counted {
            ResponseState::Counting
        } else {
            ResponseState::Chunked
        };
        self.status = Some(status);
        Ok(())
    }

    /// Writes one piece of a streaming response body.
    pub async fn write_chunk(&mut self, data: &[u8]) -> crate::Result<()> {
        match self.response {
            ResponseState::Counting => {
                self.strm.write(data).await?;
            }
            ResponseState::Chunked => {
                if data.is_empty() {
                    return Ok(());
                }
                let mut buf = BytesMut::with_capacity(data.len() + 16);
                h1::encode_chunk(&mut buf, data);
                self.strm.write(&buf).await?;
            }
            _ => return Err(crate::Error::new_user_response()),
        }
        self.bytes_sent += data.len() as u64;
        Ok(())
    }

    /// Completes a streaming response.
    pub async fn finish_response(&mut self) -> crate::Result<()> {
        match self.response {
            ResponseState::Counting => {}
            ResponseState::Chunked => {
                let mut buf = BytesMut::with_capacity(8);
                h1::encode_last_chunk(&mut buf);
                self.strm.write(&buf).await?;
            }
            _ => return Err(crate::Error::new_user_response()),
        }
        self.response = ResponseState::Done;
        Ok(())
    }

    /// Hands the exchange over to `upstream`: everything still unread from
    /// the client flows there, and everything the upstream sends flows back,
    /// until both directions reach EOF. The connection closes afterwards.
    pub async fn forward_to(&mut self, upstream: &Stream) -> crate::Result<()> {
        self.response = ResponseState::Done;
        self.keep_alive = false;
        let client = self.strm.clone();
        let (_, sent) =
            futures_util::future::try_join(client.pipe(upstream), upstream.pipe(&client)).await?;
        self.bytes_sent += sent;
        Ok(())
    }

    /// Marks the response as sent outside the transaction's own helpers
    /// (e.g. a CONNECT tunnel writing to the stream directly).
    pub(crate) fn mark_response_sent(&mut self, status: StatusCode) {
        self.response = ResponseState::Done;
        self.status = Some(status);
        self.keep_alive = false;
    }

    fn extend_response_head(
        &self,
        buf: &mut BytesMut,
        status: StatusCode,
        headers: &HeaderMap,
        content_length: Option<u64>,
    ) {
        h1::extend_status_line(buf, status);
        h1::extend_headers(buf, headers);
        if let Some(len) = content_length {
            if !headers.contains_key(header::CONTENT_LENGTH) {
                let mut itoa = itoa::Buffer::new();
                buf.extend_from_slice(b"content-length: ");
                buf.extend_from_slice(itoa.format(len).as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
        }
        if !headers.contains_key(header::DATE) {
            h1::extend_date(buf);
        }
        if !headers.contains_key(header::SERVER) {
            buf.extend_from_slice(b"server: ");
            buf.extend_from_slice(SERVER_TOKEN.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        if !self.keep_alive && !headers.contains_key(header::CONNECTION) {
            buf.extend_from_slice(b"connection: close\r\n");
        }
        buf.extend_from_slice(b"\r\n");
    }
}

fn allows_keep_alive(head: &RequestHead) -> bool {
    let connection = head
        .headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let mentions = |token: &str| {
        connection
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    if head.version == Version::HTTP_11 {
        !mentions("close")
    } else {
        mentions("keep-alive")
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("method", &self.head.method)
            .field("target", &self.head.target)
            .field("response_sent", &self.response_sent())
            .finish()
    }
}
