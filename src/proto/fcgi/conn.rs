//! A client connection to a FastCGI responder.
//!
//! Environment pairs are buffered until the first write or read, then
//! flushed as `Params` records terminated by an empty `Params` record.
//! Stdin data is split at the record payload limit; writing zero bytes
//! signals end-of-stdin.

use std::cell::Cell;
use std::collections::BTreeMap;
#[cfg(unix)]
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use futures_util::future::LocalBoxFuture;

use super::{begin_request_body, encode_pair, FcgiCodec, Record, RecordType, Role, MAX_PAYLOAD};
use crate::stream::Stream;

thread_local! {
    static NEXT_REQUEST_ID: Cell<u16> = Cell::new(1);
}

fn next_request_id() -> u16 {
    NEXT_REQUEST_ID.with(|next| {
        let id = next.get();
        next.set(if id == u16::MAX { 1 } else { id + 1 });
        id
    })
}

/// One in-flight request against an upstream FastCGI responder.
pub struct FcgiConnection {
    strm: Stream,
    codec: FcgiCodec,
    request_id: u16,
    env: BTreeMap<String, String>,
    env_ready: bool,
}

impl FcgiConnection {
    /// Starts a request on `strm`: allocates a request id and sends
    /// `BeginRequest` for the given role, without keep-alive.
    pub async fn open(strm: Stream, role: Role) -> crate::Result<FcgiConnection> {
        let request_id = next_request_id();
        let mut conn = FcgiConnection {
            strm,
            codec: FcgiCodec,
            request_id,
            env: BTreeMap::new(),
            env_ready: false,
        };
        conn.send(RecordType::BeginRequest, begin_request_body(role))
            .await?;
        Ok(conn)
    }

    /// The request id used on the wire.
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Buffers an environment variable. Must happen before the first write
    /// or read flushes the parameter block.
    pub fn set_env<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.env.insert(key.into(), value.into());
    }

    /// Returns a buffered environment variable.
    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Sends stdin data, flushing the environment first if needed.
    ///
    /// Data longer than a record payload is split; an empty `data` sends
    /// the empty `Stdin` record that ends the stream.
    pub async fn write(&mut self, data: &[u8]) -> crate::Result<()> {
        if !self.env_ready {
            self.flush_env().await?;
        }
        if data.is_empty() {
            return self
                .send(RecordType::Stdin, Bytes::new())
                .await;
        }
        for chunk in data.chunks(MAX_PAYLOAD) {
            self.send(RecordType::Stdin, Bytes::copy_from_slice(chunk))
                .await?;
        }
        Ok(())
    }

    /// Reads the next record from the responder, flushing the environment
    /// first if needed. `None` means the upstream closed.
    pub async fn read(&mut self) -> crate::Result<Option<Record>> {
        if !self.env_ready {
            self.flush_env().await?;
        }
        let FcgiConnection { strm, codec, .. } = self;
        strm.read(codec).await
    }

    /// Half-closes the upstream stream.
    pub fn shutdown(&self) -> crate::Result<()> {
        self.strm.shutdown()
    }

    async fn flush_env(&mut self) -> crate::Result<()> {
        let mut block = BytesMut::new();
        for (key, value) in &self.env {
            encode_pair(&mut block, key.as_bytes(), value.as_bytes());
        }
        tracing::trace!(
            request_id = self.request_id,
            "flushing {} env bytes",
            block.len()
        );
        while !block.is_empty() {
            let take = block.len().min(MAX_PAYLOAD);
            let payload = block.split_to(take).freeze();
            self.send(RecordType::Params, payload).await?;
        }
        // empty Params record ends the parameter block
        self.send(RecordType::Params, Bytes::new()).await?;
        self.env_ready = true;
        Ok(())
    }

    async fn send(&mut self, rtype: RecordType, payload: Bytes) -> crate::Result<()> {
        let rec = Record::new(rtype, self.request_id, payload);
        let FcgiConnection { strm, codec, .. } = self;
        strm.write_msg(codec, rec).await
    }
}

impl std::fmt::Debug for FcgiConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FcgiConnection")
            .field("request_id", &self.request_id)
            .field("env_ready", &self.env_ready)
            .finish()
    }
}

/// Hands out connections to a FastCGI responder.
pub trait FcgiProvider {
    /// Opens a fresh responder connection.
    fn get_connection(&self) -> LocalBoxFuture<'_, crate::Result<FcgiConnection>>;
}

/// Connects to a responder listening on TCP, e.g. `127.0.0.1:9000`.
#[derive(Debug)]
pub struct TcpFcgiProvider {
    host: String,
    port: u16,
}

impl TcpFcgiProvider {
    pub fn new<H: Into<String>>(host: H, port: u16) -> TcpFcgiProvider {
        TcpFcgiProvider {
            host: host.into(),
            port,
        }
    }
}

impl FcgiProvider for TcpFcgiProvider {
    fn get_connection(&self) -> LocalBoxFuture<'_, crate::Result<FcgiConnection>> {
        Box::pin(async move {
            let strm = Stream::connect(&self.host, self.port).await?;
            FcgiConnection::open(strm, Role::Responder).await
        })
    }
}

/// Connects to a responder listening on a UNIX socket, the common php-fpm
/// deployment.
#[cfg(unix)]
#[derive(Debug)]
pub struct UnixFcgiProvider {
    path: PathBuf,
}

#[cfg(unix)]
impl UnixFcgiProvider {
    pub fn new<P: Into<PathBuf>>(path: P) -> UnixFcgiProvider {
        UnixFcgiProvider { path: path.into() }
    }
}

#[cfg(unix)]
impl FcgiProvider for UnixFcgiProvider {
    fn get_connection(&self) -> LocalBoxFuture<'_, crate::Result<FcgiConnection>> {
        Box::pin(async move {
            let strm = Stream::connect_unix(&self.path).await?;
            FcgiConnection::open(strm, Role::Responder).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (Stream, Stream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await });
        (
            Stream::from_tcp(client.unwrap()),
            Stream::from_tcp(server.unwrap().0),
        )
    }

    async fn recv(upstream: &Stream, codec: &mut FcgiCodec) -> Record {
        upstream.read(codec).await.unwrap().unwrap()
    }

    #[test]
    fn begin_then_env_then_stdin() {
        fiber::run(async {
            let (client, upstream) = pair().await;
            let mut conn = FcgiConnection::open(client, Role::Responder).await.unwrap();
            conn.set_env("REQUEST_METHOD", "POST");
            conn.set_env("SCRIPT_FILENAME", "/srv/x.php");
            assert_eq!(conn.get_env("REQUEST_METHOD"), Some("POST"));

            conn.write(b"name=value").await.unwrap();
            conn.write(b"").await.unwrap();

            let mut codec = FcgiCodec;
            let begin = recv(&upstream, &mut codec).await;
            assert_eq!(begin.rtype, RecordType::BeginRequest);
            assert_eq!(begin.request_id, conn.request_id());
            assert_eq!(&begin.payload[..2], &[0, 1]);

            let params = recv(&upstream, &mut codec).await;
            assert_eq!(params.rtype, RecordType::Params);
            let pairs = super::super::decode_pairs(&params.payload).unwrap();
            assert_eq!(pairs.len(), 2);
            assert_eq!(&pairs[0].0[..], b"REQUEST_METHOD");

            let end_params = recv(&upstream, &mut codec).await;
            assert_eq!(end_params.rtype, RecordType::Params);
            assert!(end_params.payload.is_empty());

            let stdin = recv(&upstream, &mut codec).await;
            assert_eq!(stdin.rtype, RecordType::Stdin);
            assert_eq!(&stdin.payload[..], b"name=value");

            let end_stdin = recv(&upstream, &mut codec).await;
            assert_eq!(end_stdin.rtype, RecordType::Stdin);
            assert!(end_stdin.payload.is_empty());
        });
    }

    #[test]
    fn first_read_also_flushes_env() {
        fiber::run(async {
            let (client, upstream) = pair().await;
            let mut conn = FcgiConnection::open(client, Role::Responder).await.unwrap();
            conn.set_env("REQUEST_METHOD", "GET");

            let reader = fiber::spawn(async move {
                let rec = conn.read().await?.unwrap();
                assert_eq!(rec.rtype, RecordType::Stdout);
                Ok(())
            });

            let mut codec = FcgiCodec;
            let begin = recv(&upstream, &mut codec).await;
            assert_eq!(begin.rtype, RecordType::BeginRequest);
            let params = recv(&upstream, &mut codec).await;
            assert_eq!(params.rtype, RecordType::Params);
            assert!(!params.payload.is_empty());
            let end_params = recv(&upstream, &mut codec).await;
            assert!(end_params.payload.is_empty());

            upstream
                .write_msg(
                    &mut codec,
                    Record::new(RecordType::Stdout, begin.request_id, Bytes::from_static(b"hi")),
                )
                .await
                .unwrap();
            reader.await;
        });
    }

    #[test]
    fn large_stdin_is_split_at_record_limit() {
        fiber::run(async {
            let (client, upstream) = pair().await;
            let mut conn = FcgiConnection::open(client, Role::Responder).await.unwrap();

            let body = vec![7u8; MAX_PAYLOAD + 1000];
            let writer = fiber::spawn(async move {
                conn.write(&body).await?;
                Ok(())
            });

            let mut codec = FcgiCodec;
            let begin = recv(&upstream, &mut codec).await;
            assert_eq!(begin.rtype, RecordType::BeginRequest);
            // empty env still produces the terminating Params record
            let end_params = recv(&upstream, &mut codec).await;
            assert_eq!(end_params.rtype, RecordType::Params);
            assert!(end_params.payload.is_empty());

            let first = recv(&upstream, &mut codec).await;
            assert_eq!(first.rtype, RecordType::Stdin);
            assert_eq!(first.payload.len(), MAX_PAYLOAD);
            let second = recv(&upstream, &mut codec).await;
            assert_eq!(second.payload.len(), 1000);
            writer.await;
        });
    }

    #[test]
    fn request_ids_skip_zero() {
        let mut seen = 0u32;
        NEXT_REQUEST_ID.with(|next| next.set(u16::MAX));
        while seen < 3 {
            assert_ne!(next_request_id(), 0);
            seen += 1;
        }
    }
}
