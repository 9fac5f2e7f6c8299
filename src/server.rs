//! The TCP accept loop and the per-connection request loop.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use http::StatusCode;

use crate::fiber;
use crate::proto::h1::HeadDecoder;
use crate::service::HttpService;
use crate::stream::Stream;
use crate::trx::Transaction;

/// How long the accept loop pauses after a resource exhaustion error
/// (`EMFILE`/`ENFILE`) before accepting again.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// A listening socket that runs one fiber per accepted connection.
pub struct TcpServer {
    listener: tokio::net::TcpListener,
}

impl TcpServer {
    /// Binds to `addr:port`. Must be called from within the runtime.
    pub fn bind(addr: &str, port: u16) -> crate::Result<TcpServer> {
        let std_listener =
            std::net::TcpListener::bind((addr, port)).map_err(crate::Error::new_listen)?;
        std_listener
            .set_nonblocking(true)
            .map_err(crate::Error::new_listen)?;
        let listener =
            tokio::net::TcpListener::from_std(std_listener).map_err(crate::Error::new_listen)?;
        Ok(TcpServer { listener })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        self.listener.local_addr().map_err(crate::Error::new_listen)
    }

    /// Accepts connections forever, launching `handler` in a fresh fiber for
    /// each. Per-connection errors are contained in their fiber; the accept
    /// loop itself never dies.
    pub async fn serve<H, F>(self, handler: H) -> crate::Result<()>
    where
        H: Fn(Stream) -> F,
        F: std::future::Future<Output = crate::Result<()>> + 'static,
    {
        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => {
                    tracing::trace!("accepted connection from {}", addr);
                    let strm = Stream::from_tcp(socket);
                    if let Err(err) = strm.nodelay(true) {
                        tracing::debug!("nodelay failed for {}: {}", addr, err);
                    }
                    fiber::spawn(handler(strm));
                }
                Err(err) if is_connection_error(&err) => continue,
                Err(err) => {
                    // probably out of file descriptors; back off and retry
                    tracing::error!("{}", crate::Error::new_accept(err));
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Accepts connections forever, speaking HTTP/1.x and dispatching every
    /// request through `root`.
    pub async fn serve_http(self, root: Rc<dyn HttpService>) -> crate::Result<()> {
        self.serve(move |strm| serve_connection(Rc::new(strm), root.clone()))
            .await
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

fn is_connection_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
    )
}

/// Runs the keep-alive request loop on one accepted stream.
///
/// Requests are read and dispatched through `root` until the client closes,
/// an error occurs, or the exchange forbids reuse. A request that no
/// service answers gets `404`; a service error that left the response
/// unsent gets `500`; malformed heads get `400`; a timeout with a partial
/// head gets `408`.
pub async fn serve_connection(
    strm: Rc<Stream>,
    root: Rc<dyn HttpService>,
) -> crate::Result<()> {
    loop {
        let head = match strm.read(&mut HeadDecoder).await {
            Ok(Some(head)) => head,
            // peer closed between requests
            Ok(None) => return Ok(()),
            Err(err) if err.is_timeout() => {
                if strm.buffered_len() > 0 {
                    write_error_response(&strm, StatusCode::REQUEST_TIMEOUT).await?;
                }
                return Ok(());
            }
            Err(err) if err.is_parse() => {
                tracing::debug!("bad request head: {}", err);
                write_error_response(&strm, StatusCode::BAD_REQUEST).await?;
                return Ok(());
            }
            // a reset between requests is the client's prerogative
            Err(err) if err.is_closed() => {
                tracing::debug!("client closed connection: {}", err);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        tracing::debug!("{} {}", head.method, head.target);

        let mut tx = match Transaction::new(strm.clone(), head) {
            Ok(tx) => tx,
            Err(err) => {
                tracing::debug!("unframeable request body: {}", err);
                write_error_response(&strm, StatusCode::BAD_REQUEST).await?;
                return Ok(());
            }
        };
        match root.serve(&mut tx).await {
            Ok(()) => {
                if !tx.response_sent() {
                    tx.send_status(StatusCode::NOT_FOUND).await?;
                }
            }
            Err(err) if err.is_closed() => {
                tracing::debug!("client closed mid-response: {}", err);
                return Ok(());
            }
            Err(err) => {
                tracing::error!("unhandled service error: {}", err);
                if !tx.response_sent() {
                    tx.send_status(StatusCode::INTERNAL_SERVER_ERROR).await?;
                }
                return Err(err);
            }
        }
        if !tx.keep_alive() {
            return Ok(());
        }
    }
}

async fn write_error_response(strm: &Stream, status: StatusCode) -> crate::Result<()> {
    let body = format!(
        "{} {}\r\n",
        status.as_str(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::header::HeaderValue::from_static("text/plain"),
    );
    headers.insert(
        http::header::CONTENT_LENGTH,
        http::header::HeaderValue::from(body.len() as u64),
    );
    headers.insert(
        http::header::CONNECTION,
        http::header::HeaderValue::from_static("close"),
    );
    let mut buf = bytes::BytesMut::with_capacity(128 + body.len());
    crate::proto::h1::encode_head(&mut buf, status, &headers);
    buf.extend_from_slice(body.as_bytes());
    strm.write(&buf).await
}
