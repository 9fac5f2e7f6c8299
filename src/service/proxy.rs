//! Upstream forwarding: round-robin reverse proxying and CONNECT tunnels.

use std::cell::Cell;

use bytes::BytesMut;
use futures_util::future::LocalBoxFuture;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};

use super::HttpService;
use crate::proto::h1;
use crate::stream::Stream;
use crate::trx::Transaction;

/// Forwards requests to one of a set of upstream endpoints, round-robin.
///
/// An unreachable endpoint is skipped; after every endpoint has refused,
/// the client receives `502`. The exchange is fully piped in both
/// directions, so the connection closes when the upstream does.
pub struct ProxyPass {
    endpoints: Vec<(String, u16)>,
    cur: Cell<usize>,
}

impl ProxyPass {
    pub fn new() -> ProxyPass {
        ProxyPass {
            endpoints: Vec::new(),
            cur: Cell::new(0),
        }
    }

    pub fn with_endpoint(host: &str, port: u16) -> ProxyPass {
        let mut this = ProxyPass::new();
        this.append(host, port);
        this
    }

    /// Appends an upstream endpoint to the rotation.
    pub fn append(&mut self, host: &str, port: u16) {
        self.endpoints.push((host.to_owned(), port));
    }

    pub fn count(&self) -> usize {
        self.endpoints.len()
    }

    async fn forward(&self, tx: &mut Transaction, upstream: Stream) -> crate::Result<()> {
        let mut headers = tx.headers().clone();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        if let Some(peer) = tx.peer_addr() {
            let forwarded = match tx.header("x-forwarded-for") {
                Some(prev) => format!("{}, {}", prev, peer.ip()),
                None => peer.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert("x-forwarded-for", value);
            }
        }
        let mut head = BytesMut::with_capacity(256);
        h1::encode_request_head(&mut head, tx.method(), tx.target(), &headers);
        upstream.write(&head).await?;
        tx.forward_to(&upstream).await
    }
}

impl Default for ProxyPass {
    fn default() -> Self {
        ProxyPass::new()
    }
}

impl HttpService for ProxyPass {
    fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            if self.endpoints.is_empty() {
                return Ok(());
            }
            let n = self.endpoints.len();
            let mut last_err = None;
            for _ in 0..n {
                let idx = self.cur.get() % n;
                self.cur.set((idx + 1) % n);
                let (host, port) = &self.endpoints[idx];
                match Stream::connect(host, *port).await {
                    Ok(upstream) => return self.forward(tx, upstream).await,
                    Err(err) => {
                        tracing::debug!("upstream {}:{} unreachable: {}", host, port, err);
                        last_err = Some(err);
                    }
                }
            }
            if let Some(err) = last_err {
                tracing::error!("no upstream reachable: {}", err);
            }
            tx.send_status(StatusCode::BAD_GATEWAY).await
        })
    }
}

impl std::fmt::Debug for ProxyPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPass")
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

/// Handles the `CONNECT` method: opens a TCP stream to the target, answers
/// `200 Connection Established`, and tunnels both directions until either
/// side closes.
///
/// Non-CONNECT requests pass through to the next node.
#[derive(Debug, Default)]
pub struct ConnectProxy;

impl ConnectProxy {
    pub fn new() -> ConnectProxy {
        ConnectProxy
    }
}

impl HttpService for ConnectProxy {
    fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            if tx.method() != Method::CONNECT {
                return Ok(());
            }
            let target = tx.target().to_owned();
            let (host, port) = match parse_authority(&target) {
                Some(pair) => pair,
                None => return tx.send_status(StatusCode::BAD_REQUEST).await,
            };
            let upstream = match Stream::connect(host, port).await {
                Ok(upstream) => upstream,
                Err(err) => {
                    tracing::debug!("CONNECT {} failed: {}", target, err);
                    return tx.send_status(StatusCode::BAD_GATEWAY).await;
                }
            };
            tx.stream()
                .write(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            tx.mark_response_sent(StatusCode::OK);
            tx.forward_to(&upstream).await
        })
    }
}

// Splits `host:port` authority form, tolerating a bracketed IPv6 host.
fn parse_authority(target: &str) -> Option<(&str, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}
