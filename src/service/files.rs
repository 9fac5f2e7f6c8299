//! Content services: fixed byte strings and document roots, with FastCGI
//! hand-off for dynamic extensions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use futures_util::future::LocalBoxFuture;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use tokio::io::AsyncReadExt;

use super::HttpService;
use crate::proto::fcgi::{FcgiProvider, RecordType};
use crate::trx::Transaction;

const FILE_CHUNK: usize = 64 * 1024;
const MAX_CGI_HEADER: usize = 64 * 1024;

/// Serves one fixed byte string with a configurable content type.
///
/// Carries an ETag over the body; a matching `If-None-Match` is answered
/// with `304` and no body.
pub struct PlainData {
    data: Bytes,
    ctype: String,
    etag: String,
}

impl PlainData {
    pub fn new<D: Into<Bytes>>(data: D, ctype: &str) -> PlainData {
        let data = data.into();
        let etag = etag_for(&data);
        PlainData {
            data,
            ctype: ctype.to_owned(),
            etag,
        }
    }

    /// Replaces the payload and recomputes the ETag.
    pub fn update_data<D: Into<Bytes>>(&mut self, data: D) {
        self.data = data.into();
        self.etag = etag_for(&self.data);
    }
}

// FNV-1a over the body; cheap and stable across restarts.
fn etag_for(data: &[u8]) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    format!("\"{:016x}\"", hash)
}

impl HttpService for PlainData {
    fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::ETAG,
                HeaderValue::from_str(&self.etag)
                    .map_err(|e| crate::Error::new_http_parse(e.to_string()))?,
            );
            if tx.header("if-none-match") == Some(self.etag.as_str()) {
                return tx
                    .send_response(StatusCode::NOT_MODIFIED, &headers, b"")
                    .await;
            }
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(&self.ctype)
                    .map_err(|e| crate::Error::new_http_parse(e.to_string()))?,
            );
            tx.send_response(StatusCode::OK, &headers, &self.data).await
        })
    }
}

impl std::fmt::Debug for PlainData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainData")
            .field("len", &self.data.len())
            .field("ctype", &self.ctype)
            .finish()
    }
}

/// Serves a document root.
///
/// Directory requests fall back to the configured default documents.
/// Extensions registered with [`register_fcgi`][LocalFiles::register_fcgi]
/// are bridged to a FastCGI responder instead of being read from disk. A
/// path that does not resolve to anything returns without a response so the
/// enclosing chain can continue.
pub struct LocalFiles {
    docroot: PathBuf,
    defdocs: Vec<String>,
    mimetypes: HashMap<String, String>,
    fcgi: HashMap<String, Rc<dyn FcgiProvider>>,
}

impl LocalFiles {
    pub fn new<P: Into<PathBuf>>(docroot: P) -> LocalFiles {
        let mut mimetypes = HashMap::new();
        for (ext, mime) in [
            ("html", "text/html"),
            ("htm", "text/html"),
            ("css", "text/css"),
            ("js", "application/javascript"),
            ("json", "application/json"),
            ("txt", "text/plain"),
            ("xml", "application/xml"),
            ("png", "image/png"),
            ("jpg", "image/jpeg"),
            ("jpeg", "image/jpeg"),
            ("gif", "image/gif"),
            ("svg", "image/svg+xml"),
            ("ico", "image/x-icon"),
            ("webp", "image/webp"),
            ("woff2", "font/woff2"),
            ("wasm", "application/wasm"),
            ("pdf", "application/pdf"),
            ("mp4", "video/mp4"),
            ("zip", "application/zip"),
            ("gz", "application/gzip"),
        ] {
            mimetypes.insert(ext.to_owned(), mime.to_owned());
        }
        LocalFiles {
            docroot: docroot.into(),
            defdocs: Vec::new(),
            mimetypes,
            fcgi: HashMap::new(),
        }
    }

    /// Appends a default document tried for directory requests.
    pub fn add_default_name(&mut self, name: &str) {
        self.defdocs.push(name.to_owned());
    }

    /// Registers or overrides a MIME type for an extension (without dot).
    pub fn register_mime(&mut self, ext: &str, mime: &str) {
        self.mimetypes
            .insert(ext.to_ascii_lowercase(), mime.to_owned());
    }

    /// Routes an extension (without dot) to a FastCGI provider.
    pub fn register_fcgi<P: FcgiProvider + 'static>(&mut self, ext: &str, provider: P) {
        self.fcgi
            .insert(ext.to_ascii_lowercase(), Rc::new(provider));
    }

    async fn serve_inner(&self, tx: &mut Transaction) -> crate::Result<()> {
        let rel = match sanitize(tx.path()) {
            Some(rel) => rel,
            None => return tx.send_status(StatusCode::FORBIDDEN).await,
        };
        let mut full = self.docroot.join(rel);
        let mut meta = match tokio::fs::metadata(&full).await {
            Ok(meta) => meta,
            Err(_) => return Ok(()),
        };
        if meta.is_dir() {
            let mut found = false;
            for name in &self.defdocs {
                let candidate = full.join(name);
                if let Ok(m) = tokio::fs::metadata(&candidate).await {
                    if m.is_file() {
                        full = candidate;
                        meta = m;
                        found = true;
                        break;
                    }
                }
            }
            if !found {
                return Ok(());
            }
        }

        let ext = full
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if let Some(provider) = self.fcgi.get(&ext) {
            return self.bridge_fcgi(tx, provider, &full).await;
        }

        let mtime = meta.modified().ok();
        if let (Some(mtime), Some(since)) = (mtime, tx.header("if-modified-since")) {
            if let Ok(since) = httpdate::parse_http_date(since) {
                if at_second_granularity(mtime) <= at_second_granularity(since) {
                    return tx
                        .send_response(StatusCode::NOT_MODIFIED, &HeaderMap::new(), b"")
                        .await;
                }
            }
        }

        let mime = self
            .mimetypes
            .get(&ext)
            .map(String::as_str)
            .unwrap_or("application/octet-stream");
        let mut file = tokio::fs::File::open(&full).await?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(mime).map_err(|e| crate::Error::new_http_parse(e.to_string()))?,
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.len()));
        if let Some(mtime) = mtime {
            if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(mtime)) {
                headers.insert(header::LAST_MODIFIED, value);
            }
        }
        tx.begin_response(StatusCode::OK, &headers).await?;
        if tx.method() == Method::HEAD {
            return tx.finish_response().await;
        }
        let mut buf = vec![0u8; FILE_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            tx.write_chunk(&buf[..n]).await?;
        }
        tx.finish_response().await
    }

    async fn bridge_fcgi(
        &self,
        tx: &mut Transaction,
        provider: &Rc<dyn FcgiProvider>,
        script: &Path,
    ) -> crate::Result<()> {
        let mut conn = match provider.get_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!("fcgi upstream unavailable: {}", err);
                return tx.send_status(StatusCode::BAD_GATEWAY).await;
            }
        };

        conn.set_env("GATEWAY_INTERFACE", "CGI/1.1");
        conn.set_env(
            "SERVER_PROTOCOL",
            if tx.version() == Version::HTTP_10 {
                "HTTP/1.0"
            } else {
                "HTTP/1.1"
            },
        );
        conn.set_env("REQUEST_METHOD", tx.method().as_str());
        conn.set_env("SCRIPT_FILENAME", script.to_string_lossy().into_owned());
        conn.set_env("QUERY_STRING", tx.query().unwrap_or(""));
        conn.set_env("REQUEST_URI", tx.target());
        conn.set_env("DOCUMENT_ROOT", self.docroot.to_string_lossy().into_owned());
        if let Some(peer) = tx.peer_addr() {
            conn.set_env("REMOTE_ADDR", peer.ip().to_string());
            conn.set_env("REMOTE_PORT", peer.port().to_string());
        }
        if let Some(len) = tx.header("content-length") {
            conn.set_env("CONTENT_LENGTH", len);
        }
        if let Some(ctype) = tx.header("content-type") {
            conn.set_env("CONTENT_TYPE", ctype);
        }
        for (name, value) in tx.headers() {
            if name == &header::CONTENT_LENGTH || name == &header::CONTENT_TYPE {
                continue;
            }
            let key = format!(
                "HTTP_{}",
                name.as_str().to_ascii_uppercase().replace('-', "_")
            );
            conn.set_env(key, String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        while let Some(chunk) = tx.read_body_chunk().await? {
            conn.write(&chunk).await?;
        }
        conn.write(b"").await?;

        match self.relay_fcgi_response(tx, &mut conn).await {
            Ok(()) => Ok(()),
            Err(err) if !tx.response_sent() => {
                tracing::error!("fcgi upstream failed: {}", err);
                tx.send_status(StatusCode::BAD_GATEWAY).await
            }
            Err(err) => Err(err),
        }
    }

    async fn relay_fcgi_response(
        &self,
        tx: &mut Transaction,
        conn: &mut crate::proto::fcgi::FcgiConnection,
    ) -> crate::Result<()> {
        let mut header_buf = BytesMut::new();
        let mut begun = false;
        loop {
            match conn.read().await? {
                None => break,
                Some(rec) if rec.request_id != conn.request_id() => continue,
                Some(rec) => match rec.rtype {
                    RecordType::Stdout => {
                        if rec.payload.is_empty() {
                            continue;
                        }
                        if begun {
                            tx.write_chunk(&rec.payload).await?;
                            continue;
                        }
                        header_buf.extend_from_slice(&rec.payload);
                        if let Some((status, headers, body_at)) = parse_cgi_headers(&header_buf)? {
                            tx.begin_response(status, &headers).await?;
                            begun = true;
                            if body_at < header_buf.len() {
                                tx.write_chunk(&header_buf[body_at..]).await?;
                            }
                            header_buf = BytesMut::new();
                        } else if header_buf.len() > MAX_CGI_HEADER {
                            return Err(crate::Error::new_http_parse(
                                "CGI response headers never completed",
                            ));
                        }
                    }
                    RecordType::Stderr => {
                        tracing::error!(
                            "fcgi stderr: {}",
                            String::from_utf8_lossy(&rec.payload).trim_end()
                        );
                    }
                    RecordType::EndRequest => break,
                    _ => continue,
                },
            }
        }
        if !begun {
            return Err(crate::Error::new_fcgi("upstream ended before response headers"));
        }
        tx.finish_response().await
    }
}

impl HttpService for LocalFiles {
    fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>> {
        Box::pin(self.serve_inner(tx))
    }
}

impl std::fmt::Debug for LocalFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFiles")
            .field("docroot", &self.docroot)
            .finish()
    }
}

// Resolves `/`-separated segments, refusing to climb past the root.
fn sanitize(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if !out.pop() {
                    return None;
                }
            }
            seg => out.push(seg),
        }
    }
    Some(out)
}

fn at_second_granularity(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Parses CGI-style leading headers out of `buf`.
///
/// Returns the response status (from a `Status:` field, default `200`), the
/// remaining headers, and the offset where the body starts, or `None` when
/// the blank line has not arrived yet.
fn parse_cgi_headers(buf: &[u8]) -> crate::Result<Option<(StatusCode, HeaderMap, usize)>> {
    let (head_end, body_at) = match find_subslice(buf, b"\r\n\r\n") {
        Some(pos) => (pos, pos + 4),
        None => match find_subslice(buf, b"\n\n") {
            Some(pos) => (pos, pos + 2),
            None => return Ok(None),
        },
    };
    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();
    for line in buf[..head_end].split(|&b| b == b'\n') {
        let line = match line.strip_suffix(b"\r") {
            Some(l) => l,
            None => line,
        };
        if line.is_empty() {
            continue;
        }
        let colon = match line.iter().position(|&b| b == b':') {
            Some(pos) => pos,
            None => return Err(crate::Error::new_http_parse("malformed CGI header line")),
        };
        let name = &line[..colon];
        let value = trim_ascii(&line[colon + 1..]);
        if name.eq_ignore_ascii_case(b"status") {
            let code = value.get(..3).ok_or_else(|| {
                crate::Error::new_http_parse("malformed CGI Status field")
            })?;
            status = StatusCode::from_bytes(code)
                .map_err(|e| crate::Error::new_http_parse(e.to_string()))?;
        } else {
            let name = HeaderName::from_bytes(name)
                .map_err(|e| crate::Error::new_http_parse(e.to_string()))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|e| crate::Error::new_http_parse(e.to_string()))?;
            headers.append(name, value);
        }
    }
    Ok(Some((status, headers, body_at)))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn trim_ascii(mut s: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}
