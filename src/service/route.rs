//! Dispatch nodes: path-regex routing and virtual-host dispatch.

use std::collections::HashMap;
use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use http::StatusCode;
use regex::Regex;

use super::HttpService;
use crate::trx::Transaction;

/// Delegates to the wrapped service when the request path matches.
///
/// A non-match is not an error; the request falls through to the next node
/// in the enclosing chain.
pub struct RegexRoute {
    pattern: Regex,
    svc: Rc<dyn HttpService>,
}

impl RegexRoute {
    pub fn new<S: HttpService + 'static>(pattern: &str, svc: S) -> crate::Result<RegexRoute> {
        let pattern = Regex::new(pattern)
            .map_err(|e| crate::Error::new_http_parse(e.to_string()))?;
        Ok(RegexRoute {
            pattern,
            svc: Rc::new(svc),
        })
    }

    pub fn from_regex<S: HttpService + 'static>(pattern: Regex, svc: S) -> RegexRoute {
        RegexRoute {
            pattern,
            svc: Rc::new(svc),
        }
    }
}

impl HttpService for RegexRoute {
    fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            if self.pattern.is_match(tx.path()) {
                self.svc.serve(tx).await
            } else {
                Ok(())
            }
        })
    }
}

impl std::fmt::Debug for RegexRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegexRoute")
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

/// Looks up the normalized `Host` header in a map of named services.
///
/// Falls back to the default service when the host is unknown or missing;
/// without a default, responds `404`.
#[derive(Default)]
pub struct HostDispatch {
    svcmap: HashMap<String, Rc<dyn HttpService>>,
    default: Option<Rc<dyn HttpService>>,
}

impl HostDispatch {
    pub fn new() -> HostDispatch {
        HostDispatch::default()
    }

    pub fn register_host<S: HttpService + 'static>(&mut self, hostname: &str, svc: S) {
        self.svcmap
            .insert(normalize_hostname(hostname), Rc::new(svc));
    }

    pub fn register_host_shared(&mut self, hostname: &str, svc: Rc<dyn HttpService>) {
        self.svcmap.insert(normalize_hostname(hostname), svc);
    }

    pub fn unregister_host(&mut self, hostname: &str) {
        self.svcmap.remove(&normalize_hostname(hostname));
    }

    pub fn set_default<S: HttpService + 'static>(&mut self, svc: S) {
        self.default = Some(Rc::new(svc));
    }

    fn lookup(&self, tx: &Transaction) -> Option<&Rc<dyn HttpService>> {
        let host = tx.host().map(normalize_hostname);
        match host.and_then(|h| self.svcmap.get(&h)) {
            Some(svc) => Some(svc),
            None => self.default.as_ref(),
        }
    }
}

impl HttpService for HostDispatch {
    fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            match self.lookup(tx) {
                Some(svc) => svc.serve(tx).await,
                None => tx.send_status(StatusCode::NOT_FOUND).await,
            }
        })
    }
}

impl std::fmt::Debug for HostDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDispatch")
            .field("hosts", &self.svcmap.keys().collect::<Vec<_>>())
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

/// Lowercases the hostname, strips a `:port` suffix and a trailing dot.
pub fn normalize_hostname(hostname: &str) -> String {
    let mut host = hostname.trim().to_ascii_lowercase();
    if host.ends_with('.') {
        host.pop();
    }
    if let Some(pos) = host.rfind(':') {
        if host[pos + 1..].bytes().all(|b| b.is_ascii_digit()) {
            host.truncate(pos);
        }
    }
    host
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber;
    use crate::service::{service_fn, PlainData};
    use crate::support::transaction_for;

    #[test]
    fn hostname_normalization() {
        assert_eq!(normalize_hostname("Example.COM:8080."), "example.com");
        assert_eq!(normalize_hostname("a.test"), "a.test");
        assert_eq!(normalize_hostname("A.TEST:80"), "a.test");
        assert_eq!(normalize_hostname("a.test."), "a.test");
        assert_eq!(normalize_hostname("[::1]:8080"), "[::1]");
        assert_eq!(normalize_hostname("[::1]"), "[::1]");
    }

    #[test]
    fn regex_route_matches_path_only() {
        fiber::run(async {
            let route =
                RegexRoute::new("^/api/", PlainData::new(b"api".to_vec(), "text/plain")).unwrap();

            let (_c, mut tx) =
                transaction_for(b"GET /api/things?x=/other HTTP/1.1\r\nHost: x\r\n\r\n").await;
            route.serve(&mut tx).await.unwrap();
            assert!(tx.response_sent());

            let (_c, mut tx) = transaction_for(b"GET /web/ HTTP/1.1\r\nHost: x\r\n\r\n").await;
            route.serve(&mut tx).await.unwrap();
            assert!(!tx.response_sent());
        });
    }

    #[test]
    fn regex_route_rejects_bad_pattern() {
        assert!(RegexRoute::new("(", PlainData::new(b"x".to_vec(), "text/plain")).is_err());
    }

    #[test]
    fn host_dispatch_routes_and_falls_back() {
        fiber::run(async {
            let mut hosts = HostDispatch::new();
            hosts.register_host("a.test", PlainData::new(b"X".to_vec(), "text/plain"));
            hosts.set_default(PlainData::new(b"Y".to_vec(), "text/plain"));

            for (host, body) in [
                (&b"Host: a.test\r\n"[..], "X"),
                (b"Host: A.TEST:80\r\n", "X"),
                (b"Host: b.test\r\n", "Y"),
            ] {
                let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
                raw.extend_from_slice(host);
                raw.extend_from_slice(b"\r\n");
                let (_c, mut tx) = transaction_for(&raw).await;
                hosts.serve(&mut tx).await.unwrap();
                assert_eq!(tx.response_status(), Some(StatusCode::OK));
                assert_eq!(tx.bytes_sent(), body.len() as u64);
            }
        });
    }

    fn no_content(tx: &mut Transaction) -> LocalBoxFuture<'_, crate::Result<()>> {
        Box::pin(async move { tx.send_status(StatusCode::NO_CONTENT).await })
    }

    #[test]
    fn host_dispatch_without_default_is_404() {
        fiber::run(async {
            let mut hosts = HostDispatch::new();
            hosts.register_host("a.test", service_fn(no_content));
            let (_c, mut tx) = transaction_for(b"GET / HTTP/1.1\r\nHost: b.test\r\n\r\n").await;
            hosts.serve(&mut tx).await.unwrap();
            assert_eq!(tx.response_status(), Some(StatusCode::NOT_FOUND));
        });
    }
}
