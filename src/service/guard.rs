//! Gatekeeper nodes: TLS enforcement and HTTP basic authentication.

use futures_util::future::LocalBoxFuture;
use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;

use super::HttpService;
use crate::trx::Transaction;

/// Rejects requests that did not arrive over TLS.
///
/// The response status is configurable; `403` is the usual choice.
#[derive(Debug)]
pub struct TlsFilter {
    status: StatusCode,
}

impl TlsFilter {
    pub fn new(status: StatusCode) -> TlsFilter {
        TlsFilter { status }
    }
}

impl HttpService for TlsFilter {
    fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            if tx.stream().has_tls() {
                Ok(())
            } else {
                tx.send_status(self.status).await
            }
        })
    }
}

/// HTTP basic authentication against a caller-supplied predicate.
///
/// A request without valid credentials receives `401` with a
/// `WWW-Authenticate` challenge carrying the realm. On success the request
/// passes through to the next node.
pub struct BasicAuth {
    realm: String,
    authf: Box<dyn Fn(&str, &str) -> bool>,
}

impl BasicAuth {
    pub fn new<F>(realm: &str, authf: F) -> BasicAuth
    where
        F: Fn(&str, &str) -> bool + 'static,
    {
        BasicAuth {
            realm: realm.to_owned(),
            authf: Box::new(authf),
        }
    }

    fn credentials(&self, tx: &Transaction) -> Option<(String, String)> {
        let value = tx.header("authorization")?;
        let b64 = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
        let decoded = base64::decode(b64.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_owned(), pass.to_owned()))
    }

    async fn challenge(&self, tx: &mut Transaction) -> crate::Result<()> {
        let mut headers = HeaderMap::new();
        let challenge = format!("Basic realm=\"{}\"", self.realm);
        headers.insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_str(&challenge)
                .map_err(|e| crate::Error::new_http_parse(e.to_string()))?,
        );
        tx.send_response(StatusCode::UNAUTHORIZED, &headers, b"401 Unauthorized\r\n")
            .await
    }
}

impl HttpService for BasicAuth {
    fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            match self.credentials(tx) {
                Some((user, pass)) if (self.authf)(&user, &pass) => Ok(()),
                _ => self.challenge(tx).await,
            }
        })
    }
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("realm", &self.realm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber;
    use crate::support::transaction_for;

    #[test]
    fn tls_filter_rejects_plain_streams() {
        fiber::run(async {
            let filter = TlsFilter::new(StatusCode::FORBIDDEN);
            let (_c, mut tx) = transaction_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
            filter.serve(&mut tx).await.unwrap();
            assert_eq!(tx.response_status(), Some(StatusCode::FORBIDDEN));
        });
    }

    #[test]
    fn tls_filter_passes_tls_streams() {
        fiber::run(async {
            let filter = TlsFilter::new(StatusCode::FORBIDDEN);
            let (_c, mut tx) = transaction_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
            tx.stream().mark_tls();
            filter.serve(&mut tx).await.unwrap();
            assert!(!tx.response_sent());
        });
    }

    #[test]
    fn basic_auth_challenges_and_admits() {
        fiber::run(async {
            let auth = BasicAuth::new("R", |user, pass| user == "u" && pass == "p");

            let (_c, mut tx) = transaction_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
            auth.serve(&mut tx).await.unwrap();
            assert_eq!(tx.response_status(), Some(StatusCode::UNAUTHORIZED));

            // "dTpw" is base64 for "u:p"
            let (_c, mut tx) = transaction_for(
                b"GET / HTTP/1.1\r\nHost: x\r\nAuthorization: Basic dTpw\r\n\r\n",
            )
            .await;
            auth.serve(&mut tx).await.unwrap();
            assert!(!tx.response_sent());

            // wrong password
            let (_c, mut tx) = transaction_for(
                b"GET / HTTP/1.1\r\nHost: x\r\nAuthorization: Basic dTp4\r\n\r\n",
            )
            .await;
            auth.serve(&mut tx).await.unwrap();
            assert_eq!(tx.response_status(), Some(StatusCode::UNAUTHORIZED));

            // not base64 at all
            let (_c, mut tx) = transaction_for(
                b"GET / HTTP/1.1\r\nHost: x\r\nAuthorization: Basic !!!\r\n\r\n",
            )
            .await;
            auth.serve(&mut tx).await.unwrap();
            assert_eq!(tx.response_status(), Some(StatusCode::UNAUTHORIZED));
        });
    }
}
