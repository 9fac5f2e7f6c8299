//! The composable request pipeline.
//!
//! Every node implements [`HttpService`]. A node may send a complete
//! response (terminal), mutate the transaction and return without sending
//! (letting the next node in the enclosing chain proceed), or reject with a
//! status. The chain stops at the first node that sent a response.

mod files;
mod guard;
mod logger;
mod proxy;
mod route;

pub use self::files::{LocalFiles, PlainData};
pub use self::guard::{BasicAuth, TlsFilter};
pub use self::logger::AccessLog;
pub use self::proxy::{ConnectProxy, ProxyPass};
pub use self::route::{HostDispatch, RegexRoute};

use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use http::StatusCode;

use crate::trx::Transaction;

/// A node in the HTTP pipeline.
pub trait HttpService {
    /// Serves, mutates or ignores the transaction.
    fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>>;
}

impl<S: HttpService + ?Sized> HttpService for Rc<S> {
    fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>> {
        (**self).serve(tx)
    }
}

/// An ordered sequence of services, tried in turn.
///
/// Iteration short-circuits once a service has sent a response. A service
/// error is answered with `500` (when nothing was sent yet), logged, and
/// ends the chain.
#[derive(Default)]
pub struct ServiceChain {
    svcs: Vec<Rc<dyn HttpService>>,
}

impl ServiceChain {
    pub fn new() -> ServiceChain {
        ServiceChain { svcs: Vec::new() }
    }

    /// Builder-style construction.
    pub fn build<F: FnOnce(&mut ServiceChain)>(f: F) -> Rc<ServiceChain> {
        let mut chain = ServiceChain::new();
        f(&mut chain);
        Rc::new(chain)
    }

    /// Appends a service to the end of the chain.
    pub fn append<S: HttpService + 'static>(&mut self, svc: S) {
        self.svcs.push(Rc::new(svc));
    }

    /// Appends a service guarded by a path regex.
    pub fn route<S: HttpService + 'static>(
        &mut self,
        pattern: &str,
        svc: S,
    ) -> crate::Result<()> {
        self.append(RegexRoute::new(pattern, svc)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.svcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.svcs.is_empty()
    }
}

impl HttpService for ServiceChain {
    fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            for svc in &self.svcs {
                if let Err(err) = svc.serve(tx).await {
                    tracing::error!("service error: {}", err);
                    if !tx.response_sent() {
                        tx.send_status(StatusCode::INTERNAL_SERVER_ERROR).await?;
                    }
                    return Ok(());
                }
                if tx.response_sent() {
                    return Ok(());
                }
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for ServiceChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceChain")
            .field("len", &self.svcs.len())
            .finish()
    }
}

/// Adapts a boxed-future handler into a service.
///
/// ```no_run
/// use futures_util::future::LocalBoxFuture;
/// use strand::service::service_fn;
/// use strand::Transaction;
///
/// fn hello(tx: &mut Transaction) -> LocalBoxFuture<'_, strand::Result<()>> {
///     Box::pin(async move { tx.send_status(strand::StatusCode::NO_CONTENT).await })
/// }
///
/// let svc = service_fn(hello);
/// ```
pub fn service_fn<F>(f: F) -> ServiceFn<F>
where
    F: for<'a> Fn(&'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>>,
{
    ServiceFn { f }
}

/// See [`service_fn`].
pub struct ServiceFn<F> {
    f: F,
}

impl<F> HttpService for ServiceFn<F>
where
    F: for<'a> Fn(&'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>>,
{
    fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>> {
        (self.f)(tx)
    }
}

impl<F> std::fmt::Debug for ServiceFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceFn").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber;
    use crate::support::transaction_for;
    use std::cell::RefCell;

    struct Marker {
        name: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
        respond: bool,
    }

    impl HttpService for Marker {
        fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>> {
            Box::pin(async move {
                self.log.borrow_mut().push(self.name);
                if self.respond {
                    tx.send_status(StatusCode::OK).await?;
                }
                Ok(())
            })
        }
    }

    #[test]
    fn chain_short_circuits_after_response() {
        fiber::run(async {
            let log = Rc::new(RefCell::new(Vec::new()));
            let chain = ServiceChain::build(|chain| {
                for (name, respond) in [("a", false), ("b", true), ("c", false)] {
                    chain.append(Marker {
                        name,
                        log: log.clone(),
                        respond,
                    });
                }
            });
            let (_c, mut tx) = transaction_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
            chain.serve(&mut tx).await.unwrap();
            assert_eq!(*log.borrow(), vec!["a", "b"]);
        });
    }

    #[test]
    fn chain_responds_500_on_service_error() {
        fiber::run(async {
            let log = Rc::new(RefCell::new(Vec::new()));
            fn failing(_tx: &mut Transaction) -> LocalBoxFuture<'_, crate::Result<()>> {
                Box::pin(async { Err(crate::Error::new_incomplete()) })
            }
            let chain = ServiceChain::build(|chain| {
                chain.append(service_fn(failing));
                chain.append(Marker {
                    name: "after",
                    log: log.clone(),
                    respond: false,
                });
            });
            let (_c, mut tx) = transaction_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
            chain.serve(&mut tx).await.unwrap();
            assert_eq!(
                tx.response_status(),
                Some(StatusCode::INTERNAL_SERVER_ERROR)
            );
            assert!(log.borrow().is_empty());
        });
    }

    #[test]
    fn empty_chain_leaves_transaction_untouched() {
        fiber::run(async {
            let chain = ServiceChain::new();
            let (_c, mut tx) = transaction_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
            chain.serve(&mut tx).await.unwrap();
            assert!(!tx.response_sent());
        });
    }
}
