//! Access logging around a wrapped service.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::SystemTime;

use futures_util::future::LocalBoxFuture;

use super::HttpService;
use crate::trx::Transaction;

/// Emits one access-log line per transaction, after the wrapped service has
/// produced its response.
///
/// Line format: `<timestamp> <peer> <method> <path> <status> <bytes>`.
/// The response itself is not consumed or altered.
pub struct AccessLog<W: Write> {
    inner: Rc<dyn HttpService>,
    sink: RefCell<W>,
}

impl<W: Write> AccessLog<W> {
    pub fn new<S: HttpService + 'static>(inner: S, sink: W) -> AccessLog<W> {
        AccessLog {
            inner: Rc::new(inner),
            sink: RefCell::new(sink),
        }
    }

    fn log(&self, tx: &Transaction) {
        let peer = match tx.peer_addr() {
            Some(addr) => addr.to_string(),
            None => "-".to_owned(),
        };
        let status = match tx.response_status() {
            Some(status) => status.as_u16(),
            None => 0,
        };
        let line = format!(
            "[{}] {} {} {} {} {}\n",
            httpdate::fmt_http_date(SystemTime::now()),
            peer,
            tx.method(),
            tx.path(),
            status,
            tx.bytes_sent(),
        );
        if let Err(err) = self.sink.borrow_mut().write_all(line.as_bytes()) {
            tracing::error!("access log write failed: {}", err);
        }
    }
}

impl<W: Write> HttpService for AccessLog<W> {
    fn serve<'a>(&'a self, tx: &'a mut Transaction) -> LocalBoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            let result = self.inner.serve(tx).await;
            self.log(tx);
            result
        })
    }
}

impl<W: Write> std::fmt::Debug for AccessLog<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLog").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber;
    use crate::service::PlainData;
    use crate::support::transaction_for;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn logs_one_line_after_response() {
        fiber::run(async {
            let sink = SharedSink(Arc::new(Mutex::new(Vec::new())));
            let svc = AccessLog::new(PlainData::new(b"Hello".to_vec(), "text/plain"), sink.clone());

            let (_c, mut tx) = transaction_for(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").await;
            svc.serve(&mut tx).await.unwrap();

            let logged = sink.0.lock().unwrap().clone();
            let line = String::from_utf8(logged).unwrap();
            assert!(line.contains(" GET /hello 200 5\n"), "{:?}", line);
            assert!(line.contains("127.0.0.1:"), "{:?}", line);
        });
    }
}
