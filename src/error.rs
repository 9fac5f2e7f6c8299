//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have strand `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling connections, streams and
/// services.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(super) enum Kind {
    /// An `io::Error` while reading or writing a network stream.
    Io,
    /// A malformed message was received (HTTP or FastCGI).
    Parse(Parse),
    /// Error occurred while connecting to a remote endpoint.
    Connect,
    /// Error creating a listener.
    Listen,
    /// Error accepting a connection.
    Accept,
    /// Error half-closing a stream.
    Shutdown,
    /// The peer closed the connection.
    Closed,
    /// The peer closed the stream in the middle of a message.
    IncompleteMessage,
    /// The FastCGI upstream misbehaved above the record layer.
    Fcgi,
    /// The caller violated a stream or fiber usage rule.
    User(User),
}

#[derive(Debug)]
pub(super) enum Parse {
    /// Malformed HTTP message from the downstream client.
    Http,
    /// Request head grew past the read buffer limit.
    TooLarge,
    /// Malformed FastCGI record from an upstream responder.
    Fcgi,
}

#[derive(Debug)]
pub(super) enum User {
    /// A read was started while another read or a pipe was in progress.
    ReadBusy,
    /// A write or shutdown was issued on a stream serving as a pipe sink.
    PipeSink,
    /// A pipe was started into a sink that already has a source.
    PipeBusy,
    /// A pipe was requested over a TLS stream.
    PipeTls,
    /// A response operation was issued out of order on a transaction.
    Response,
}

// Sentinel type to indicate the error was caused by a read timeout.
#[derive(Debug)]
pub(super) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("read timed out")
    }
}

impl StdError for TimedOut {}

impl Error {
    /// Returns true if this was caused by an I/O error on a stream.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if this was a message parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error was caused by user code misusing the API.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if this error came from connecting to an endpoint.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the peer closed the connection.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    /// Returns true if a message was cut short by the peer closing.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if the error was caused by a read timeout.
    pub fn is_timeout(&self) -> bool {
        self.find_source::<TimedOut>().is_some()
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(super) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(super) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }

        // else
        None
    }

    pub(super) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(super) fn new_timeout() -> Error {
        Error::new(Kind::Io).with(TimedOut)
    }

    pub(super) fn new_connect(cause: std::io::Error) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(super) fn new_listen(cause: std::io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(super) fn new_accept(cause: std::io::Error) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(super) fn new_shutdown(cause: std::io::Error) -> Error {
        Error::new(Kind::Shutdown).with(cause)
    }

    pub(super) fn new_closed(cause: std::io::Error) -> Error {
        Error::new(Kind::Closed).with(cause)
    }

    pub(super) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(super) fn new_fcgi(msg: &'static str) -> Error {
        Error::new(Kind::Fcgi).with(msg)
    }

    pub(super) fn new_http_parse<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Parse(Parse::Http)).with(cause)
    }

    pub(super) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(super) fn new_fcgi_parse(msg: &'static str) -> Error {
        Error::new(Kind::Parse(Parse::Fcgi)).with(msg)
    }

    pub(super) fn new_user_read_busy() -> Error {
        Error::new(Kind::User(User::ReadBusy))
    }

    pub(super) fn new_user_pipe_sink() -> Error {
        Error::new(Kind::User(User::PipeSink))
    }

    pub(super) fn new_user_pipe_busy() -> Error {
        Error::new(Kind::User(User::PipeBusy))
    }

    pub(super) fn new_user_pipe_tls() -> Error {
        Error::new(Kind::User(User::PipeTls))
    }

    pub(super) fn new_user_response() -> Error {
        Error::new(Kind::User(User::Response))
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Io => "stream error",
            Kind::Parse(Parse::Http) => "invalid HTTP message",
            Kind::Parse(Parse::TooLarge) => "message head too large",
            Kind::Parse(Parse::Fcgi) => "invalid FastCGI record",
            Kind::Connect => "error trying to connect",
            Kind::Listen => "error creating listener",
            Kind::Accept => "error accepting connection",
            Kind::Shutdown => "error shutting down stream",
            Kind::Closed => "connection closed by peer",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Fcgi => "FastCGI upstream protocol error",
            Kind::User(User::ReadBusy) => "stream is read-busy",
            Kind::User(User::PipeSink) => "stream is a pipe sink",
            Kind::User(User::PipeBusy) => "sink stream already has a source",
            Kind::User(User::PipeTls) => "cannot pipe a TLS stream",
            Kind::User(User::Response) => "response operation out of order",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("strand::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}
