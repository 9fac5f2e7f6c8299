//! Buffered, framed streams over TCP and UNIX sockets.
//!
//! A [`Stream`] couples one socket to the fiber that is currently reading
//! it. Reads are *framed*: the caller hands in a [`Decoder`] and suspends
//! until the decoder produces a complete message, the peer closes, or the
//! read timeout fires. Writes and half-closes are plain readiness loops.
//!
//! Streams are shared as `Rc<Stream>` between a transaction and the pipe
//! machinery, so every operation takes `&self`; exclusivity is enforced at
//! runtime through the `reading`/`piped_out`/`piped_in` slots rather than
//! the borrow checker, and violations surface as user errors instead of
//! corrupting an in-flight read.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::Path;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_util::codec::{Decoder, Encoder};

/// The buffer growth step used before each socket read.
pub(crate) const INIT_BUFFER_SIZE: usize = 8192;

/// Default per-read timeout; `set_timeout(None)` disables it.
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

// Peer-initiated closes get their own error kind so callers can tell a
// vanished client from a genuine transport failure.
fn classify_io(err: io::Error) -> crate::Error {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => crate::Error::new_closed(err),
        _ => crate::Error::new_io(err),
    }
}

enum Io {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Io {
    async fn readable(&self) -> io::Result<()> {
        match self {
            Io::Tcp(s) => s.readable().await,
            #[cfg(unix)]
            Io::Unix(s) => s.readable().await,
        }
    }

    fn try_read_buf(&self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Io::Tcp(s) => s.try_read_buf(buf),
            #[cfg(unix)]
            Io::Unix(s) => s.try_read_buf(buf),
        }
    }

    async fn writable(&self) -> io::Result<()> {
        match self {
            Io::Tcp(s) => s.writable().await,
            #[cfg(unix)]
            Io::Unix(s) => s.writable().await,
        }
    }

    fn try_write(&self, data: &[u8]) -> io::Result<usize> {
        match self {
            Io::Tcp(s) => s.try_write(data),
            #[cfg(unix)]
            Io::Unix(s) => s.try_write(data),
        }
    }

    fn shutdown_write(&self) -> io::Result<()> {
        let how = std::net::Shutdown::Write;
        match self {
            Io::Tcp(s) => socket2::SockRef::from(s).shutdown(how),
            #[cfg(unix)]
            Io::Unix(s) => socket2::SockRef::from(s).shutdown(how),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Io::Tcp(s) => s.peer_addr().ok(),
            #[cfg(unix)]
            Io::Unix(_) => None,
        }
    }
}

/// A buffered stream bound to the single-threaded runtime.
pub struct Stream {
    io: Io,
    rbuf: RefCell<BytesMut>,
    timeout: Cell<Option<Duration>>,
    reading: Cell<bool>,
    piped_out: Cell<bool>,
    piped_in: Cell<bool>,
    tls: Cell<bool>,
}

// Clears the reading slot on every exit path of a framed read.
struct ReadGuard<'a>(&'a Cell<bool>);

impl<'a> ReadGuard<'a> {
    fn new(slot: &'a Cell<bool>) -> Self {
        slot.set(true);
        ReadGuard(slot)
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

// Severs both pipe links on any terminal event, including cancellation.
struct PipeGuard<'a> {
    src: &'a Stream,
    sink: &'a Stream,
}

impl<'a> PipeGuard<'a> {
    fn new(src: &'a Stream, sink: &'a Stream) -> Self {
        src.piped_out.set(true);
        sink.piped_in.set(true);
        PipeGuard { src, sink }
    }
}

impl Drop for PipeGuard<'_> {
    fn drop(&mut self) {
        self.src.piped_out.set(false);
        self.sink.piped_in.set(false);
    }
}

impl Stream {
    fn new(io: Io) -> Stream {
        Stream {
            io,
            rbuf: RefCell::new(BytesMut::new()),
            timeout: Cell::new(Some(DEFAULT_READ_TIMEOUT)),
            reading: Cell::new(false),
            piped_out: Cell::new(false),
            piped_in: Cell::new(false),
            tls: Cell::new(false),
        }
    }

    pub(crate) fn from_tcp(io: TcpStream) -> Stream {
        Stream::new(Io::Tcp(io))
    }

    /// Opens a TCP connection to `host:port`.
    pub async fn connect(host: &str, port: u16) -> crate::Result<Stream> {
        let io = TcpStream::connect((host, port))
            .await
            .map_err(crate::Error::new_connect)?;
        Ok(Stream::new(Io::Tcp(io)))
    }

    /// Opens a TCP connection to a resolved address.
    pub async fn connect_addr(addr: SocketAddr) -> crate::Result<Stream> {
        let io = TcpStream::connect(addr)
            .await
            .map_err(crate::Error::new_connect)?;
        Ok(Stream::new(Io::Tcp(io)))
    }

    /// Opens a connection to a UNIX-domain socket.
    #[cfg(unix)]
    pub async fn connect_unix<P: AsRef<Path>>(path: P) -> crate::Result<Stream> {
        let io = UnixStream::connect(path)
            .await
            .map_err(crate::Error::new_connect)?;
        Ok(Stream::new(Io::Unix(io)))
    }

    /// Reads and decodes one message.
    ///
    /// If the receive buffer already holds a complete message it is returned
    /// without touching the socket. Otherwise the calling fiber suspends
    /// until the decoder completes, the peer closes (`Ok(None)`), the read
    /// timeout fires, or the decoder rejects the input.
    ///
    /// Fails with a user error if another read or a pipe is in progress on
    /// this stream.
    pub async fn read<D>(&self, decoder: &mut D) -> crate::Result<Option<D::Item>>
    where
        D: Decoder,
        D::Error: Into<crate::Error>,
    {
        if self.reading.get() || self.piped_out.get() {
            return Err(crate::Error::new_user_read_busy());
        }
        {
            let mut buf = self.rbuf.borrow_mut();
            if !buf.is_empty() {
                if let Some(msg) = decoder.decode(&mut buf).map_err(Into::into)? {
                    return Ok(Some(msg));
                }
            }
        }

        let _guard = ReadGuard::new(&self.reading);
        let fill = async {
            loop {
                self.io.readable().await.map_err(classify_io)?;
                let mut buf = self.rbuf.borrow_mut();
                buf.reserve(INIT_BUFFER_SIZE);
                match self.io.try_read_buf(&mut buf) {
                    Ok(0) => return Ok(None),
                    Ok(n) => {
                        tracing::trace!("received {} bytes", n);
                        if let Some(msg) = decoder.decode(&mut buf).map_err(Into::into)? {
                            return Ok(Some(msg));
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(classify_io(e)),
                }
            }
        };
        match self.timeout.get() {
            Some(dur) => match tokio::time::timeout(dur, fill).await {
                Ok(res) => res,
                Err(_) => Err(crate::Error::new_timeout()),
            },
            None => fill.await,
        }
    }

    /// Writes all of `data`, suspending on socket backpressure.
    ///
    /// Fails with a user error if this stream is the sink side of a pipe.
    pub async fn write(&self, data: &[u8]) -> crate::Result<()> {
        if self.piped_in.get() {
            return Err(crate::Error::new_user_pipe_sink());
        }
        self.write_raw(data).await
    }

    /// Encodes `msg` with `encoder` and writes the result.
    pub async fn write_msg<E, M>(&self, encoder: &mut E, msg: M) -> crate::Result<()>
    where
        E: Encoder<M>,
        E::Error: Into<crate::Error>,
    {
        let mut buf = BytesMut::new();
        encoder.encode(msg, &mut buf).map_err(Into::into)?;
        self.write(&buf).await
    }

    async fn write_raw(&self, mut data: &[u8]) -> crate::Result<()> {
        while !data.is_empty() {
            self.io.writable().await.map_err(classify_io)?;
            match self.io.try_write(data) {
                Ok(n) => data = &data[n..],
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(classify_io(e)),
            }
        }
        Ok(())
    }

    /// Half-closes the write side.
    ///
    /// Fails with a user error if this stream is the sink side of a pipe.
    pub fn shutdown(&self) -> crate::Result<()> {
        if self.piped_in.get() {
            return Err(crate::Error::new_user_pipe_sink());
        }
        self.shutdown_raw()
    }

    fn shutdown_raw(&self) -> crate::Result<()> {
        self.io.shutdown_write().map_err(crate::Error::new_shutdown)
    }

    /// Forwards everything read from `self` into `sink` until EOF.
    ///
    /// Bytes already sitting in the receive buffer are flushed to the sink
    /// first. The socket is then only read between forward-writes, so a slow
    /// sink exerts backpressure on the source. On EOF the sink's write side
    /// is shut down. Both pipe links are severed on every terminal event,
    /// error and cancellation included.
    ///
    /// Returns the number of bytes forwarded.
    pub async fn pipe(&self, sink: &Stream) -> crate::Result<u64> {
        if self.reading.get() || self.piped_out.get() {
            return Err(crate::Error::new_user_read_busy());
        }
        if sink.piped_in.get() {
            return Err(crate::Error::new_user_pipe_busy());
        }
        if self.has_tls() || sink.has_tls() {
            return Err(crate::Error::new_user_pipe_tls());
        }

        let _guard = PipeGuard::new(self, sink);
        let mut forwarded = 0u64;

        let pending = {
            let mut buf = self.rbuf.borrow_mut();
            if buf.is_empty() {
                Bytes::new()
            } else {
                buf.split().freeze()
            }
        };
        if !pending.is_empty() {
            sink.write_raw(&pending).await?;
            forwarded += pending.len() as u64;
        }

        loop {
            self.io.readable().await.map_err(classify_io)?;
            let chunk = {
                let mut buf = self.rbuf.borrow_mut();
                buf.reserve(INIT_BUFFER_SIZE);
                match self.io.try_read_buf(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => buf.split().freeze(),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(classify_io(e)),
                }
            };
            sink.write_raw(&chunk).await?;
            forwarded += chunk.len() as u64;
        }

        sink.shutdown_raw()?;
        tracing::trace!("pipe done, {} bytes forwarded", forwarded);
        Ok(forwarded)
    }

    /// Sets the read timeout. `None` disables it.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.timeout.set(timeout);
    }

    /// Disables Nagle's algorithm on TCP streams; a no-op on UNIX sockets.
    pub fn nodelay(&self, enabled: bool) -> crate::Result<()> {
        match &self.io {
            Io::Tcp(s) => s.set_nodelay(enabled).map_err(crate::Error::new_io),
            #[cfg(unix)]
            Io::Unix(_) => Ok(()),
        }
    }

    /// The remote address, when the transport has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.io.peer_addr()
    }

    /// Whether a TLS session was established on this stream.
    pub fn has_tls(&self) -> bool {
        self.tls.get()
    }

    /// Marks the stream as TLS-protected. Called by a TLS acceptor layered
    /// above the core once the handshake completes.
    pub fn mark_tls(&self) {
        self.tls.set(true);
    }

    #[cfg(test)]
    pub(crate) fn is_read_busy(&self) -> bool {
        self.reading.get() || self.piped_out.get()
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.rbuf.borrow().len()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("peer", &self.peer_addr())
            .field("buffered", &self.buffered_len())
            .field("reading", &self.reading.get())
            .field("piped_out", &self.piped_out.get())
            .field("piped_in", &self.piped_in.get())
            .finish()
    }
}
