//! Pieces pertaining to the wire protocols: HTTP/1 framing and the FastCGI
//! record protocol.

pub mod fcgi;
pub(crate) mod h1;

/// The default maximum read buffer size. If the buffer gets this big and
/// a message head is still not complete, a `TooLarge` error is triggered.
pub(crate) const DEFAULT_MAX_BUFFER_SIZE: usize = 8192 + 4096 * 100;
