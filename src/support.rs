//! Shared helpers for in-crate unit tests.

use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Decoder;

use crate::proto::h1::HeadDecoder;
use crate::stream::Stream;
use crate::trx::Transaction;

/// A connected loopback stream pair: `(client, server)`.
pub(crate) async fn pair() -> (Stream, Stream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, server) = tokio::join!(TcpStream::connect(addr), async {
        listener.accept().await
    });
    (
        Stream::from_tcp(client.unwrap()),
        Stream::from_tcp(server.unwrap().0),
    )
}

/// Yields whatever bytes are buffered, one message per arrival.
pub(crate) struct ChunkDecoder;

impl Decoder for ChunkDecoder {
    type Item = Bytes;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> crate::Result<Option<Bytes>> {
        if src.is_empty() {
            Ok(None)
        } else {
            Ok(Some(src.split().freeze()))
        }
    }
}

/// Writes `raw` from a client socket and parses it into a server-side
/// transaction. Returns the client stream for inspecting the response.
pub(crate) async fn transaction_for(raw: &[u8]) -> (Stream, Transaction) {
    let (client, server) = pair().await;
    client.write(raw).await.unwrap();
    let server = Rc::new(server);
    let head = server.read(&mut HeadDecoder).await.unwrap().unwrap();
    let tx = Transaction::new(server, head).unwrap();
    (client, tx)
}

/// Drains the client side until EOF.
pub(crate) async fn read_until_eof(client: &Stream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = client.read(&mut ChunkDecoder).await.unwrap() {
        out.extend_from_slice(&chunk);
    }
    out
}
