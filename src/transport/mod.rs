//! Byte-stream transports a connection can run over.
//!
//! The protocol only needs an ordered, reliable pair of streams. `connect`
//! hands both halves out once; the connection owns them from then on.

pub mod tcp;

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

pub use tcp::TcpTransport;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait Transport: Send {
    /// Peer identifier used in logs and errors.
    fn peer(&self) -> String;

    /// Open the link and return its inbound and outbound halves.
    async fn connect(&mut self) -> io::Result<(BoxedReader, BoxedWriter)>;

    /// Release whatever the transport still holds after both halves are closed.
    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A link that is already established, e.g. an in-memory duplex in tests.
pub struct StreamTransport<R, W> {
    peer: String,
    halves: Option<(R, W)>,
}

impl<R, W> StreamTransport<R, W> {
    pub fn new(peer: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            peer: peer.into(),
            halves: Some((reader, writer)),
        }
    }
}

impl<S> StreamTransport<ReadHalf<S>, WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite,
{
    /// Split a bidirectional stream into its two halves.
    pub fn from_stream(peer: impl Into<String>, stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(peer, reader, writer)
    }
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn peer(&self) -> String {
        self.peer.clone()
    }

    async fn connect(&mut self) -> io::Result<(BoxedReader, BoxedWriter)> {
        let (reader, writer) = self.halves.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "stream was already handed out")
        })?;
        Ok((Box::new(reader), Box::new(writer)))
    }
}
