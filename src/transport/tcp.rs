//! TCP transport - stands in for the RFCOMM socket on ordinary networks.

use super::{BoxedReader, BoxedWriter, Transport};
use async_trait::async_trait;
use std::io;
use tokio::net::TcpStream;

/// Connects to `host:port` when the connection is opened.
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn peer(&self) -> String {
        self.addr.clone()
    }

    async fn connect(&mut self) -> io::Result<(BoxedReader, BoxedWriter)> {
        tracing::debug!("Connecting to {}", self.addr);
        let stream = TcpStream::connect(&self.addr).await?;
        // Frames are flushed one at a time; Nagle only delays the acks.
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }
}
