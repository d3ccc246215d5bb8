//! Control listener for the inbound half of a connection.
//!
//! Reads one message-type byte at a time. KEEP_ALIVE is ignored, FILE_ACK
//! releases the sender, anything else is logged and skipped. A failed read is
//! the normal way the listener ends.

use crate::error::PushError;
use crate::streaming::channel::AckSlot;
use crate::streaming::protocol::MessageType;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How the listener loop ended.
#[derive(Debug)]
pub enum ListenerExit {
    /// Asked to stop during shutdown.
    Stopped,
    /// The peer closed its side.
    EndOfStream,
    /// The read failed.
    Disconnected(io::Error),
}

/// Counters kept by one listener run.
#[derive(Debug)]
pub struct ListenerStats {
    pub acks: u64,
    /// FILE_ACKs that arrived while no file was outstanding.
    pub stray_acks: u64,
    pub keep_alives: u64,
    /// Known types the receiver should never send, plus unknown bytes.
    pub ignored: u64,
    pub exit: ListenerExit,
}

/// Spawn the listener task. It owns the reader and drops it on exit.
pub fn spawn_listener<R>(
    reader: R,
    ack: Arc<AckSlot>,
    stop: CancellationToken,
) -> JoinHandle<ListenerStats>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move { run_listener(reader, &ack, stop).await })
}

pub async fn run_listener<R>(mut reader: R, ack: &AckSlot, stop: CancellationToken) -> ListenerStats
where
    R: AsyncRead + Unpin,
{
    tracing::debug!("Listening for control messages");
    let mut acks = 0;
    let mut stray_acks = 0;
    let mut keep_alives = 0;
    let mut ignored = 0;

    let exit = loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => break ListenerExit::Stopped,
            read = reader.read_u8() => read,
        };

        let raw = match read {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!("Input stream closed by peer");
                break ListenerExit::EndOfStream;
            }
            Err(e) => {
                tracing::debug!("Input stream was disconnected: {}", e);
                break ListenerExit::Disconnected(e);
            }
        };

        match MessageType::from_u8(raw) {
            Some(MessageType::KeepAlive) => {
                tracing::trace!("KEEP_ALIVE");
                keep_alives += 1;
            }
            Some(MessageType::FileAck) => {
                if ack.release() {
                    acks += 1;
                } else {
                    tracing::warn!("FILE_ACK received with no file outstanding");
                    stray_acks += 1;
                }
            }
            Some(other) => {
                tracing::warn!("Ignoring unexpected {:?} from peer", other);
                ignored += 1;
            }
            None => {
                tracing::warn!("{}", PushError::UnknownMessageType(raw));
                ignored += 1;
            }
        }
    };

    // Nothing can release the slot any more.
    ack.close();

    ListenerStats {
        acks,
        stray_acks,
        keep_alives,
        ignored,
        exit,
    }
}
