//! Sender task for pushing a file or directory tree.
//!
//! Pulls entries from the Generator, writes one frame per entry and, after each
//! FILE frame, suspends until the control listener reports FILE_ACK.

use crate::error::{PushError, Result};
use crate::streaming::channel::{AckSlot, AckWait, PushStats, DATA_CHUNK_SIZE};
use crate::streaming::generator::{Generator, WalkEntry};
use crate::streaming::protocol::{
    write_frame, DirectoryHeader, FileHeader, VirtualPath, MAX_FILE_LENGTH,
};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Sender configuration
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Bytes read and written per content chunk
    pub chunk_size: usize,
    /// Upper bound on each FILE_ACK wait; `None` waits forever
    pub ack_timeout: Option<Duration>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DATA_CHUNK_SIZE,
            ack_timeout: None,
        }
    }
}

/// Sender state
pub struct Sender<'a, W> {
    writer: &'a mut W,
    ack: &'a AckSlot,
    config: SenderConfig,
    cancel: CancellationToken,
    stats: PushStats,
}

impl<'a, W> Sender<'a, W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: &'a mut W, ack: &'a AckSlot, config: SenderConfig) -> Self {
        Self {
            writer,
            ack,
            config,
            cancel: CancellationToken::new(),
            stats: PushStats::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Write every frame for `path`, waiting for an ack after each file.
    ///
    /// Any error aborts the remaining walk. Bytes already written stay on the wire.
    pub async fn send_path(&mut self, path: &Path) -> Result<PushStats> {
        self.stats = PushStats::new();
        let cancel = self.cancel.clone();
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PushError::Cancelled),
            res = self.walk(path) => res,
        };
        res.map(|()| self.stats.clone())
    }

    async fn walk(&mut self, path: &Path) -> Result<()> {
        let mut generator = Generator::new(path);
        while let Some(entry) = generator.next().await? {
            match entry {
                WalkEntry::Directory {
                    path,
                    destination,
                    child_count,
                } => {
                    tracing::debug!("Sending directory {} -> {}", path.display(), destination);
                    self.write_directory(destination, child_count).await?;
                }
                WalkEntry::File {
                    path,
                    name,
                    destination,
                    len,
                } => {
                    self.write_file(&path, name, destination, len).await?;
                    self.await_ack(&path).await?;
                    self.stats.files += 1;
                }
            }
        }
        self.stats.skipped = generator.skipped();
        Ok(())
    }

    async fn write_directory(&mut self, destination: VirtualPath, child_count: u16) -> Result<()> {
        let header = DirectoryHeader {
            destination,
            child_count,
        };
        write_frame(&mut *self.writer, &header.encode()?).await?;
        self.writer.flush().await?;
        self.stats.directories += 1;
        Ok(())
    }

    async fn write_file(
        &mut self,
        path: &Path,
        name: String,
        destination: VirtualPath,
        len: u64,
    ) -> Result<()> {
        if len > MAX_FILE_LENGTH {
            return Err(PushError::FileTooLarge {
                path: path.to_path_buf(),
                len,
            });
        }
        tracing::debug!("Sending file {} -> {}", path.display(), destination);

        let header = FileHeader::new(name, destination, len as u32).encode()?;
        let file = File::open(path).await?;

        if !self.ack.arm() {
            return Err(PushError::protocol("Previous FILE frame is still unacknowledged"));
        }

        write_frame(&mut *self.writer, &header).await?;

        let mut reader = file.take(len);
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut sent = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            self.writer.write_all(&buf[..n]).await?;
            sent += n as u64;
        }

        if sent != len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} shrank to {} of {} bytes while sending", path.display(), sent, len),
            )
            .into());
        }

        let crc = hasher.finalize();
        self.writer.write_u64(u64::from(crc)).await?;
        self.writer.flush().await?;

        tracing::debug!("Sent {} bytes, crc {:#010x}", sent, crc);
        self.stats.bytes += sent;
        Ok(())
    }

    async fn await_ack(&mut self, path: &Path) -> Result<()> {
        tracing::debug!("Waiting on FILE_ACK for {}", path.display());
        let outcome = match self.config.ack_timeout {
            Some(limit) => tokio::time::timeout(limit, self.ack.wait())
                .await
                .map_err(|_| PushError::AckTimeout(limit))?,
            None => self.ack.wait().await,
        };
        match outcome {
            AckWait::Acked => {
                tracing::debug!("FILE_ACK received for {}", path.display());
                Ok(())
            }
            AckWait::Closed => Err(PushError::Closed),
        }
    }
}
