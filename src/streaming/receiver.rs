//! Receiving side of the push protocol.
//!
//! Decodes the frame sequence, rebuilds the tree under a root directory and
//! answers every FILE frame with FILE_ACK once its checksum has been read.
//! Optionally emits KEEP_ALIVE on a fixed interval so an idle link stays up.

use crate::error::{PushError, Result};
use crate::streaming::protocol::{
    read_message_type, write_control, DirectoryHeader, FileHeader, MessageType, VirtualPath,
};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Validate that a relative path is safe and doesn't escape the root.
/// Returns the full path if valid.
fn validate_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(PushError::protocol("Empty path not allowed"));
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        return Err(PushError::protocol(format!(
            "Absolute paths not allowed: {relative}"
        )));
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                return Err(PushError::protocol(format!(
                    "Path traversal not allowed: {relative}"
                )));
            }
            Component::Prefix(_) => {
                return Err(PushError::protocol(format!(
                    "Windows prefix paths not allowed: {relative}"
                )));
            }
            _ => {}
        }
    }

    let full = root.join(rel_path);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        return Err(PushError::protocol(format!(
            "Path escapes root directory: {relative}"
        )));
    }

    Ok(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

/// A file name must be exactly one normal path component.
fn validate_file_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(()),
        _ => Err(PushError::protocol(format!("Invalid file name: {name:?}"))),
    }
}

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Directory the virtual root maps to
    pub root: PathBuf,
    /// KEEP_ALIVE period; `None` never sends one
    pub keep_alive: Option<Duration>,
}

/// Statistics for one received push
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiveStats {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
    /// Files whose content did not match the transmitted CRC; they are removed
    pub checksum_failures: u64,
    /// Whether the sender finished with STOP rather than just closing
    pub stopped: bool,
}

/// Receiver state
pub struct Receiver {
    config: ReceiverConfig,
    stats: ReceiveStats,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            stats: ReceiveStats::default(),
        }
    }

    pub fn stats(&self) -> &ReceiveStats {
        &self.stats
    }

    /// Process frames until STOP or end of stream.
    ///
    /// Unknown message types are fatal; nothing after them can be framed.
    pub async fn run<R, W>(&mut self, mut reader: R, writer: W) -> Result<ReceiveStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = Arc::new(Mutex::new(writer));
        let keep_alive = self
            .config
            .keep_alive
            .map(|period| spawn_keep_alive(writer.clone(), period));

        let res = self.receive_loop(&mut reader, &writer).await;

        if let Some(handle) = keep_alive {
            handle.abort();
        }
        res?;

        let mut writer = writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Could not close the output stream: {}", e);
        }

        Ok(self.stats.clone())
    }

    async fn receive_loop<R, W>(&mut self, reader: &mut R, writer: &Mutex<W>) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let msg_type = match read_message_type(reader).await {
                Ok(t) => t,
                Err(PushError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::warn!("Sender closed the stream without STOP");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match msg_type {
                MessageType::File => {
                    let header = FileHeader::read(reader).await?;
                    self.handle_file(reader, header).await?;

                    let mut w = writer.lock().await;
                    write_control(&mut *w, MessageType::FileAck).await?;
                    w.flush().await?;
                }
                MessageType::Directory => {
                    let dir = DirectoryHeader::read(reader).await?;
                    self.handle_directory(dir).await?;
                }
                MessageType::Stop => {
                    tracing::debug!("STOP received");
                    self.stats.stopped = true;
                    return Ok(());
                }
                MessageType::KeepAlive => {}
                MessageType::FileAck => {
                    tracing::warn!("Ignoring FILE_ACK from sender");
                }
            }
        }
    }

    fn resolve(&self, destination: &VirtualPath) -> Result<PathBuf> {
        if destination.is_root() {
            Ok(self.config.root.clone())
        } else {
            validate_path(&self.config.root, destination.as_str())
        }
    }

    async fn handle_directory(&mut self, dir: DirectoryHeader) -> Result<()> {
        let full_path = self.resolve(&dir.destination)?;
        tracing::debug!(
            "Directory {} ({} children) -> {}",
            dir.destination,
            dir.child_count,
            full_path.display()
        );
        fs::create_dir_all(&full_path).await?;
        self.stats.directories += 1;
        Ok(())
    }

    async fn handle_file<R>(&mut self, reader: &mut R, header: FileHeader) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        validate_file_name(&header.name)?;
        let dir = self.resolve(&header.destination)?;
        fs::create_dir_all(&dir).await?;
        let full_path = dir.join(&header.name);

        let mut file = File::create(&full_path).await?;
        let mut content = (&mut *reader).take(u64::from(header.length));
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut received = 0u64;
        loop {
            let n = content.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            received += n as u64;
        }
        file.flush().await?;
        drop(file);

        if received != u64::from(header.length) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{} truncated: {} of {} bytes",
                    header.name, received, header.length
                ),
            )
            .into());
        }

        let expected = reader.read_u64().await?;
        let actual = u64::from(hasher.finalize());
        if expected != actual {
            tracing::warn!(
                "Checksum mismatch for {}: expected {:#x}, got {:#x}",
                full_path.display(),
                expected,
                actual
            );
            if let Err(e) = fs::remove_file(&full_path).await {
                tracing::warn!("Failed to remove {}: {}", full_path.display(), e);
            }
            self.stats.checksum_failures += 1;
            return Ok(());
        }

        tracing::debug!("Received {} ({} bytes)", full_path.display(), received);
        self.stats.files += 1;
        self.stats.bytes += received;
        Ok(())
    }
}

fn spawn_keep_alive<W>(writer: Arc<Mutex<W>>, period: Duration) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut w = writer.lock().await;
            let sent = match write_control(&mut *w, MessageType::KeepAlive).await {
                Ok(()) => w.flush().await.map_err(PushError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                tracing::debug!("Stopping keep-alive: {}", e);
                break;
            }
        }
    })
}
