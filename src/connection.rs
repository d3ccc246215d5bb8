//! One push session with a peer.
//!
//! ```text
//! Idle --open/send--> Opening --ok--> Open --shutdown--> Closing --> Closed
//!                        |                                            ^
//!                        +------------------- connect error ----------+
//! ```
//!
//! A connection carries at most one transfer and is closed once that transfer
//! ends, successfully or not. The inbound half is owned by the control
//! listener task; the outbound half is only ever written by `send`.

use crate::config::PushConfig;
use crate::error::{PushError, Result};
use crate::streaming::channel::{AckSlot, PushStats, StatusReport, StatusSink};
use crate::streaming::generator::entry_name;
use crate::streaming::listener::{spawn_listener, ListenerStats};
use crate::streaming::protocol::{write_control, MessageType};
use crate::streaming::sender::Sender;
use crate::transport::{BoxedWriter, Transport};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

/// The live halves of an open link.
struct OpenLink {
    writer: BoxedWriter,
    listener: JoinHandle<ListenerStats>,
    stop_listener: CancellationToken,
}

/// Clears the sending flag when the transfer is over, however it ends.
struct SendingGuard<'a>(&'a AtomicBool);

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Connection {
    peer: String,
    transport: Mutex<Box<dyn Transport>>,
    state: std::sync::Mutex<LifecycleState>,
    sending: AtomicBool,
    ack: Arc<AckSlot>,
    link: Mutex<Option<OpenLink>>,
    status: Box<dyn StatusSink>,
    cancel: CancellationToken,
    config: PushConfig,
}

impl Connection {
    pub fn new(
        transport: impl Transport + 'static,
        status: impl StatusSink + 'static,
        config: PushConfig,
    ) -> Self {
        Self {
            peer: transport.peer(),
            transport: Mutex::new(Box::new(transport)),
            state: std::sync::Mutex::new(LifecycleState::Idle),
            sending: AtomicBool::new(false),
            ack: Arc::new(AckSlot::new()),
            link: Mutex::new(None),
            status: Box::new(status),
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Use an externally owned token, e.g. one tied to Ctrl-C.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> LifecycleState {
        *self.lock_state()
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    /// Whether a `send` issued now would be accepted.
    pub fn can_send(&self) -> bool {
        !self.is_sending() && matches!(self.state(), LifecycleState::Idle | LifecycleState::Open)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LifecycleState> {
        // State is a plain enum; a panic while holding the lock cannot leave it torn.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = self.lock_state();
        tracing::debug!("Connection to {}: {:?} -> {:?}", self.peer, *state, next);
        *state = next;
    }

    /// Open the transport and start the control listener.
    ///
    /// A no-op when already open. Fails with `Closed` once the connection
    /// has been shut down; connections are not reopened.
    pub async fn open(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            match *state {
                LifecycleState::Idle => *state = LifecycleState::Opening,
                LifecycleState::Open => return Ok(()),
                LifecycleState::Opening => {
                    return Err(PushError::protocol("Connection is already opening"))
                }
                LifecycleState::Closing | LifecycleState::Closed => return Err(PushError::Closed),
            }
        }

        let link = match self.connect_link().await {
            Ok(link) => link,
            Err(e) => {
                tracing::error!("Could not connect to {}: {}", self.peer, e);
                if let Err(close_err) = self.transport.lock().await.close().await {
                    tracing::warn!(
                        "Could not close the connection to {}: {}",
                        self.peer,
                        close_err
                    );
                }
                self.set_state(LifecycleState::Closed);
                return Err(e);
            }
        };

        // Hold the slot while checking the state so a concurrent shutdown
        // either sees the stored link or has already moved past Opening.
        let mut slot = self.link.lock().await;
        let opened = {
            let mut state = self.lock_state();
            let opened = *state == LifecycleState::Opening;
            if opened {
                *state = LifecycleState::Open;
            }
            opened
        };

        if opened {
            *slot = Some(link);
            tracing::info!("Connected to {}", self.peer);
            Ok(())
        } else {
            drop(slot);
            tracing::debug!("Connection to {} closed while opening", self.peer);
            self.close_link(link).await;
            Err(PushError::Closed)
        }
    }

    async fn connect_link(&self) -> Result<OpenLink> {
        let mut transport = self.transport.lock().await;
        let limit = self.config.connect_timeout();
        let connect = async {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, transport.connect()).await {
                    Ok(res) => res,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect timed out after {limit:?}"),
                    )),
                },
                None => transport.connect().await,
            }
        };

        let res = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PushError::Cancelled),
            res = connect => res,
        };
        let (reader, writer) = res.map_err(|source| PushError::Connect {
            peer: self.peer.clone(),
            source,
        })?;

        let stop_listener = CancellationToken::new();
        let listener = spawn_listener(reader, self.ack.clone(), stop_listener.clone());
        Ok(OpenLink {
            writer,
            listener,
            stop_listener,
        })
    }

    /// Push a file or a directory tree, then close the connection.
    ///
    /// Rejected with `TransferBusy` without touching the link when another
    /// send is in flight. Every accepted call produces exactly one status
    /// report labelled with the final component of `path`.
    pub async fn send(&self, path: impl AsRef<Path>) -> Result<PushStats> {
        let path = path.as_ref();
        if self
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Rejecting {}: a transfer is already in progress", path.display());
            return Err(PushError::TransferBusy);
        }
        let _guard = SendingGuard(&self.sending);

        if matches!(self.state(), LifecycleState::Closing | LifecycleState::Closed) {
            return Err(PushError::Closed);
        }

        let label = status_label(path).await;
        tracing::info!("Sending {} to {}", path.display(), self.peer);

        let result = self.transfer(path).await;
        match &result {
            Ok(stats) => {
                tracing::info!(
                    "Sent {} to {}: {} files, {} directories, {} bytes",
                    label,
                    self.peer,
                    stats.files,
                    stats.directories,
                    stats.bytes
                );
                self.status.notify(StatusReport::success(label));
            }
            Err(e) => {
                tracing::error!("Error occurred when sending {}: {}", path.display(), e);
                self.status.notify(StatusReport::failure(label));
            }
        }

        self.shutdown().await;
        result
    }

    async fn transfer(&self, path: &Path) -> Result<PushStats> {
        if self.state() == LifecycleState::Idle {
            self.open().await?;
        }

        let mut link = self.link.lock().await;
        let link = link.as_mut().ok_or(PushError::Closed)?;
        Sender::new(&mut link.writer, &self.ack, self.config.sender_config())
            .with_cancellation(self.cancel.clone())
            .send_path(path)
            .await
    }

    /// Abort the transfer in flight, if any. It still reports failure and shuts down.
    pub fn cancel(&self) {
        tracing::debug!("Cancelling transfer to {}", self.peer);
        self.cancel.cancel();
    }

    /// Close the connection.
    ///
    /// While a send is in flight this only cancels it; the send performs the
    /// shutdown itself.
    pub async fn close(&self) {
        if self.is_sending() {
            self.cancel();
            return;
        }
        self.shutdown().await;
    }

    /// Tear the link down. Every step runs even when an earlier one failed.
    async fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            match *state {
                LifecycleState::Closing | LifecycleState::Closed => return,
                _ => *state = LifecycleState::Closing,
            }
        }
        tracing::debug!("Closing connection to {}", self.peer);

        let link = self.link.lock().await.take();
        if let Some(link) = link {
            self.close_link(link).await;
        }

        if let Err(e) = self.transport.lock().await.close().await {
            tracing::warn!("Could not close the connection to {}: {}", self.peer, e);
        }

        self.set_state(LifecycleState::Closed);
        tracing::info!("Connection to {} closed", self.peer);
    }

    /// STOP, flush, close output, then stop the listener and close input.
    async fn close_link(&self, mut link: OpenLink) {
        if let Err(e) = write_control(&mut link.writer, MessageType::Stop).await {
            tracing::warn!("Could not write stop message: {}", e);
        }
        if let Err(e) = link.writer.flush().await {
            tracing::warn!("Could not flush the output stream: {}", e);
        }
        if let Err(e) = link.writer.shutdown().await {
            tracing::warn!("Could not close the output stream: {}", e);
        }
        drop(link.writer);

        link.stop_listener.cancel();
        match link.listener.await {
            Ok(stats) => tracing::debug!(
                "Listener finished ({:?}): {} acks, {} keep-alives, {} ignored",
                stats.exit,
                stats.acks,
                stats.keep_alives,
                stats.ignored + stats.stray_acks
            ),
            Err(e) => tracing::warn!("Could not close the input stream: {}", e),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().as_ref() {
            link.stop_listener.cancel();
        }
    }
}

/// Label used in status reports: the name the peer receives the path under.
///
/// Paths like `.` resolve to the real directory name, as the walk does.
pub async fn status_label(path: &Path) -> String {
    entry_name(path)
        .await
        .unwrap_or_else(|_| path.display().to_string())
}
