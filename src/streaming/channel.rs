//! Coordination types shared by the sending task and the control listener.
//!
//! The only state the two tasks share is the pending-ack slot. Status reports
//! flow one way, from the connection back to whoever asked for the transfer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Default content chunk size when streaming FILE frames.
pub const DATA_CHUNK_SIZE: usize = 1024;

// =============================================================================
// Pending-ack slot: Sender <-> Listener
// =============================================================================

/// Single-slot rendezvous between the sender and the control listener.
///
/// The sender arms the slot right before writing a FILE frame and waits on it
/// after the checksum is flushed. The listener releases it on FILE_ACK. At most
/// one FILE frame can be unacknowledged at any time.
#[derive(Debug, Default)]
pub struct AckSlot {
    pending: AtomicBool,
    closed: AtomicBool,
    notify: Notify,
}

/// Why a wait on the slot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckWait {
    Acked,
    /// The inbound side is gone; no ack can arrive any more.
    Closed,
}

impl AckSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a FILE frame as outstanding.
    ///
    /// Returns `false` if a previous frame is still unacknowledged, in which
    /// case the slot is left untouched.
    pub fn arm(&self) -> bool {
        self.pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the outstanding frame. Returns `false` for an ack nobody waits for.
    pub fn release(&self) -> bool {
        let was_pending = self.pending.swap(false, Ordering::AcqRel);
        if was_pending {
            self.notify.notify_one();
        }
        was_pending
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Wake any waiter for good. Called when the inbound stream ends.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Suspend until the outstanding frame is acknowledged.
    ///
    /// No timeout here; callers that want one wrap this future.
    pub async fn wait(&self) -> AckWait {
        loop {
            let notified = self.notify.notified();
            if !self.is_pending() {
                return AckWait::Acked;
            }
            if self.is_closed() {
                return AckWait::Closed;
            }
            notified.await;
        }
    }
}

// =============================================================================
// Status reporting: Connection -> caller
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// One notification per top-level `send()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub outcome: Outcome,
    /// Final component of the path passed to `send`.
    pub label: String,
}

impl StatusReport {
    pub fn success(label: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Success,
            label: label.into(),
        }
    }

    pub fn failure(label: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failure,
            label: label.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Receiver of status notifications.
pub trait StatusSink: Send + Sync {
    fn notify(&self, report: StatusReport);
}

impl StatusSink for mpsc::UnboundedSender<StatusReport> {
    fn notify(&self, report: StatusReport) {
        if self.send(report).is_err() {
            tracing::debug!("Status receiver dropped, report discarded");
        }
    }
}

impl<T: StatusSink + ?Sized> StatusSink for Arc<T> {
    fn notify(&self, report: StatusReport) {
        (**self).notify(report)
    }
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn notify(&self, report: StatusReport) {
        match report.outcome {
            Outcome::Success => tracing::info!("Sent {}", report.label),
            Outcome::Failure => tracing::warn!("Failed to send {}", report.label),
        }
    }
}

/// Create an unbounded channel for status reports.
pub fn status_channel() -> (
    mpsc::UnboundedSender<StatusReport>,
    mpsc::UnboundedReceiver<StatusReport>,
) {
    mpsc::unbounded_channel()
}

// =============================================================================
// Transfer statistics
// =============================================================================

/// Statistics for one push
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PushStats {
    /// FILE frames written and acknowledged
    pub files: u64,

    /// DIRECTORY frames written
    pub directories: u64,

    /// Content bytes written
    pub bytes: u64,

    /// Directory entries that were neither file nor directory
    pub skipped: u64,
}

impl PushStats {
    pub fn new() -> Self {
        Self::default()
    }
}

// =============================================================================
// Tests
// =============================================================================
