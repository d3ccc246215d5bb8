//! One-shot push: connect to a peer, send one path, close.

use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::PushConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::streaming::{PushStats, StatusSink};
use crate::transport::TcpTransport;

/// Outcome of a completed push
#[derive(Debug, Clone)]
pub struct PushSummary {
    pub stats: PushStats,
    pub duration: Duration,
}

/// Push `source` to the receiver listening at `peer` (`host:port`).
pub async fn push_to(
    peer: &str,
    source: &Path,
    config: PushConfig,
    status: impl StatusSink + 'static,
    cancel: CancellationToken,
) -> Result<PushSummary> {
    let start = Instant::now();
    let connection =
        Connection::new(TcpTransport::new(peer), status, config).with_cancellation(cancel);
    let stats = connection.send(source).await?;

    Ok(PushSummary {
        stats,
        duration: start.elapsed(),
    })
}
