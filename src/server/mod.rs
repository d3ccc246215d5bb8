//! Receiving daemon - runs when invoked as `filepush receive`
//!
//! Accepts TCP connections and runs one `Receiver` per connection until the
//! shutdown token fires.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::streaming::{ReceiveStats, Receiver, ReceiverConfig};

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}

/// Bind `addr` and serve until `shutdown` is cancelled.
pub async fn run_server(
    addr: &str,
    config: ReceiverConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    serve(listener, config, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    mut config: ReceiverConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    config.root = expand_tilde(&config.root);
    if !config.root.exists() {
        tokio::fs::create_dir_all(&config.root)
            .await
            .with_context(|| format!("Failed to create {}", config.root.display()))?;
    }

    let local = listener.local_addr()?;
    tracing::info!(
        "Receiving on {} into {}",
        local,
        config.root.display()
    );

    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted.context("Failed to accept connection")?,
        };
        tracing::info!("Accepted connection from {}", peer);

        let config = config.clone();
        tokio::spawn(async move {
            match handle_connection(stream, config).await {
                Ok(stats) => tracing::info!(
                    "Push from {} finished: {} files, {} directories, {} bytes, {} bad checksums",
                    peer,
                    stats.files,
                    stats.directories,
                    stats.bytes,
                    stats.checksum_failures
                ),
                Err(e) => tracing::error!("Push from {} failed: {:#}", peer, e),
            }
        });
    }

    tracing::info!("Receiver on {} shutting down", local);
    Ok(())
}

/// Run one receiver over an accepted stream.
pub async fn handle_connection(stream: TcpStream, config: ReceiverConfig) -> Result<ReceiveStats> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut receiver = Receiver::new(config);
    let stats = receiver.run(reader, writer).await?;
    Ok(stats)
}
