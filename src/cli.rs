//! Command line interface.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{PushConfig, ReceiveSettings};

#[derive(Debug, Parser)]
#[command(name = "filepush", version, about = "Push files and directory trees to a peer")]
pub struct Cli {
    #[command(flatten)]
    pub log: LogArgs,

    /// Config file (default: <config dir>/filepush/config.toml)
    #[arg(long, global = true, env = "FILEPUSH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct LogArgs {
    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Extra tracing filter directives, comma separated
    #[arg(long, global = true)]
    pub log_filter: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Push a file or directory to a receiver
    Send(SendArgs),
    /// Accept pushes and write them under a root directory
    Receive(ReceiveArgs),
}

#[derive(Debug, Args)]
pub struct SendArgs {
    /// File or directory to push
    pub path: PathBuf,

    /// Receiver address (host:port)
    #[arg(long, env = "FILEPUSH_PEER")]
    pub peer: String,

    /// Content chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Give up waiting for a FILE_ACK after this many milliseconds
    #[arg(long)]
    pub ack_timeout_ms: Option<u64>,

    /// Give up connecting after this many milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,
}

impl SendArgs {
    /// Apply flags on top of file configuration.
    pub fn apply(&self, config: &mut PushConfig) {
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if self.ack_timeout_ms.is_some() {
            config.ack_timeout_ms = self.ack_timeout_ms;
        }
        if self.connect_timeout_ms.is_some() {
            config.connect_timeout_ms = self.connect_timeout_ms;
        }
    }
}

#[derive(Debug, Args)]
pub struct ReceiveArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:4911")]
    pub bind: String,

    /// Directory pushed trees are written under
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Send KEEP_ALIVE every this many milliseconds
    #[arg(long)]
    pub keep_alive_ms: Option<u64>,
}

impl ReceiveArgs {
    pub fn apply(&self, settings: &mut ReceiveSettings) {
        if self.root.is_some() {
            settings.root = self.root.clone();
        }
        if self.keep_alive_ms.is_some() {
            settings.keep_alive_ms = self.keep_alive_ms;
        }
    }
}
