use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use filepush::cli::{Cli, Command, ReceiveArgs, SendArgs};
use filepush::config::{Config, PushConfig, ReceiveSettings};
use filepush::streaming::{status_channel, StatusReport};
use filepush::{client, logging, server};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log)?;

    let config = Config::load_or_default(cli.config.as_deref())?;
    let quiet = cli.log.quiet;

    match cli.command {
        Command::Send(args) => run_send(args, config.push, quiet).await,
        Command::Receive(args) => run_receive(args, config.receive).await,
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted");
            token.cancel();
        }
    });
}

fn print_report(report: &StatusReport) {
    if report.is_success() {
        println!("{} {}", "✓".green().bold(), report.label);
    } else {
        eprintln!("{} {}", "✗".red().bold(), report.label);
    }
}

async fn run_send(args: SendArgs, mut config: PushConfig, quiet: bool) -> Result<()> {
    args.apply(&mut config);
    config.validate()?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let (status_tx, mut status_rx) = status_channel();
    let result = client::push_to(&args.peer, &args.path, config, status_tx, cancel).await;

    while let Some(report) = status_rx.recv().await {
        if !quiet || !report.is_success() {
            print_report(&report);
        }
    }

    let summary = result.with_context(|| format!("Failed to send {}", args.path.display()))?;
    if !quiet {
        println!(
            "  {} files, {} directories, {} bytes in {:.2?}",
            summary.stats.files,
            summary.stats.directories,
            summary.stats.bytes,
            summary.duration
        );
    }
    Ok(())
}

async fn run_receive(args: ReceiveArgs, mut settings: ReceiveSettings) -> Result<()> {
    args.apply(&mut settings);
    settings.validate()?;
    let config = settings.receiver_config(Path::new("."));

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    server::run_server(&args.bind, config, shutdown).await
}
