use anyhow::Context;
use clap::Parser;
use crawl_control_plane::{cli::load_config, Cli, CliRunner};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    crawl_control_plane::cli::setup_logging(args.verbose)
        .context("failed to initialize logging")?;

    info!("starting crawl-control-plane v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await.context("failed to load configuration")?;
    let runner = CliRunner::new(config)
        .await
        .context("failed to connect to coordination store or message bus")?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = tokio::select! {
        result = runner.run(args.command) => result,
        _ = shutdown_rx.recv() => {
            info!("received shutdown signal, draining in-flight work");
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("crawl-control-plane exiting on error: {}", e);
        std::process::exit(1);
    }

    info!("crawl-control-plane stopped");
    Ok(())
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }

        let _ = shutdown_tx.send(());
    })
}
