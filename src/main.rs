use anyhow::Context;
use clap::Parser;
use lpcert::cli::{Command, CommandLineArguments, RunCommand, StatusReport};
use lpcert::config::Configuration;
use lpcert::provider::provider_from_config;
use lpcert::server::{ServerCredentials, serve_https};
use lpcert::{CRATE_NAME, config};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ENV_FILTER_NAME: &str = "LPCERT_LOG";

async fn run(config: Configuration, command: RunCommand) -> anyhow::Result<()> {
    let listen = command.listen.unwrap_or(config.listen);
    let credentials = Arc::new(ServerCredentials::new());
    let provider = provider_from_config(&config, credentials.clone())?;

    // Bind first: TLS-ALPN-01 validation of the first certificate already needs the listener
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Binding HTTPS listener on {listen} failed"))?;
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_https(listener, credentials.clone(), shutdown.clone()));

    let swap_target = credentials.clone();
    let _provider_handle = provider
        .start(Arc::new(move |material| {
            if let Err(e) = swap_target.set_credentials(&material) {
                error!("Installing new certificate failed, keeping the previous one: {e:#}");
            }
        }))
        .await
        .context("Starting certificate provider failed")?;

    info!("{CRATE_NAME} is serving HTTPS on {listen}");
    tokio::signal::ctrl_c()
        .await
        .context("Waiting for shutdown signal failed")?;
    info!("Shutting down");
    shutdown.cancel();
    server.await??;
    Ok(())
}

async fn status(config: Configuration) -> anyhow::Result<()> {
    let report = StatusReport::collect(&config, OffsetDateTime::now_utc()).await?;
    print!("{report}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CommandLineArguments::parse();
    let filter = EnvFilter::try_from_env(ENV_FILTER_NAME).unwrap_or_else(|_| {
        EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| {
            EnvFilter::new(if cli.verbose {
                "lpcert=debug,info"
            } else {
                "info"
            })
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
    // rustls and instant-acme's HTTP client share the process-wide crypto provider
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        error!("A different TLS crypto provider was already installed");
    }

    let config = config::load(&cli.config)
        .with_context(|| format!("Loading configuration from {} failed", cli.config.display()))?;
    match cli.command {
        Command::Run(command) => run(config, command).await,
        Command::Status => status(config).await,
    }
}
