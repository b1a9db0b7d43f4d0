use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use cobalt_s3_copy::config::{init_tracing, load_from_env, CopierEnv};
use cobalt_s3_copy::s3::{Client, S3Object, S3Store};

/// Copy (or, with COPY_DELETE_SOURCE=true, move) one S3 object to another
/// location, server-side.
///
/// Copier settings are read from `COPY_*` environment variables, or the
/// matching `--copy-*` flags.
#[derive(Debug, Parser)]
struct Args {
    /// The object to copy, as `s3://bucket/key`.
    source: S3Object,
    /// Where to copy it to, as `s3://bucket/key`.
    destination: S3Object,
    #[command(flatten)]
    settings: CopierEnv,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let args = Args::parse();

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown_signal(shutdown.clone()));

    let shared_config = load_from_env().await?;
    let store = Arc::new(S3Store::new(Client::new(&shared_config)));
    let copier = args.settings.copier(store, shutdown);
    let request = args.settings.request(args.source, args.destination);

    let summary = copier.copy(&request).await.context("Copy failed")?;
    tracing::info!(
        content_length = summary.content_length,
        part_count = summary.part_count,
        upload_id = ?summary.upload_id,
        "Copy finished"
    );
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM. The copy then returns an error and
/// `main` exits non-zero.
async fn cancel_on_shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, cancelling copy"),
        _ = terminate => tracing::info!("Received SIGTERM, cancelling copy"),
    }
    token.cancel();
}
