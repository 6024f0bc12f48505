//! OCI registry server
//!
//! Run with: cargo run -p depot --features cli -- --config depot.toml

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::Parser;
use depot::RegistryBuilder;
use depot::config::Config;
use eyre::WrapErr;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "OCI container registry")]
struct Args {
    /// Configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration file.
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::from_toml("")?,
    };

    let options = config.options();
    let storage = config
        .storage
        .clone()
        .build()
        .await
        .wrap_err("Configuring storage")?;

    let mut builder = RegistryBuilder::new(storage)
        .bucket(config.bucket.clone())
        .options(options);
    if let Some(auth) = &config.auth {
        builder = builder.authenticator(
            auth.authenticator(),
            auth.realm.clone(),
            auth.service.clone(),
        );
    }
    let (registry, app) = builder.into_parts();
    let sweeper = registry.spawn_sweeper();

    let addr = args.bind.unwrap_or(config.bind);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Binding {addr}"))?;
    tracing::info!(%addr, bucket = %config.bucket, "OCI registry listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "unable to listen for shutdown signal");
            }
        })
        .await
        .wrap_err("Serving registry")?;

    sweeper.abort();
    tracing::info!("OCI registry stopped");
    Ok(())
}
