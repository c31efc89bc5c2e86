use clap::Parser;
use dotenv::dotenv;
use livetap::server::{serve_tcp, serve_ws};
use livetap::{BoxError, CliArgs, Settings, StreamRegistry, TcpUpstream};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = CliArgs::parse();
    let settings = Settings::new(&cli)?;

    info!(
        upstream = %settings.upstream.address,
        tcp = %settings.server.tcp_address,
        ws = %settings.server.ws_address,
        queue_capacity = settings.session.queue_capacity,
        "starting livetap"
    );

    let upstream = Arc::new(TcpUpstream::new(settings.upstream.address.clone()));
    let registry = StreamRegistry::spawn(upstream, settings.cache.clone());

    let tcp = TcpListener::bind(&settings.server.tcp_address).await?;
    let ws = TcpListener::bind(&settings.server.ws_address).await?;
    let capacity = settings.session.queue_capacity;

    tokio::select! {
        _ = serve_tcp(tcp, registry.clone(), capacity) => {}
        _ = serve_ws(ws, registry.clone(), capacity) => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutting down");
        }
    }

    Ok(())
}
