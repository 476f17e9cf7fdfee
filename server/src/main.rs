use clap::Parser;
use log::{error, info};
use netplus_server::config::ServerArgs;
use netplus_server::network::Server;
use std::sync::Arc;

/// Main-method of the server.
/// Parses command-line arguments, binds the sockets and serves until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = ServerArgs::parse();
    let settings = args.settings()?;
    info!(
        "Starting with {} pool threads, heartbeat every {:?}",
        settings.pool.threads, settings.heartbeat_interval
    );

    let server = Arc::new(Server::bind(settings).await?);
    let mut running = tokio::spawn(Arc::clone(&server).run());

    tokio::select! {
        result = &mut running => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server failed: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
            }
            server.shutdown().await;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    server.shutdown().await;
    running.await??;
    Ok(())
}
