use std::{sync::Arc, time::Duration};

use color_eyre::eyre::Context;
use tokio::{fs, net::TcpListener, time::interval};
use tracing::{debug, info, warn};

use crate::{
    config::ApplicationConfig,
    gateway::{Gateway, GatewaySettings},
};

// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    info!("Starting gatehouse...");
    let ca_public_key = fs::read_to_string(config.ca_public_key.as_path())
        .await
        .with_context(|| "Error reading certificate authority public key")?;
    let host_certificate = fs::read_to_string(config.host_certificate.as_path())
        .await
        .with_context(|| "Error reading host certificate")?;
    let host_private_key = fs::read_to_string(config.host_private_key.as_path())
        .await
        .with_context(|| "Error reading host private key")?;
    let gateway = Gateway::new(GatewaySettings {
        server_version: config.server_version,
        ca_public_key,
        host_certificate,
        host_private_key,
    })
    .with_context(|| "Error creating gateway")?;

    let listener = TcpListener::bind((config.listen_address, config.ssh_port))
        .await
        .with_context(|| "Error listening on SSH port")?;
    info!(address = %config.listen_address, port = config.ssh_port, "Listening for SSH connections.");

    let scavenger = {
        let gateway = Arc::clone(&gateway);
        let idle_timeout = Duration::from_secs(config.idle_timeout);
        let mut ticker = interval(Duration::from_secs(config.scavenge_interval));
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                gateway.scavenge_connections(idle_timeout).await;
            }
        })
    };
    let acceptor = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => Arc::clone(&gateway).handle_connection(stream, peer),
                    Err(error) => warn!(%error, "Failed to accept incoming TCP connection."),
                }
            }
        })
    };

    wait_for_signal().await;
    info!("Shutting down...");
    acceptor.abort();
    scavenger.abort();
    gateway.close().await;
    Ok(())
}

// Block until the operating system asks the gateway to exit.
#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("signal handler installs");
    let mut sigint = signal(SignalKind::interrupt()).expect("signal handler installs");

    tokio::select! {
        _ = sigterm.recv() => debug!("Caught SIGTERM, shutting down."),
        _ = sigint.recv() => debug!("Caught SIGINT, shutting down."),
    }
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let mut ctrl_c = windows::ctrl_c().expect("signal handler installs");
    let mut ctrl_break = windows::ctrl_break().expect("signal handler installs");
    let mut ctrl_close = windows::ctrl_close().expect("signal handler installs");
    let mut ctrl_shutdown = windows::ctrl_shutdown().expect("signal handler installs");

    tokio::select! {
        _ = ctrl_c.recv() => debug!("Caught CTRL_C, shutting down."),
        _ = ctrl_break.recv() => debug!("Caught CTRL_BREAK, shutting down."),
        _ = ctrl_close.recv() => debug!("Caught CTRL_CLOSE, shutting down."),
        _ = ctrl_shutdown.recv() => debug!("Caught CTRL_SHUTDOWN, shutting down."),
    }
}
