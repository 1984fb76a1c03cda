use clap::Parser;
use gatehouse::{config::ApplicationConfig, entrypoint};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let config = ApplicationConfig::parse();
    entrypoint(config).await
}
