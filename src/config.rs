use std::{
    net::{IpAddr, Ipv6Addr},
    path::PathBuf,
};

use clap::Parser;

fn validate_server_version(value: &str) -> Result<String, String> {
    if value.starts_with("SSH-2.0-") {
        Ok(value.into())
    } else {
        Err("server version must start with \"SSH-2.0-\"".into())
    }
}

// CLI configuration for the gateway.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Address to listen on for SSH connections.
    #[arg(
        long,
        default_value_t = IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        value_name = "ADDRESS"
    )]
    pub listen_address: IpAddr,

    /// Port to listen on for SSH connections.
    #[arg(long, default_value_t = 2020, value_name = "PORT")]
    pub ssh_port: u16,

    /// Path to the certificate authority public key.
    #[arg(long, default_value_os = "id_rsa.ca.pub", value_name = "FILE")]
    pub ca_public_key: PathBuf,

    /// Path to the host certificate signed by the certificate authority.
    #[arg(long, default_value_os = "id_rsa.host-cert.pub", value_name = "FILE")]
    pub host_certificate: PathBuf,

    /// Path to the host private key.
    #[arg(long, default_value_os = "id_rsa.host", value_name = "FILE")]
    pub host_private_key: PathBuf,

    /// Version banner presented to SSH clients.
    #[arg(
        long,
        default_value_t = String::from("SSH-2.0-gatehouse"),
        value_parser = validate_server_version,
        value_name = "STRING"
    )]
    pub server_version: String,

    /// Seconds a connection may stay idle before the scavenger closes it.
    #[arg(long, default_value_t = 600, value_name = "SECONDS")]
    pub idle_timeout: u64,

    /// Seconds between scavenger runs.
    #[arg(long, default_value_t = 30, value_name = "SECONDS")]
    pub scavenge_interval: u64,
}
