#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use dotenv::dotenv;
use serde_json::Value;
use tracing::{error, info};

/// Environment variable holding the path of the JSON tunnel configuration
const CONFIG_ENV_VAR: &str = "SSH_TUNNEL_CONFIG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok())
        .ok_or_else(|| format!("usage: shared-ssh-tunnel <config.json> (or set {CONFIG_ENV_VAR})"))?;

    let config: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    if !shared_ssh_tunnel::verify_configuration(&config) {
        error!("Configuration in {} is not usable", path);
        return Err(format!("invalid configuration in {path}").into());
    }

    shared_ssh_tunnel::increment_connections(&config).await?;
    if let Some(info) = shared_ssh_tunnel::tunnel_info().await {
        info!("{}", serde_json::to_string(&info)?);
    }
    info!("Tunnel is up, press Ctrl-C to close it");

    tokio::signal::ctrl_c().await?;

    shared_ssh_tunnel::decrement_connections().await;
    info!(
        "Tunnel closed, {} active connection(s)",
        shared_ssh_tunnel::get_number_of_connections()
    );

    Ok(())
}
