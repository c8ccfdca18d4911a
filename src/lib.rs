//! Reference-counted shared SSH tunnel for database connections.
//!
//! Many logical database connections share one tunnel through a jump host.
//! The first [`increment_connections`] opens it, the last
//! [`decrement_connections`] closes it, and concurrent callers never open it
//! twice.
//!
//! The free functions below drive the process-wide controller, backed by
//! [`RusshTunneler`](tunnel::RusshTunneler) and configured from the
//! environment on first use. Use [`TunnelRefCounter`] directly to supply a
//! different collaborator.
//!
//! ```rust,ignore
//! let config = serde_json::from_str(&std::fs::read_to_string("tunnel.json")?)?;
//! shared_ssh_tunnel::increment_connections(&config).await?;
//! // ... connect the database driver to tunnelConfig.src ...
//! shared_ssh_tunnel::decrement_connections().await;
//! ```

pub mod tunnel;

use once_cell::sync::Lazy;
use serde_json::Value;

use tunnel::config::resolve_establish_timeout;
pub use tunnel::{TunnelError, TunnelRefCounter};
use tunnel::{RusshTunneler, SshSettings, TunnelSession};

static CONTROLLER: Lazy<TunnelRefCounter<RusshTunneler>> = Lazy::new(|| {
    let session = TunnelSession::new(RusshTunneler::new(SshSettings::from_env()))
        .with_establish_timeout(resolve_establish_timeout(None));
    TunnelRefCounter::from_session(session)
});

/// Whether `config` is a well-formed tunnel configuration. Logs the first
/// failing reason.
pub fn verify_configuration(config: &Value) -> bool {
    tunnel::validate::verify(config)
}

/// Acquire the process-wide tunnel, opening it if no one holds it yet.
pub async fn increment_connections(config: &Value) -> Result<(), TunnelError> {
    CONTROLLER.acquire(config).await
}

/// Release the process-wide tunnel, closing it on the last release.
pub async fn decrement_connections() {
    CONTROLLER.release().await
}

/// Number of consumers holding the process-wide tunnel.
pub fn get_number_of_connections() -> usize {
    CONTROLLER.get_count()
}

/// Metadata of the process-wide tunnel while it is open.
pub async fn tunnel_info() -> Option<tunnel::TunnelInfo> {
    CONTROLLER.tunnel_info().await
}
