//! russh-backed tunneling collaborator.
//!
//! ## Establish
//!
//! 1. **Bind**: listen on the local endpoint first, so a busy port fails fast.
//! 2. **Connect**: open the SSH session to the jump host with a connect
//!    timeout, keepalive and compression settings.
//! 3. **Authenticate**: run the [`AuthChain`] built from the credentials.
//! 4. **Forward**: spawn the accept loop from [`forward`](super::forward).
//!
//! ## Retry Strategy
//!
//! Steps 2-3 are retried with exponential backoff and jitter via `backon`,
//! for transient errors only (see [`is_retryable_error`]). Authentication
//! failures are never retried. This is the collaborator's own policy; the
//! controller above it never retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use russh::{Disconnect, client, keys};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::auth::AuthChain;
use super::config::{MAX_RETRY_DELAY, SshSettings};
use super::error::{TunnelError, is_retryable_error};
use super::forward::spawn_forwarding;
use super::session::{TunnelHandle, Tunneler};
use super::types::ConnectionParams;

/// Client handler that accepts all host keys, like `StrictHostKeyChecking=no`.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Build the russh client configuration.
///
/// The session has no inactivity timeout since it lives as long as the tunnel
/// is referenced; keepalives detect a dead jump host instead.
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// The production [`Tunneler`].
#[derive(Debug, Clone, Default)]
pub struct RusshTunneler {
    settings: SshSettings,
}

impl RusshTunneler {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    async fn connect_with_retry(
        &self,
        params: &ConnectionParams,
    ) -> Result<client::Handle<SshClientHandler>, String> {
        let attempt_counter = AtomicU32::new(0);
        let target = format!("{}@{}", params.username, params.jump);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.settings.retry_delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(self.settings.max_retries as usize)
            .with_jitter();

        let result = (|| async {
            let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
            if current_attempt > 0 {
                warn!("SSH connection retry attempt {} to {}", current_attempt, target);
            }
            self.connect(params).await
        })
        .retry(backoff)
        .when(|e| {
            let retryable = is_retryable_error(e);
            if !retryable {
                warn!("SSH connection to {} failed with non-retryable error: {}", target, e);
            }
            retryable
        })
        .notify(|err, dur| {
            warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
        })
        .await;

        let total_attempts = attempt_counter.load(Ordering::SeqCst);
        result.map_err(|e| {
            error!(
                "SSH connection to {} failed after {} attempt(s). Last error: {}",
                target, total_attempts, e
            );
            format!(
                "SSH connection failed after {} attempt(s). Last error: {}",
                total_attempts, e
            )
        })
    }

    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<client::Handle<SshClientHandler>, String> {
        let config = build_client_config(self.settings.compress);
        let timeout = self.settings.connect_timeout;

        let connect_future = client::connect(
            config,
            (params.jump.host.as_str(), params.jump.port),
            SshClientHandler,
        );

        let mut handle = tokio::time::timeout(timeout, connect_future)
            .await
            .map_err(|_| format!("Connection timed out after {:?}", timeout))?
            .map_err(|e| format!("Failed to connect: {}", e))?;

        AuthChain::for_credentials(params.password.as_deref(), &params.private_key)
            .authenticate(&mut handle, &params.username)
            .await?;

        Ok(handle)
    }
}

#[async_trait]
impl Tunneler for RusshTunneler {
    type Handle = RusshTunnelHandle;

    async fn establish(&self, params: &ConnectionParams) -> Result<RusshTunnelHandle, TunnelError> {
        let listener = TcpListener::bind((params.local.host.as_str(), params.local.port))
            .await
            .map_err(|e| {
                TunnelError::Establishment(format!("Failed to bind to {}: {}", params.local, e))
            })?;

        let session = Arc::new(
            self.connect_with_retry(params)
                .await
                .map_err(TunnelError::Establishment)?,
        );

        let cancel = CancellationToken::new();
        let forwarder = spawn_forwarding(
            listener,
            session.clone(),
            params.remote.clone(),
            cancel.clone(),
        );

        info!("Forwarding {} -> {} via {}", params.local, params.remote, params.jump);

        Ok(RusshTunnelHandle {
            session,
            cancel,
            forwarder: Some(forwarder),
        })
    }

    fn name(&self) -> &'static str {
        "russh"
    }
}

/// Live russh tunnel: the SSH session plus its forwarding task.
pub struct RusshTunnelHandle {
    session: Arc<client::Handle<SshClientHandler>>,
    cancel: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
}

#[async_trait]
impl TunnelHandle for RusshTunnelHandle {
    async fn close(&mut self) -> Result<(), TunnelError> {
        self.cancel.cancel();
        if let Some(forwarder) = self.forwarder.take() {
            // Only fails if the task panicked, which leaves nothing to clean up
            let _ = forwarder.await;
        }

        self.session
            .disconnect(Disconnect::ByApplication, "Tunnel released", "en")
            .await
            .map_err(|e| TunnelError::Teardown(format!("Error during disconnect: {}", e)))
    }
}

impl Drop for RusshTunnelHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
