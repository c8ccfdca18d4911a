//! Ownership of the single live tunnel handle.
//!
//! # Architecture
//!
//! - [`Tunneler`]: the external collaborator that physically opens a tunnel
//!   and hands back a [`TunnelHandle`].
//! - [`CallbackTunneler`]: adapts a callback-style `establish(params, callback)`
//!   function into a [`Tunneler`]. The single completion is translated into a
//!   future here, at the edge, through a oneshot channel.
//! - [`TunnelSession`]: stores at most one handle and exposes `establish` and
//!   `destroy`. It does not serialise callers itself; the controller owns it
//!   behind a lock.
//!
//! # Cancellation
//!
//! Handles are closed on a spawned task when a tokio runtime is available, so
//! dropping a `destroy` (or a timed-out establish) never skips the close.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::error::TunnelError;
use super::types::{ConnectionParams, TunnelInfo};

/// A live tunnel that can be shut down.
#[async_trait]
pub trait TunnelHandle: Send + Sync {
    /// Shut the tunnel down. Errors are reported but the handle is gone either way.
    async fn close(&mut self) -> Result<(), TunnelError>;
}

/// External collaborator that opens tunnels.
///
/// Implementations must be thread-safe (`Send + Sync`) since the controller
/// may be shared across tasks.
#[async_trait]
pub trait Tunneler: Send + Sync {
    type Handle: TunnelHandle + 'static;

    /// Connect the tunnel described by `params`.
    async fn establish(&self, params: &ConnectionParams) -> Result<Self::Handle, TunnelError>;

    /// Name used in log lines.
    fn name(&self) -> &'static str;
}

/// Completion callback handed to a callback-style establish function.
///
/// Arguments are `(error, handle)`. A non-empty error means failure.
pub type EstablishCallback<H> = Box<dyn FnOnce(Option<String>, Option<H>) + Send>;

/// [`Tunneler`] built from a callback-style establish function.
pub struct CallbackTunneler<F, H> {
    establish_fn: F,
    _handle: PhantomData<fn() -> H>,
}

impl<F, H> CallbackTunneler<F, H>
where
    F: Fn(&ConnectionParams, EstablishCallback<H>) + Send + Sync,
{
    pub fn new(establish_fn: F) -> Self {
        Self {
            establish_fn,
            _handle: PhantomData,
        }
    }
}

#[async_trait]
impl<F, H> Tunneler for CallbackTunneler<F, H>
where
    F: Fn(&ConnectionParams, EstablishCallback<H>) + Send + Sync,
    H: TunnelHandle + 'static,
{
    type Handle = H;

    async fn establish(&self, params: &ConnectionParams) -> Result<H, TunnelError> {
        let (tx, rx) = oneshot::channel();
        let callback: EstablishCallback<H> = Box::new(move |error, handle| {
            let outcome = match (error.filter(|e| !e.is_empty()), handle) {
                (Some(error), _) => Err(TunnelError::Establishment(error)),
                (None, Some(handle)) => Ok(handle),
                (None, None) => Err(TunnelError::Establishment(
                    "tunnel reported success without a handle".to_string(),
                )),
            };
            // The receiver is gone once establish was dropped (e.g. timed out)
            if let Err(Ok(handle)) = tx.send(outcome) {
                warn!("Tunnel delivered after establish was abandoned, closing it");
                close_orphan(handle);
            }
        });

        (self.establish_fn)(params, callback);

        rx.await.map_err(|_| {
            TunnelError::Establishment("tunnel callback was dropped without completing".to_string())
        })?
    }

    fn name(&self) -> &'static str {
        "callback"
    }
}

fn close_orphan<H: TunnelHandle + 'static>(mut handle: H) {
    match Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(e) = handle.close().await {
                    warn!("Error while closing abandoned tunnel: {}", e);
                }
            });
        }
        Err(_) => warn!("No runtime to close an abandoned tunnel, dropping it"),
    }
}

struct LiveTunnel<H> {
    handle: H,
    info: TunnelInfo,
}

async fn close_live<H: TunnelHandle>(mut live: LiveTunnel<H>) {
    match live.handle.close().await {
        Ok(()) => info!("Tunnel {} closed", live.info.tunnel_id),
        Err(e) => warn!("Error while closing tunnel {}: {}", live.info.tunnel_id, e),
    }
}

/// Holder of the one live tunnel handle, or none.
pub struct TunnelSession<T: Tunneler> {
    tunneler: T,
    live: Option<LiveTunnel<T::Handle>>,
    establish_timeout: Option<Duration>,
}

impl<T: Tunneler> TunnelSession<T> {
    pub fn new(tunneler: T) -> Self {
        Self {
            tunneler,
            live: None,
            establish_timeout: None,
        }
    }

    /// Bound each establish call. Expiry is reported as an establishment error.
    pub fn with_establish_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.establish_timeout = timeout;
        self
    }

    /// Open the tunnel through the collaborator and keep its handle.
    ///
    /// On failure nothing is stored. Callers must not run two establishes at
    /// once; any handle already held is closed before being replaced.
    pub async fn establish(&mut self, params: ConnectionParams) -> Result<(), TunnelError> {
        let attempt = self.tunneler.establish(&params);
        let handle = match self.establish_timeout {
            Some(timeout) => tokio::time::timeout(timeout, attempt)
                .await
                .map_err(|_| {
                    TunnelError::Establishment(format!(
                        "timed out after {:?} connecting via {}",
                        timeout, params.jump
                    ))
                })??,
            None => attempt.await?,
        };

        let info = TunnelInfo::new(&params);
        info!(
            "Tunnel {} established from {} to {} via {} ({})",
            info.tunnel_id,
            info.local,
            info.remote,
            info.jump,
            self.tunneler.name()
        );

        // No await past this point: a stored handle is never left half-registered
        if let Some(previous) = self.live.replace(LiveTunnel { handle, info }) {
            warn!("Replacing live tunnel {}", previous.info.tunnel_id);
            if let Ok(runtime) = Handle::try_current() {
                runtime.spawn(close_live(previous));
            }
        }
        Ok(())
    }

    /// Close and forget the stored handle. No-op when nothing is stored.
    ///
    /// The handle is detached before the first await. If this future is
    /// dropped midway, the close keeps running on its own task.
    pub async fn destroy(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };
        match Handle::try_current() {
            // Only fails if the close task panicked
            Ok(runtime) => {
                let _ = runtime.spawn(close_live(live)).await;
            }
            Err(_) => close_live(live).await,
        }
    }

    pub fn is_open(&self) -> bool {
        self.live.is_some()
    }

    pub fn info(&self) -> Option<&TunnelInfo> {
        self.live.as_ref().map(|live| &live.info)
    }
}
