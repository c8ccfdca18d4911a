//! Local port forwarding over the jump host session.
//!
//! A TCP listener on the local endpoint accepts database client connections.
//! Each one gets a `direct-tcpip` channel (RFC 4254) to the remote target,
//! and bytes are copied in both directions until either side closes or the
//! tunnel is cancelled.

use std::net::SocketAddr;
use std::sync::Arc;

use russh::client;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::ssh::SshClientHandler;
use super::types::Endpoint;

/// Spawn the accept loop for `listener`, forwarding to `remote`.
///
/// The loop and every connection it spawned stop once `cancel` fires.
pub(crate) fn spawn_forwarding(
    listener: TcpListener,
    session: Arc<client::Handle<SshClientHandler>>,
    remote: Endpoint,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let local_addr = listener.local_addr().ok();
        debug!("Port forwarding active on {:?} -> {}", local_addr, remote);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((local_stream, client_addr)) => {
                    debug!("New connection from {} to forwarded port", client_addr);

                    let session = session.clone();
                    let remote = remote.clone();
                    let cancel = cancel.clone();

                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!("Forwarded connection from {} cancelled", client_addr);
                            }
                            result = forward_connection(&session, local_stream, client_addr, &remote) => {
                                if let Err(e) = result {
                                    debug!("Port forwarding connection error: {}", e);
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    break;
                }
            }
        }

        debug!("Port forwarding on {:?} stopped", local_addr);
    })
}

async fn forward_connection(
    session: &client::Handle<SshClientHandler>,
    local_stream: TcpStream,
    client_addr: SocketAddr,
    remote: &Endpoint,
) -> Result<(), String> {
    let channel = session
        .channel_open_direct_tcpip(
            remote.host.as_str(),
            u32::from(remote.port),
            client_addr.ip().to_string(),
            u32::from(client_addr.port()),
        )
        .await
        .map_err(|e| format!("Failed to open direct-tcpip channel to {}: {}", remote, e))?;

    let channel_stream = channel.into_stream();

    let (mut local_read, mut local_write) = tokio::io::split(local_stream);
    let (mut channel_read, mut channel_write) = tokio::io::split(channel_stream);

    let local_to_remote = tokio::io::copy(&mut local_read, &mut channel_write);
    let remote_to_local = tokio::io::copy(&mut channel_read, &mut local_write);

    tokio::select! {
        result = local_to_remote => {
            if let Err(e) = result {
                debug!("Local to remote copy ended: {}", e);
            }
        }
        result = remote_to_local => {
            if let Err(e) = result {
                debug!("Remote to local copy ended: {}", e);
            }
        }
    }

    debug!("Forwarded connection from {} closed", client_addr);
    Ok(())
}
