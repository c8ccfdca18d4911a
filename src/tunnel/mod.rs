//! Shared SSH tunnel with reference-counted lifecycle.
//!
//! This module is organized into the following submodules:
//!
//! - `validate`: Structural validation of the JSON tunnel configuration
//! - `key`: Private key resolution from a file or inline text
//! - `session`: Collaborator traits and the owner of the live tunnel handle
//! - `refcount`: The acquire/release state machine
//! - `ssh`: russh-backed collaborator (jump host connect and auth)
//! - `forward`: Local listener forwarding over `direct-tcpip` channels
//! - `config`: Runtime settings with environment variable support
//! - `error`: Error type and retry classification

mod auth;
pub mod config;
pub mod error;
mod forward;
pub mod key;
pub mod refcount;
pub mod session;
pub mod ssh;
pub mod types;
pub mod validate;

pub use config::SshSettings;
pub use error::TunnelError;
pub use key::resolve_private_key;
pub use refcount::TunnelRefCounter;
pub use session::{CallbackTunneler, EstablishCallback, TunnelHandle, TunnelSession, Tunneler};
pub use ssh::{RusshTunnelHandle, RusshTunneler};
pub use types::{ConnectionParams, Endpoint, JumpAuth, JumpHost, TunnelConfig, TunnelInfo};
