//! Data types shared by the validator, the controller and the collaborators.

use serde::Serialize;

/// A host/port pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Credentials for the jump host. At most one key source is used, see
/// [`resolve_private_key`](super::key::resolve_private_key).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JumpAuth {
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_str: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JumpHost {
    pub host: String,
    pub port: u16,
    pub auth: JumpAuth,
}

impl JumpHost {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Validated tunnel configuration: local bind, remote target, jump host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelConfig {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub jmp: JumpHost,
}

/// Everything the tunneling collaborator needs to open the tunnel.
///
/// Built by the controller on the Closed -> Open transition, with the private
/// key already resolved to text.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub local: Endpoint,
    pub remote: Endpoint,
    pub jump: Endpoint,
    pub username: String,
    pub password: Option<String>,
    /// Private key text, empty when none was configured
    pub private_key: String,
}

impl ConnectionParams {
    pub fn from_config(config: &TunnelConfig, private_key: String) -> Self {
        Self {
            local: config.src.clone(),
            remote: config.dst.clone(),
            jump: config.jmp.endpoint(),
            username: config.jmp.auth.user.clone(),
            password: config.jmp.auth.pass.clone(),
            private_key,
        }
    }
}

// Keeps credentials out of log lines
impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("jump", &self.jump)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &(!self.private_key.is_empty()).then_some("<redacted>"))
            .finish()
    }
}

/// Metadata about the live tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub jump: Endpoint,
    pub username: String,
    /// RFC3339 timestamp of the successful establish
    pub established_at: String,
}

impl TunnelInfo {
    pub(crate) fn new(params: &ConnectionParams) -> Self {
        Self {
            tunnel_id: uuid::Uuid::new_v4().to_string(),
            local: params.local.clone(),
            remote: params.remote.clone(),
            jump: params.jump.clone(),
            username: params.username.clone(),
            established_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
