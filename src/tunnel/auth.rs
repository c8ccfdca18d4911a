//! Jump host authentication strategies.
//!
//! Strategies are tried in order by an [`AuthChain`] until one succeeds:
//!
//! - [`PasswordAuth`]: `auth.pass`
//! - [`KeyAuth`]: the resolved private key text (OpenSSH or PEM), passphrase-less
//! - [`AgentAuth`]: identities from the SSH agent (`SSH_AUTH_SOCK`), used only
//!   when no explicit credential was configured

use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use super::ssh::SshClientHandler;

/// Trait for jump host authentication strategies.
#[async_trait]
pub(crate) trait AuthStrategy: Send + Sync {
    /// * `Ok(true)` - authentication succeeded
    /// * `Ok(false)` - credentials rejected
    /// * `Err(message)` - the attempt itself failed
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    fn name(&self) -> &'static str;
}

pub(crate) struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| format!("Password authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

/// Public key authentication from in-memory key text.
pub(crate) struct KeyAuth {
    key_text: String,
}

impl KeyAuth {
    pub fn new(key_text: impl Into<String>) -> Self {
        Self {
            key_text: key_text.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let key_pair = keys::decode_secret_key(&self.key_text, None)
            .map_err(|e| format!("Key authentication failed: unusable private key: {}", e))?;

        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

pub(crate) struct AgentAuth;

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| format!("Failed to connect to SSH agent: {}", e))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| format!("Failed to get identities from SSH agent: {}", e))?;

        if identities.is_empty() {
            return Err("Agent authentication failed: no identities in SSH agent".to_string());
        }

        for identity in identities {
            debug!("Trying SSH agent identity: {:?}", identity.comment());

            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => debug!("Agent identity not accepted, trying next"),
                Err(e) => debug!("Agent authentication error: {}, trying next", e),
            }
        }

        Err("Agent authentication failed: no identities accepted".to_string())
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

/// Ordered list of strategies; the first success wins.
#[derive(Default)]
pub(crate) struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    /// Password first, then key, then the agent when neither was supplied.
    pub fn for_credentials(password: Option<&str>, private_key: &str) -> Self {
        let mut chain = AuthChain::default();

        if let Some(password) = password {
            chain.strategies.push(Box::new(PasswordAuth::new(password)));
        }

        if !private_key.is_empty() {
            chain.strategies.push(Box::new(KeyAuth::new(private_key)));
        }

        if chain.strategies.is_empty() {
            chain.strategies.push(Box::new(AgentAuth));
        }

        chain
    }

    #[cfg(test)]
    fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<(), String> {
        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Authenticated with strategy: {}", strategy.name());
                    return Ok(());
                }
                Ok(false) => {
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                }
                Err(e) => {
                    debug!("Authentication error with strategy {}: {}", strategy.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => format!("Authentication failed for {}: {}", username, e),
            None => "All authentication methods failed".to_string(),
        })
    }
}
