//! Runtime settings resolution for the tunnel.
//!
//! Each setting follows a three-tier priority:
//!
//! 1. **Parameter** - explicitly provided value (highest priority)
//! 2. **Environment Variable** - value from the environment
//! 3. **Default** - built-in value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_TUNNEL_CONNECT_TIMEOUT` | 30s | Jump host connect timeout in seconds |
//! | `SSH_TUNNEL_MAX_RETRIES` | 3 | Maximum jump host connect retries |
//! | `SSH_TUNNEL_RETRY_DELAY_MS` | 1000ms | Initial retry delay in milliseconds |
//! | `SSH_TUNNEL_COMPRESSION` | true | Enable zlib compression |
//! | `SSH_TUNNEL_ESTABLISH_TIMEOUT` | unset | Upper bound for one establish call, in seconds |

use std::env;
use std::time::Duration;

/// Default jump host connect timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default maximum retry attempts for the jump host connect
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Cap for the exponential backoff between connect retries
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_TUNNEL_CONNECT_TIMEOUT";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "SSH_TUNNEL_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "SSH_TUNNEL_RETRY_DELAY_MS";
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_TUNNEL_COMPRESSION";
pub(crate) const ESTABLISH_TIMEOUT_ENV_VAR: &str = "SSH_TUNNEL_ESTABLISH_TIMEOUT";

/// Settings used by [`RusshTunneler`](super::ssh::RusshTunneler) when it
/// connects to the jump host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub compress: bool,
}

impl SshSettings {
    /// Resolve every setting from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: Duration::from_secs(resolve_connect_timeout(None)),
            max_retries: resolve_max_retries(None),
            retry_delay: Duration::from_millis(resolve_retry_delay_ms(None)),
            compress: resolve_compression(None),
        }
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            compress: true,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|value| value.trim().parse().ok())
}

/// Resolve the connect timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> u64 {
    timeout_param
        .or_else(|| env_parsed(CONNECT_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS)
}

/// Resolve the max retries with priority: parameter -> env var -> default
pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    max_retries_param
        .or_else(|| env_parsed(MAX_RETRIES_ENV_VAR))
        .unwrap_or(DEFAULT_MAX_RETRIES)
}

/// Resolve the retry delay with priority: parameter -> env var -> default
pub(crate) fn resolve_retry_delay_ms(retry_delay_param: Option<u64>) -> u64 {
    retry_delay_param
        .or_else(|| env_parsed(RETRY_DELAY_MS_ENV_VAR))
        .unwrap_or(DEFAULT_RETRY_DELAY_MS)
}

/// Resolve the compression flag with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

/// Resolve the optional establish timeout: parameter -> env var -> none.
///
/// Zero means "no timeout", same as leaving the variable unset.
pub(crate) fn resolve_establish_timeout(timeout_param: Option<u64>) -> Option<Duration> {
    timeout_param
        .or_else(|| env_parsed(ESTABLISH_TIMEOUT_ENV_VAR))
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
