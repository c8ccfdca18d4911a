//! Private key material resolution.

use std::path::PathBuf;

use super::error::TunnelError;
use super::types::JumpAuth;

/// Returns the trimmed private key text for the jump host.
///
/// A non-empty `keyFile` wins and is read in full; otherwise `keyStr` is used.
/// Neither set yields an empty string. A read failure is returned, never
/// swallowed.
pub fn resolve_private_key(auth: &JumpAuth) -> Result<String, TunnelError> {
    match auth.key_file.as_deref().filter(|path| !path.is_empty()) {
        Some(path) => std::fs::read_to_string(path)
            .map(|contents| contents.trim().to_string())
            .map_err(|source| TunnelError::KeyResolution {
                path: PathBuf::from(path),
                source,
            }),
        None => Ok(auth.key_str.as_deref().unwrap_or_default().trim().to_string()),
    }
}
