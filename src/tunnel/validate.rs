//! Structural validation of the tunnel configuration document.
//!
//! The configuration arrives as untyped JSON shaped like:
//!
//! ```json
//! {
//!   "tunnelConfig": {
//!     "src": { "host": "127.0.0.1", "port": 3307 },
//!     "dst": { "host": "db.internal", "port": 3306 },
//!     "jmp": {
//!       "host": "bastion.example.com", "port": 22,
//!       "auth": { "user": "deploy", "pass": "...", "keyStr": "...", "keyFile": "..." }
//!     }
//!   }
//! }
//! ```
//!
//! Checks run in document order and stop at the first failure, whose reason
//! is logged. Rules:
//!
//! - nested sections must be JSON objects
//! - hosts and `auth.user` must be non-empty strings
//! - ports may be numbers or numeric strings, and must be integers in 1..=65535
//! - `auth.pass`, `auth.keyStr` and `auth.keyFile` are optional; `null` and `""`
//!   count as absent, any other non-string value is rejected

use serde_json::{Map, Value};
use tracing::error;

use super::types::{Endpoint, JumpAuth, JumpHost, TunnelConfig};

type Object = Map<String, Value>;

/// Returns whether `config` has the shape required to open a tunnel.
///
/// Never fails: the first failing reason is logged and `false` returned.
pub fn verify(config: &Value) -> bool {
    match parse(config) {
        Ok(_) => true,
        Err(reason) => {
            error!("{}", reason);
            false
        }
    }
}

/// Validate `config` and extract the typed [`TunnelConfig`].
///
/// The error is the first failing reason, in check order.
pub fn parse(config: &Value) -> Result<TunnelConfig, String> {
    let root = object(
        Some(config),
        "the given configuration is missing or not an object",
    )?;
    let tunnel = object(root.get("tunnelConfig"), &missing("tunnelConfig", "an object"))?;

    let src = endpoint(tunnel, "src")?;
    let dst = endpoint(tunnel, "dst")?;

    let jmp = object(tunnel.get("jmp"), &missing("tunnelConfig.jmp", "an object"))?;
    let jmp_endpoint = endpoint_fields(jmp, "tunnelConfig.jmp")?;
    let auth = object(jmp.get("auth"), &missing("tunnelConfig.jmp.auth", "an object"))?;

    let auth = JumpAuth {
        user: string(auth.get("user"), "tunnelConfig.jmp.auth.user")?,
        pass: optional_string(auth.get("pass"), "tunnelConfig.jmp.auth.pass")?,
        key_str: optional_string(auth.get("keyStr"), "tunnelConfig.jmp.auth.keyStr")?,
        key_file: optional_string(auth.get("keyFile"), "tunnelConfig.jmp.auth.keyFile")?,
    };

    Ok(TunnelConfig {
        src,
        dst,
        jmp: JumpHost {
            host: jmp_endpoint.host,
            port: jmp_endpoint.port,
            auth,
        },
    })
}

fn missing(path: &str, kind: &str) -> String {
    format!("{path} is missing or not {kind} within the given configuration")
}

fn object<'a>(value: Option<&'a Value>, message: &str) -> Result<&'a Object, String> {
    value
        .and_then(Value::as_object)
        .ok_or_else(|| message.to_string())
}

fn endpoint(tunnel: &Object, name: &str) -> Result<Endpoint, String> {
    let path = format!("tunnelConfig.{name}");
    let section = object(tunnel.get(name), &missing(&path, "an object"))?;
    endpoint_fields(section, &path)
}

fn endpoint_fields(section: &Object, path: &str) -> Result<Endpoint, String> {
    let host = string(section.get("host"), &format!("{path}.host"))?;
    let port = port(section.get("port"), &format!("{path}.port"))?;
    Ok(Endpoint { host, port })
}

fn string(value: Option<&Value>, path: &str) -> Result<String, String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(missing(path, "a string")),
    }
}

// Falsy values (null, false, 0, "") mean the field is not set
fn optional_string(value: Option<&Value>, path: &str) -> Result<Option<String>, String> {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
        Some(Value::Number(n)) if n.as_f64() == Some(0.0) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(format!(
            "{path} is not a string within the given configuration"
        )),
    }
}

// Only JSON numbers and numeric strings count. Booleans are not coerced to 0/1,
// and fractional ports never name a socket, so both are rejected.
fn port(value: Option<&Value>, path: &str) -> Result<u16, String> {
    let number = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    number
        .filter(|n| n.fract() == 0.0 && *n >= 1.0 && *n <= f64::from(u16::MAX))
        .map(|n| n as u16)
        .ok_or_else(|| missing(path, "a number"))
}
