//! Security layer: feature gates, auth tokens, ACLs, and input validation.
//!
//! Gates default to enabled for convenience in local development but can be
//! hard-disabled through the config document or environment (see
//! [`crate::config::Settings::apply_env_overrides`]). Auth tokens are
//! HMAC-SHA256 over a caller-supplied message with a shared secret; the
//! verify path recomputes and compares in constant time.

use crate::config::settings;
use crate::error::{Result, RpcError};
use hmac::{Hmac, Mac};
use regex::Regex;
use serde_json::{Map, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Keyword argument carrying the auth token on guarded calls.
pub const AUTH_TOKEN_KEY: &str = "_auth_token";

const SECRET_ENV: &str = "TP_DCC_RPC_SECRET";
const SECRET_PLACEHOLDER: &str = "tp-dcc-rpc-dev-secret";

/// Whether environment variables may override config values.
pub fn env_control_enabled() -> bool {
    settings().security.allow_env_control
}

/// Whether remote callers may invoke functions at all.
pub fn remote_control_enabled() -> bool {
    settings().security.allow_remote_control
}

/// Whether payload encryption is requested.
///
/// Consulted by deployments that require it; the transport itself does not
/// encrypt (see DESIGN.md).
pub fn encryption_enabled() -> bool {
    settings().security.enable_encryption
}

/// Whether calls must carry a valid `_auth_token`.
pub fn auth_required() -> bool {
    settings().security.require_auth
}

/// The shared HMAC secret.
///
/// Read once from `TP_DCC_RPC_SECRET`; the built-in placeholder is for
/// local development only and logs a warning on first use.
fn shared_secret() -> &'static str {
    static SECRET: OnceLock<String> = OnceLock::new();
    SECRET.get_or_init(|| match std::env::var(SECRET_ENV) {
        Ok(secret) if !secret.is_empty() => secret,
        _ => {
            warn!(
                "{} not set; using the development placeholder secret",
                SECRET_ENV
            );
            SECRET_PLACEHOLDER.to_string()
        }
    })
}

/// Generate an auth token for `message` (hex-encoded HMAC-SHA256).
pub fn generate_auth_token(message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(shared_secret().as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an auth token against `message`.
pub fn verify_auth_token(message: &str, token: &str) -> bool {
    let Ok(raw) = hex::decode(token) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(shared_secret().as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    mac.verify_slice(&raw).is_ok()
}

/// Auth gate applied before a guarded function runs.
///
/// When auth is required, removes `_auth_token` from the call kwargs and
/// verifies it against the function name. Missing or invalid tokens are a
/// permission error; the wrapped function never sees the token either way.
pub fn require_auth(function_name: &str, kwargs: &mut Map<String, Value>) -> Result<()> {
    let token = kwargs.remove(AUTH_TOKEN_KEY);
    if !auth_required() {
        return Ok(());
    }
    match token {
        Some(Value::String(token)) if verify_auth_token(function_name, &token) => Ok(()),
        Some(_) => Err(RpcError::Permission {
            message: format!("Invalid auth token for '{}'", function_name),
        }),
        None => Err(RpcError::Permission {
            message: format!("Auth token required for '{}'", function_name),
        }),
    }
}

/// One compiled ACL pattern: exact client id, or `*`-wildcard match.
#[derive(Debug, Clone)]
struct AclPattern {
    raw: String,
    wildcard: Option<Regex>,
}

impl AclPattern {
    fn compile(raw: &str) -> Self {
        let wildcard = if raw.contains('*') {
            let escaped: Vec<String> = raw.split('*').map(|p| regex::escape(p)).collect();
            let pattern = format!("^{}$", escaped.join(".*"));
            match Regex::new(&pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Failed to compile ACL pattern {:?}: {}", raw, e);
                    None
                }
            }
        } else {
            None
        };
        Self {
            raw: raw.to_string(),
            wildcard,
        }
    }

    fn matches(&self, client_id: &str) -> bool {
        if self.raw == client_id {
            return true;
        }
        self.wildcard
            .as_ref()
            .map(|re| re.is_match(client_id))
            .unwrap_or(false)
    }
}

/// Per-function access-control lists.
///
/// Absence of an entry for a function means unrestricted access; presence
/// means the client id must match at least one pattern.
#[derive(Default)]
pub struct AccessControl {
    entries: RwLock<HashMap<String, Vec<AclPattern>>>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the ACL for a function.
    pub fn register_function_acl(&self, function_name: &str, allowed_client_patterns: &[&str]) {
        let compiled = allowed_client_patterns
            .iter()
            .map(|p| AclPattern::compile(p))
            .collect();
        self.entries
            .write()
            .expect("ACL lock poisoned")
            .insert(function_name.to_string(), compiled);
    }

    /// Remove the ACL for a function, reverting it to unrestricted.
    pub fn clear_function_acl(&self, function_name: &str) {
        self.entries
            .write()
            .expect("ACL lock poisoned")
            .remove(function_name);
    }

    /// Check whether a client may call a function.
    pub fn check_function_access(&self, function_name: &str, client_id: &str) -> bool {
        let entries = self.entries.read().expect("ACL lock poisoned");
        match entries.get(function_name) {
            None => true,
            Some(patterns) => patterns.iter().any(|p| p.matches(client_id)),
        }
    }
}

/// A named parameter validator.
pub type Validator = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// Run each named parameter through its validator.
///
/// A parameter absent from `kwargs` fails validation, as does a validator
/// returning false. The error names the offending parameter.
pub fn validate_params(spec: &[(&str, Validator)], kwargs: &Map<String, Value>) -> Result<()> {
    for (param, validator) in spec {
        let value = kwargs.get(*param).ok_or_else(|| RpcError::Validation {
            param: param.to_string(),
            message: "missing required parameter".to_string(),
        })?;
        if !validator(value) {
            return Err(RpcError::Validation {
                param: param.to_string(),
                message: "validation failed".to_string(),
            });
        }
    }
    Ok(())
}
