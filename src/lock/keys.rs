//! Lock key conventions.
//!
//! Keys follow `lock:<namespace>:<identifier>`, e.g. `lock:google-sheets:1AbC`.
//! A key must never contain control characters; they would corrupt the
//! store protocol and make keys impossible to inspect.

use super::LockError;

pub const TOKEN_REFRESH: &str = "token-refresh";
pub const GOOGLE_SHEETS: &str = "google-sheets";
pub const ESCROW: &str = "escrow";
pub const BID_SELECTION: &str = "bid-selection";

/// Singleton key for critical sections that have no natural identifier.
pub const GLOBAL_LOCK_KEY: &str = "lock:global";

/// Build `lock:<namespace>:<id>`.
#[must_use]
pub fn lock_key(namespace: &str, id: &str) -> String {
    format!("lock:{}:{}", namespace, id)
}

/// Reject keys the shared store cannot safely hold.
pub fn validate_resource(resource: &str) -> Result<(), LockError> {
    if resource.is_empty() {
        return Err(LockError::InvalidResource {
            resource: String::new(),
            reason: "must not be empty",
        });
    }
    if resource.chars().any(char::is_control) {
        return Err(LockError::InvalidResource {
            resource: resource.escape_debug().to_string(),
            reason: "must not contain control characters",
        });
    }
    Ok(())
}
