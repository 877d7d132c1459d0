//! Admin session and endpoint storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. The admin session token is issued by
//! the server login flow; this module only keeps it between runs.

use keyring::Entry;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::SyncError;

const SERVICE_NAME: &str = "cardapio-sync";

pub const KEY_ENDPOINT_URL: &str = "endpoint_url";
pub const KEY_SESSION_TOKEN: &str = "admin_session_token";

const ALL_KEYS: &[&str] = &[KEY_ENDPOINT_URL, KEY_SESSION_TOKEN];

/// Retrieve a single credential. Returns `None` when the entry does not exist
/// or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<Zeroizing<String>> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(Zeroizing::new(pw)),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), SyncError> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    entry.set_password(value)?;
    Ok(())
}

/// Delete a credential. Succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), SyncError> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Store the session token handed out by the admin login.
pub fn store_session(token: &str) -> Result<(), SyncError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(SyncError::Credentials("session token is empty".into()));
    }
    set_credential(KEY_SESSION_TOKEN, token)?;
    info!("admin session stored");
    Ok(())
}

/// Forget the session, e.g. after the server answered 401.
pub fn clear_session() -> Result<(), SyncError> {
    delete_credential(KEY_SESSION_TOKEN)
}

/// Delete every stored credential.
pub fn reset() -> Result<(), SyncError> {
    info!("deleting all stored credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
