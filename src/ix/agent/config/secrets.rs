//! OS secret-store access. Passwords, API keys, and the cached web-session
//! cookie payload all live under the `imxup` keyring service; the ini file
//! never carries them.

use keyring::Entry;

use crate::ix::agent::config::constants::KEYRING_SERVICE;
use crate::ix::agent::config::{Error, Result};

fn entry(name: &str) -> Result<Entry> {
    Entry::new(KEYRING_SERVICE, name).map_err(|e| Error::secret_store(e.to_string()))
}

/// Reads a secret, returning `None` when the entry does not exist.
pub fn get_secret(name: &str) -> Result<Option<String>> {
    match entry(name)?.get_password() {
        Ok(value) => Ok(Some(value)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(Error::secret_store(e.to_string())),
    }
}

/// Writes a secret, replacing any existing value.
pub fn set_secret(name: &str, value: &str) -> Result<()> {
    entry(name)?
        .set_password(value)
        .map_err(|e| Error::secret_store(e.to_string()))
}

/// Removes a secret. Missing entries are not an error.
pub fn delete_secret(name: &str) -> Result<()> {
    match entry(name)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(Error::secret_store(e.to_string())),
    }
}
