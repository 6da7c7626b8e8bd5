//! Password to key derivation.
//!
//! Every blob carries its own salt, so a key is derived once per blob: the
//! header, the footer, each note and icon, and each payload. The cost of
//! the chosen preset is paid that many times over a session.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use crate::keys::{MasterKey, Salt, KEY_LENGTH};
use capsule_common::{Error, Result};

/// Argon2id cost settings.
///
/// Not stored in the container; reopening needs the same values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory in KiB.
    pub memory_cost: u32,
    /// Passes over memory.
    pub time_cost: u32,
    /// Lanes.
    pub parallelism: u32,
}

impl KdfParams {
    /// 64 MiB, three passes.
    pub fn interactive() -> Self {
        Self {
            memory_cost: 64 * 1024,
            time_cost: 3,
            parallelism: 4,
        }
    }

    /// 32 MiB, three passes. The default, since containers with many small
    /// items derive many keys.
    pub fn moderate() -> Self {
        Self {
            memory_cost: 32 * 1024,
            time_cost: 3,
            parallelism: 2,
        }
    }

    /// 256 MiB, four passes.
    pub fn sensitive() -> Self {
        Self {
            memory_cost: 256 * 1024,
            time_cost: 4,
            parallelism: 4,
        }
    }

    /// Look up a preset by name.
    ///
    /// # Errors
    /// - `InvalidInput` for anything but `interactive`, `moderate` or `sensitive`
    pub fn from_preset(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "interactive" => Ok(Self::interactive()),
            "moderate" => Ok(Self::moderate()),
            "sensitive" => Ok(Self::sensitive()),
            _ => Err(Error::InvalidInput(format!(
                "Unknown KDF preset '{}': use interactive, moderate, or sensitive",
                name
            ))),
        }
    }

    fn argon2(&self) -> Result<Argon2<'static>> {
        let params = Params::new(
            self.memory_cost,
            self.time_cost,
            self.parallelism,
            Some(KEY_LENGTH),
        )
        .map_err(|e| Error::EncryptionFailure(format!("Invalid KDF parameters: {}", e)))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::moderate()
    }
}

/// Derive the 256-bit key for one blob.
///
/// # Errors
/// - `InvalidInput` for an empty password
/// - `EncryptionFailure` if the parameters are out of Argon2's range
pub fn derive_key(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<MasterKey> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }

    let mut key = MasterKey::from_bytes([0u8; KEY_LENGTH]);
    params
        .argon2()?
        .hash_password_into(password, salt.as_bytes(), key.as_mut_bytes())
        .map_err(|e| Error::EncryptionFailure(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

#[cfg(test)]
pub(crate) fn test_params() -> KdfParams {
    KdfParams {
        memory_cost: 8,
        time_cost: 1,
        parallelism: 1,
    }
}
