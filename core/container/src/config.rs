//! Container configuration.

use serde::{Deserialize, Serialize};

use capsule_common::{Error, Result};
use capsule_crypto::{Codec, KdfParams, DEFAULT_CHUNK_SIZE};

/// Largest note payload accepted (7 MiB).
pub const DEFAULT_MAX_NOTE_SIZE: u64 = 7 * 1024 * 1024;

/// Minimum padding added whenever the header region grows (4 KiB).
pub const DEFAULT_MIN_PADDING: u64 = 4 * 1024;

/// Default checksum truncation factor.
pub const DEFAULT_CHECKSUM_TRUNCATION: u32 = 4;

/// Tunables for opening and writing a container.
///
/// None of these values are stored in the container itself. A container
/// must be reopened with the same `kdf_params` it was written with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Chunk size for streaming encryption. Must be a multiple of 16.
    pub chunk_size: usize,
    /// Largest note payload, in bytes.
    pub max_note_size: u64,
    /// Padding added to the header region on every growth.
    pub min_padding: u64,
    /// Checksum truncation factor.
    pub checksum_truncation: u32,
    /// KDF parameters.
    pub kdf_params: KdfParams,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_note_size: DEFAULT_MAX_NOTE_SIZE,
            min_padding: DEFAULT_MIN_PADDING,
            checksum_truncation: DEFAULT_CHECKSUM_TRUNCATION,
            kdf_params: KdfParams::default(),
        }
    }
}

impl ContainerConfig {
    /// Check the configuration for values the container cannot work with.
    ///
    /// # Errors
    /// - Chunk size zero or not block aligned
    /// - Zero padding
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size % 16 != 0 {
            return Err(Error::InvalidInput(format!(
                "chunk_size {} must be a positive multiple of 16",
                self.chunk_size
            )));
        }
        if self.min_padding == 0 {
            return Err(Error::InvalidInput("min_padding must be positive".to_string()));
        }
        if self.max_note_size == 0 {
            return Err(Error::InvalidInput("max_note_size must be positive".to_string()));
        }
        Ok(())
    }

    /// Build the codec these settings describe.
    pub fn codec(&self) -> Codec {
        Codec::new(self.kdf_params.clone())
            .with_chunk_size(self.chunk_size)
            .with_truncation(self.checksum_truncation)
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Serialize to bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> ContainerConfig {
    ContainerConfig {
        chunk_size: 64,
        max_note_size: 1024,
        min_padding: 256,
        checksum_truncation: DEFAULT_CHECKSUM_TRUNCATION,
        kdf_params: KdfParams {
            memory_cost: 8,
            time_cost: 1,
            parallelism: 1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ContainerConfig::default();
        assert_eq!(config.chunk_size, 50 * 1024 * 1024);
        assert_eq!(config.max_note_size, 7 * 1024 * 1024);
        assert_eq!(config.min_padding, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unaligned_chunks() {
        let config = ContainerConfig {
            chunk_size: 1000,
            ..ContainerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ContainerConfig::from_json(r#"{"min_padding": 8192}"#).unwrap();
        assert_eq!(config.min_padding, 8192);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_config_serialization() {
        let config = test_config();
        let restored = ContainerConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(restored, config);
        let restored = ContainerConfig::from_bytes(&config.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, config);
    }
}
