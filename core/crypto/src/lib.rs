//! Cryptographic primitives for Capsule.
//!
//! This module provides:
//! - Key derivation using Argon2id
//! - Password-based AES-256-CBC encryption producing `salt || iv || ciphertext`
//! - Chunked streaming encryption sharing one key and IV per payload
//! - Truncated BLAKE2b checksums
//! - Reversible password recovery tokens
//!
//! # Security Notes
//! - Derived keys are zeroized on drop
//! - No plaintext or key material is ever logged
//! - Blobs carry no authentication tag; integrity relies on checksums

pub mod checksum;
pub mod cipher;
pub mod codec;
pub mod kdf;
pub mod keys;
pub mod recovery;
pub mod stream;

pub use checksum::{checksum, verify_checksum, Checksummer};
pub use cipher::{decrypt, encrypt, encrypted_len};
pub use codec::{Codec, Sealed};
pub use kdf::{derive_key, KdfParams};
pub use keys::{Iv, MasterKey, Salt};
pub use recovery::{password_recovery_token, resolve_token};
pub use stream::{StreamDecryptor, StreamEncryptor, StreamSummary, DEFAULT_CHUNK_SIZE};
