//! Password-based AES-256-CBC encryption of whole payloads.
//!
//! Every blob is laid out as `salt (16) || iv (16) || ciphertext`, where the
//! ciphertext carries PKCS#7 padding. There is no authentication tag: a
//! wrong password is detected only through invalid padding, so callers that
//! need tamper detection must compare checksums of the plaintext.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::kdf::{derive_key, KdfParams};
use crate::keys::{Iv, MasterKey, Salt, IV_LENGTH, SALT_LENGTH};
use capsule_common::{Error, Result};

pub(crate) type Aes256CbcEnc = cbc::Encryptor<Aes256>;
pub(crate) type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Bytes written in front of every ciphertext (salt then IV).
pub const BLOB_PREFIX_LEN: usize = SALT_LENGTH + IV_LENGTH;

/// Length of the blob produced for `plain_len` bytes of plaintext.
///
/// PKCS#7 always appends between 1 and 16 bytes, so the result depends only
/// on the plaintext length.
pub fn encrypted_len(plain_len: u64) -> u64 {
    let block = BLOCK_SIZE as u64;
    BLOB_PREFIX_LEN as u64 + (plain_len / block + 1) * block
}

pub(crate) fn encryptor(key: &MasterKey, iv: &Iv) -> Result<Aes256CbcEnc> {
    Aes256CbcEnc::new_from_slices(key.as_bytes(), iv.as_bytes())
        .map_err(|e| Error::EncryptionFailure(format!("Cipher setup failed: {}", e)))
}

pub(crate) fn decryptor(key: &MasterKey, iv: &Iv) -> Result<Aes256CbcDec> {
    Aes256CbcDec::new_from_slices(key.as_bytes(), iv.as_bytes())
        .map_err(|e| Error::DecryptionFailure(format!("Cipher setup failed: {}", e)))
}

/// Split a blob into its salt, IV and ciphertext.
///
/// # Errors
/// - Returns `DecryptionFailure` if the blob is shorter than the prefix
pub fn split_blob(blob: &[u8]) -> Result<(Salt, Iv, &[u8])> {
    if blob.len() < BLOB_PREFIX_LEN {
        return Err(Error::DecryptionFailure(format!(
            "Blob too short: {} bytes",
            blob.len()
        )));
    }
    let mut salt = [0u8; SALT_LENGTH];
    let mut iv = [0u8; IV_LENGTH];
    salt.copy_from_slice(&blob[..SALT_LENGTH]);
    iv.copy_from_slice(&blob[SALT_LENGTH..BLOB_PREFIX_LEN]);
    Ok((Salt(salt), Iv(iv), &blob[BLOB_PREFIX_LEN..]))
}

/// Encrypt plaintext under an already derived key. Returns the ciphertext only.
pub fn encrypt_with_key(key: &MasterKey, iv: &Iv, plaintext: &[u8]) -> Result<Vec<u8>> {
    Ok(encryptor(key, iv)?.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt ciphertext under an already derived key and strip the padding.
pub fn decrypt_with_key(key: &MasterKey, iv: &Iv, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(Error::DecryptionFailure(format!(
            "Ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            BLOCK_SIZE
        )));
    }
    decryptor(key, iv)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::DecryptionFailure("Invalid padding (wrong password?)".to_string()))
}

/// Encrypt plaintext with a password.
///
/// # Postconditions
/// - Returns `salt || iv || ciphertext` with a fresh random salt and IV
/// - Output length equals `encrypted_len(plaintext.len())`
///
/// # Errors
/// - Empty password
/// - Unexpected KDF or cipher faults
pub fn encrypt(plaintext: &[u8], password: &[u8], params: &KdfParams) -> Result<Vec<u8>> {
    let salt = Salt::generate();
    let iv = Iv::generate();
    let key = derive_key(password, &salt, params)?;
    let ciphertext = encrypt_with_key(&key, &iv, plaintext)?;

    let mut blob = Vec::with_capacity(BLOB_PREFIX_LEN + ciphertext.len());
    blob.extend_from_slice(salt.as_bytes());
    blob.extend_from_slice(iv.as_bytes());
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a blob produced by [`encrypt`].
///
/// # Errors
/// - `DecryptionFailure` for a wrong password or a malformed blob
pub fn decrypt(blob: &[u8], password: &[u8], params: &KdfParams) -> Result<Vec<u8>> {
    let (salt, iv, ciphertext) = split_blob(blob)?;
    let key = derive_key(password, &salt, params)?;
    decrypt_with_key(&key, &iv, ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::test_params;
    use crate::keys::KEY_LENGTH;
    use proptest::prelude::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let params = test_params();
        let blob = encrypt(b"Hello, World!", b"pw", &params).unwrap();
        let plain = decrypt(&blob, b"pw", &params).unwrap();
        assert_eq!(plain, b"Hello, World!");
    }

    #[test]
    fn test_blob_size() {
        let params = test_params();
        for len in [0usize, 1, 15, 16, 17, 100] {
            let data = vec![0x5Au8; len];
            let blob = encrypt(&data, b"pw", &params).unwrap();
            assert_eq!(blob.len() as u64, encrypted_len(len as u64));
        }
    }

    #[test]
    fn test_fresh_salt_and_iv_each_time() {
        let params = test_params();
        let a = encrypt(b"same", b"pw", &params).unwrap();
        let b = encrypt(b"same", b"pw", &params).unwrap();
        assert_ne!(&a[..BLOB_PREFIX_LEN], &b[..BLOB_PREFIX_LEN]);
    }

    #[test]
    fn test_wrong_key_fails_padding() {
        let iv = Iv::from_bytes([3u8; IV_LENGTH]);
        let good = MasterKey::from_bytes([1u8; KEY_LENGTH]);
        let bad = MasterKey::from_bytes([2u8; KEY_LENGTH]);
        let ct = encrypt_with_key(&good, &iv, b"Secret data that spans two blocks").unwrap();

        // A wrong key only passes the padding check by accident; this key
        // and IV are fixed so the outcome is deterministic.
        match decrypt_with_key(&bad, &iv, &ct) {
            Err(e) => assert!(e.is_recoverable()),
            Ok(plain) => assert_ne!(plain, b"Secret data that spans two blocks"),
        }
    }

    #[test]
    fn test_short_blob_rejected() {
        let err = decrypt(&[0u8; 20], b"pw", &test_params()).unwrap_err();
        assert!(matches!(err, Error::DecryptionFailure(_)));
    }

    #[test]
    fn test_unaligned_ciphertext_rejected() {
        let key = MasterKey::from_bytes([1u8; KEY_LENGTH]);
        let iv = Iv::from_bytes([0u8; IV_LENGTH]);
        assert!(decrypt_with_key(&key, &iv, &[0u8; 17]).is_err());
        assert!(decrypt_with_key(&key, &iv, &[]).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..512),
                          password in "[a-zA-Z0-9]{1,24}") {
            let params = test_params();
            let blob = encrypt(&data, password.as_bytes(), &params).unwrap();
            prop_assert_eq!(decrypt(&blob, password.as_bytes(), &params).unwrap(), data);
        }
    }
}
