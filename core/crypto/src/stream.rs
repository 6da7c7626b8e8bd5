//! Chunked encryption for payloads too large to hold in memory.
//!
//! A payload is encrypted under one derived key and one IV, and the CBC
//! chain is carried across chunk boundaries. The output is byte-for-byte
//! what [`crate::cipher::encrypt`] would produce for the same salt and IV,
//! so readers never need to know which path wrote a blob.

use std::io::{Read, Write};

use cbc::cipher::{
    block_padding::Pkcs7, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut,
};
use tracing::debug;

use crate::checksum::Checksummer;
use crate::cipher::{
    decryptor, encryptor, Aes256CbcDec, Aes256CbcEnc, BLOB_PREFIX_LEN, BLOCK_SIZE,
};
use crate::kdf::{derive_key, KdfParams};
use crate::keys::{Iv, MasterKey, Salt, IV_LENGTH, SALT_LENGTH};
use capsule_common::{Error, Result, TaskContext};

/// Default chunk size for streaming encryption (50 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 50 * 1024 * 1024;

/// Encrypts a CBC chain incrementally.
pub struct StreamEncryptor {
    cipher: Aes256CbcEnc,
    pending: Vec<u8>,
}

impl StreamEncryptor {
    pub fn new(key: &MasterKey, iv: &Iv) -> Result<Self> {
        Ok(Self {
            cipher: encryptor(key, iv)?,
            pending: Vec::with_capacity(BLOCK_SIZE),
        })
    }

    /// Encrypt every complete block available and append it to `out`.
    /// A partial trailing block is held back for the next call.
    pub fn update(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);
        let whole = self.pending.len() / BLOCK_SIZE * BLOCK_SIZE;
        for block in self.pending[..whole].chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out.extend_from_slice(&self.pending[..whole]);
        self.pending.drain(..whole);
    }

    /// Pad and encrypt whatever remains.
    pub fn finalize(self, out: &mut Vec<u8>) {
        let Self { cipher, pending } = self;
        out.extend_from_slice(&cipher.encrypt_padded_vec_mut::<Pkcs7>(&pending));
    }
}

/// Decrypts a CBC chain incrementally.
///
/// The final block is always held back until [`StreamDecryptor::finalize`]
/// so the padding can be checked and stripped.
pub struct StreamDecryptor {
    cipher: Aes256CbcDec,
    pending: Vec<u8>,
}

impl StreamDecryptor {
    pub fn new(key: &MasterKey, iv: &Iv) -> Result<Self> {
        Ok(Self {
            cipher: decryptor(key, iv)?,
            pending: Vec::with_capacity(BLOCK_SIZE * 2),
        })
    }

    pub fn update(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);
        let mut blocks = self.pending.len() / BLOCK_SIZE;
        if blocks > 0 && self.pending.len() % BLOCK_SIZE == 0 {
            blocks -= 1;
        }
        let ready = blocks * BLOCK_SIZE;
        for block in self.pending[..ready].chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out.extend_from_slice(&self.pending[..ready]);
        self.pending.drain(..ready);
    }

    /// Decrypt the held-back block and remove the padding.
    ///
    /// # Errors
    /// - `DecryptionFailure` if the ciphertext was not block aligned or the
    ///   padding is invalid
    pub fn finalize(self, out: &mut Vec<u8>) -> Result<()> {
        let Self { cipher, pending } = self;
        if pending.len() != BLOCK_SIZE {
            return Err(Error::DecryptionFailure(
                "Ciphertext is not a whole number of blocks".to_string(),
            ));
        }
        let tail = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&pending)
            .map_err(|_| {
                Error::DecryptionFailure("Invalid padding (wrong password?)".to_string())
            })?;
        out.extend_from_slice(&tail);
        Ok(())
    }
}

/// Counts of a completed streaming pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    /// Bytes consumed from the reader.
    pub bytes_in: u64,
    /// Bytes written to the writer.
    pub bytes_out: u64,
}

/// Fill `buf` from `reader`, stopping early only at end of input.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Read `salt || iv` from the front of a blob and set up its decryptor.
fn open_prefix<R: Read>(reader: &mut R, password: &[u8], params: &KdfParams) -> Result<StreamDecryptor> {
    let mut prefix = [0u8; BLOB_PREFIX_LEN];
    if read_full(reader, &mut prefix)? != BLOB_PREFIX_LEN {
        return Err(Error::DecryptionFailure("Truncated blob prefix".to_string()));
    }
    let mut salt = [0u8; SALT_LENGTH];
    let mut iv = [0u8; IV_LENGTH];
    salt.copy_from_slice(&prefix[..SALT_LENGTH]);
    iv.copy_from_slice(&prefix[SALT_LENGTH..]);
    let key = derive_key(password, &Salt(salt), params)?;
    StreamDecryptor::new(&key, &Iv(iv))
}

fn check_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 || chunk_size % BLOCK_SIZE != 0 {
        return Err(Error::InvalidInput(format!(
            "Chunk size {} must be a positive multiple of {}",
            chunk_size, BLOCK_SIZE
        )));
    }
    Ok(())
}

/// Encrypt exactly `len` bytes from `reader` into `writer`.
///
/// Writes `salt || iv` once, then the ciphertext chunk by chunk. The
/// plaintext is fed to `checksum` as it passes. `ctx` is polled before each
/// chunk and receives the chunk's plaintext length as progress.
///
/// # Errors
/// - `SizeMismatch` if the reader ends before `len` bytes
/// - `Cancelled` if the context was cancelled between chunks
/// - I/O errors from reader or writer
#[allow(clippy::too_many_arguments)]
pub fn encrypt_stream<R: Read, W: Write>(
    reader: R,
    len: u64,
    mut writer: W,
    password: &[u8],
    params: &KdfParams,
    chunk_size: usize,
    checksum: &mut Checksummer,
    ctx: &TaskContext,
) -> Result<StreamSummary> {
    check_chunk_size(chunk_size)?;
    let salt = Salt::generate();
    let iv = Iv::generate();
    let key = derive_key(password, &salt, params)?;

    writer.write_all(salt.as_bytes())?;
    writer.write_all(iv.as_bytes())?;

    let mut reader = reader.take(len);
    let mut encryptor = StreamEncryptor::new(&key, &iv)?;
    let mut buffer = vec![0u8; chunk_size];
    let mut out = Vec::with_capacity(chunk_size + BLOCK_SIZE);
    let mut bytes_in = 0u64;
    let mut bytes_out = BLOB_PREFIX_LEN as u64;

    loop {
        ctx.checkpoint()?;
        let n = read_full(&mut reader, &mut buffer)?;
        if n == 0 {
            break;
        }
        checksum.update(&buffer[..n]);
        out.clear();
        encryptor.update(&buffer[..n], &mut out);
        writer.write_all(&out)?;
        bytes_in += n as u64;
        bytes_out += out.len() as u64;
        ctx.report(n as u64);
    }

    if bytes_in != len {
        return Err(Error::SizeMismatch {
            expected: len,
            actual: bytes_in,
        });
    }

    out.clear();
    encryptor.finalize(&mut out);
    writer.write_all(&out)?;
    bytes_out += out.len() as u64;
    writer.flush()?;

    debug!(bytes_in, bytes_out, "Stream encrypted");
    Ok(StreamSummary { bytes_in, bytes_out })
}

/// Decrypt a `len`-byte blob from `reader` into `writer`.
///
/// `checksum` receives the recovered plaintext.
///
/// # Errors
/// - `DecryptionFailure` for a wrong password or malformed blob
/// - `Cancelled` if the context was cancelled between chunks
#[allow(clippy::too_many_arguments)]
pub fn decrypt_stream<R: Read, W: Write>(
    reader: R,
    len: u64,
    mut writer: W,
    password: &[u8],
    params: &KdfParams,
    chunk_size: usize,
    checksum: &mut Checksummer,
    ctx: &TaskContext,
) -> Result<StreamSummary> {
    check_chunk_size(chunk_size)?;
    if len < (BLOB_PREFIX_LEN + BLOCK_SIZE) as u64 {
        return Err(Error::DecryptionFailure(format!("Blob too short: {} bytes", len)));
    }

    let mut reader = reader.take(len);
    let mut decryptor = open_prefix(&mut reader, password, params)?;
    let mut buffer = vec![0u8; chunk_size];
    let mut out = Vec::with_capacity(chunk_size + BLOCK_SIZE);
    let mut bytes_in = BLOB_PREFIX_LEN as u64;
    let mut bytes_out = 0u64;

    loop {
        ctx.checkpoint()?;
        let n = read_full(&mut reader, &mut buffer)?;
        if n == 0 {
            break;
        }
        out.clear();
        decryptor.update(&buffer[..n], &mut out);
        checksum.update(&out);
        writer.write_all(&out)?;
        bytes_in += n as u64;
        bytes_out += out.len() as u64;
        ctx.report(n as u64);
    }

    if bytes_in != len {
        return Err(Error::SizeMismatch {
            expected: len,
            actual: bytes_in,
        });
    }

    out.clear();
    decryptor.finalize(&mut out)?;
    checksum.update(&out);
    writer.write_all(&out)?;
    bytes_out += out.len() as u64;
    writer.flush()?;

    debug!(bytes_in, bytes_out, "Stream decrypted");
    Ok(StreamSummary { bytes_in, bytes_out })
}

/// Re-encrypt a `len`-byte blob under a new password without materializing
/// the plaintext beyond one chunk.
///
/// A fresh salt and IV are drawn for the output. `checksum` receives the
/// plaintext as it passes.
///
/// # Errors
/// - `DecryptionFailure` if `old_password` does not open the blob
/// - `Cancelled` if the context was cancelled between chunks
#[allow(clippy::too_many_arguments)]
pub fn reseal_stream<R: Read, W: Write>(
    reader: R,
    len: u64,
    mut writer: W,
    old_password: &[u8],
    new_password: &[u8],
    params: &KdfParams,
    chunk_size: usize,
    checksum: &mut Checksummer,
    ctx: &TaskContext,
) -> Result<StreamSummary> {
    check_chunk_size(chunk_size)?;
    if len < (BLOB_PREFIX_LEN + BLOCK_SIZE) as u64 {
        return Err(Error::DecryptionFailure(format!("Blob too short: {} bytes", len)));
    }

    let mut reader = reader.take(len);
    let mut decryptor = open_prefix(&mut reader, old_password, params)?;

    let salt = Salt::generate();
    let iv = Iv::generate();
    let key = derive_key(new_password, &salt, params)?;
    let mut encryptor = StreamEncryptor::new(&key, &iv)?;
    writer.write_all(salt.as_bytes())?;
    writer.write_all(iv.as_bytes())?;

    let mut buffer = vec![0u8; chunk_size];
    let mut plain = Vec::with_capacity(chunk_size + BLOCK_SIZE);
    let mut out = Vec::with_capacity(chunk_size + BLOCK_SIZE * 2);
    let mut bytes_in = BLOB_PREFIX_LEN as u64;
    let mut bytes_out = BLOB_PREFIX_LEN as u64;

    loop {
        ctx.checkpoint()?;
        let n = read_full(&mut reader, &mut buffer)?;
        if n == 0 {
            break;
        }
        plain.clear();
        out.clear();
        decryptor.update(&buffer[..n], &mut plain);
        checksum.update(&plain);
        encryptor.update(&plain, &mut out);
        writer.write_all(&out)?;
        bytes_in += n as u64;
        bytes_out += out.len() as u64;
        ctx.report(n as u64);
    }

    if bytes_in != len {
        return Err(Error::SizeMismatch {
            expected: len,
            actual: bytes_in,
        });
    }

    plain.clear();
    out.clear();
    decryptor.finalize(&mut plain)?;
    checksum.update(&plain);
    encryptor.update(&plain, &mut out);
    encryptor.finalize(&mut out);
    writer.write_all(&out)?;
    bytes_out += out.len() as u64;
    writer.flush()?;

    debug!(bytes_in, bytes_out, "Stream resealed");
    Ok(StreamSummary { bytes_in, bytes_out })
}

/// Copy exactly `len` bytes unchanged, chunk by chunk.
///
/// Used for payloads stored without encryption; shares the checksum,
/// cancellation and progress behaviour of the encrypted paths.
pub fn copy_stream<R: Read, W: Write>(
    reader: R,
    len: u64,
    mut writer: W,
    chunk_size: usize,
    checksum: &mut Checksummer,
    ctx: &TaskContext,
) -> Result<StreamSummary> {
    if chunk_size == 0 {
        return Err(Error::InvalidInput("Chunk size must be positive".to_string()));
    }
    let mut reader = reader.take(len);
    let mut buffer = vec![0u8; chunk_size];
    let mut copied = 0u64;

    loop {
        ctx.checkpoint()?;
        let n = read_full(&mut reader, &mut buffer)?;
        if n == 0 {
            break;
        }
        checksum.update(&buffer[..n]);
        writer.write_all(&buffer[..n])?;
        copied += n as u64;
        ctx.report(n as u64);
    }

    if copied != len {
        return Err(Error::SizeMismatch {
            expected: len,
            actual: copied,
        });
    }
    writer.flush()?;
    Ok(StreamSummary {
        bytes_in: copied,
        bytes_out: copied,
    })
}
