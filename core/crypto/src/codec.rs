//! Configured codec used by the container.
//!
//! Binds KDF parameters, chunk size and checksum truncation together so the
//! container does not thread them through every call.

use std::io::{Read, Write};

use crate::checksum::{checksum, Checksummer};
use crate::cipher;
use crate::kdf::KdfParams;
use crate::stream::{self, StreamSummary, DEFAULT_CHUNK_SIZE};
use capsule_common::{Result, TaskContext};

/// Password-based codec with fixed parameters.
#[derive(Debug, Clone)]
pub struct Codec {
    params: KdfParams,
    chunk_size: usize,
    truncation: u32,
}

/// Outcome of streaming a payload into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Bytes written.
    pub written: u64,
    /// Checksum of the plaintext.
    pub checksum: String,
}

impl Codec {
    pub fn new(params: KdfParams) -> Self {
        Self {
            params,
            chunk_size: DEFAULT_CHUNK_SIZE,
            truncation: crate::checksum::DEFAULT_TRUNCATION,
        }
    }

    /// Set custom chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_truncation(mut self, truncation: u32) -> Self {
        self.truncation = truncation;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    pub fn encrypt(&self, plaintext: &[u8], password: &[u8]) -> Result<Vec<u8>> {
        cipher::encrypt(plaintext, password, &self.params)
    }

    pub fn decrypt(&self, blob: &[u8], password: &[u8]) -> Result<Vec<u8>> {
        cipher::decrypt(blob, password, &self.params)
    }

    pub fn checksum(&self, data: &[u8]) -> String {
        checksum(data, self.truncation)
    }

    /// Size on disk of a payload of `plain_len` bytes.
    pub fn stored_len(&self, plain_len: u64, encrypted: bool) -> u64 {
        if encrypted {
            cipher::encrypted_len(plain_len)
        } else {
            plain_len
        }
    }

    /// Stream `len` plaintext bytes into `writer`, encrypted or verbatim.
    pub fn seal_stream<R: Read, W: Write>(
        &self,
        reader: R,
        len: u64,
        writer: W,
        password: &[u8],
        encrypted: bool,
        ctx: &TaskContext,
    ) -> Result<Sealed> {
        let mut summer = Checksummer::new();
        let StreamSummary { bytes_out, .. } = if encrypted {
            stream::encrypt_stream(
                reader,
                len,
                writer,
                password,
                &self.params,
                self.chunk_size,
                &mut summer,
                ctx,
            )?
        } else {
            stream::copy_stream(reader, len, writer, self.chunk_size, &mut summer, ctx)?
        };
        Ok(Sealed {
            written: bytes_out,
            checksum: summer.finalize(self.truncation),
        })
    }

    /// Stream a stored payload of `len` bytes back to plaintext.
    ///
    /// Returns the plaintext length and its checksum.
    pub fn open_stream<R: Read, W: Write>(
        &self,
        reader: R,
        len: u64,
        writer: W,
        password: &[u8],
        encrypted: bool,
        ctx: &TaskContext,
    ) -> Result<Sealed> {
        let mut summer = Checksummer::new();
        let StreamSummary { bytes_out, .. } = if encrypted {
            stream::decrypt_stream(
                reader,
                len,
                writer,
                password,
                &self.params,
                self.chunk_size,
                &mut summer,
                ctx,
            )?
        } else {
            stream::copy_stream(reader, len, writer, self.chunk_size, &mut summer, ctx)?
        };
        Ok(Sealed {
            written: bytes_out,
            checksum: summer.finalize(self.truncation),
        })
    }

    /// Re-encrypt a stored blob of `len` bytes from `old_password` to
    /// `new_password`. The checksum is of the plaintext.
    pub fn reseal_stream<R: Read, W: Write>(
        &self,
        reader: R,
        len: u64,
        writer: W,
        old_password: &[u8],
        new_password: &[u8],
        ctx: &TaskContext,
    ) -> Result<Sealed> {
        let mut summer = Checksummer::new();
        let StreamSummary { bytes_out, .. } = stream::reseal_stream(
            reader,
            len,
            writer,
            old_password,
            new_password,
            &self.params,
            self.chunk_size,
            &mut summer,
            ctx,
        )?;
        Ok(Sealed {
            written: bytes_out,
            checksum: summer.finalize(self.truncation),
        })
    }
}
