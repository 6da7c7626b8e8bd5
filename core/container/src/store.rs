//! Byte stores that can back a container.
//!
//! A container is a single seekable blob. The [`ContainerStore`] trait is the
//! seam between the container logic and where the bytes live: a local file in
//! production, an in-memory buffer in tests. The free functions here move the
//! tail of a store forward or backward when bytes are inserted or removed in
//! the middle.

use std::cell::{RefCell, RefMut};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use capsule_common::{Error, Result};

/// Buffer size used when moving bytes inside a store.
const COPY_BUFFER: usize = 1024 * 1024;

/// A seekable, resizable byte store.
pub trait ContainerStore: Read + Write + Seek {
    /// Current length in bytes.
    fn byte_len(&mut self) -> Result<u64>;

    /// Grow (zero-filled) or shrink the store to exactly `len` bytes.
    fn truncate_to(&mut self, len: u64) -> Result<()>;
}

impl ContainerStore for File {
    fn byte_len(&mut self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> Result<()> {
        File::set_len(self, len)?;
        Ok(())
    }
}

/// In-memory store.
///
/// Useful for testing and development. All data is lost on drop.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Cursor<Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            inner: Cursor::new(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.get_ref()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_inner()
    }
}

impl Read for MemoryStore {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for MemoryStore {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for MemoryStore {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl ContainerStore for MemoryStore {
    fn byte_len(&mut self) -> Result<u64> {
        Ok(self.inner.get_ref().len() as u64)
    }

    fn truncate_to(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| Error::InvalidInput(format!("Length {} exceeds memory", len)))?;
        self.inner.get_mut().resize(len, 0);
        Ok(())
    }
}

/// Read `len` bytes starting at `start`.
pub fn read_range<S: ContainerStore + ?Sized>(store: &mut S, start: u64, len: u64) -> Result<Vec<u8>> {
    let total = store.byte_len()?;
    if start.checked_add(len).map_or(true, |end| end > total) {
        return Err(Error::SizeMismatch {
            expected: start.saturating_add(len),
            actual: total,
        });
    }
    let mut buf = vec![0u8; len as usize];
    store.seek(SeekFrom::Start(start))?;
    store.read_exact(&mut buf)?;
    Ok(buf)
}

/// Overwrite bytes at `offset`.
pub fn write_at<S: ContainerStore + ?Sized>(store: &mut S, offset: u64, bytes: &[u8]) -> Result<()> {
    store.seek(SeekFrom::Start(offset))?;
    store.write_all(bytes)?;
    Ok(())
}

/// Append bytes at the end of the store and return the offset they start at.
pub fn append<S: ContainerStore + ?Sized>(store: &mut S, bytes: &[u8]) -> Result<u64> {
    let offset = store.seek(SeekFrom::End(0))?;
    store.write_all(bytes)?;
    Ok(offset)
}

/// Open a zero-filled gap of `n` bytes at `at`, moving everything after it forward.
///
/// # Errors
/// - `InvalidInput` if `at` lies beyond the end of the store
pub fn insert_gap<S: ContainerStore + ?Sized>(store: &mut S, at: u64, n: u64) -> Result<()> {
    let old_len = store.byte_len()?;
    if at > old_len {
        return Err(Error::InvalidInput(format!(
            "Insert point {} beyond end of store ({} bytes)",
            at, old_len
        )));
    }
    if n == 0 {
        return Ok(());
    }
    store.truncate_to(old_len + n)?;

    // Walk the tail from its end so no byte is overwritten before it is moved.
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut remaining = old_len - at;
    while remaining > 0 {
        let step = remaining.min(COPY_BUFFER as u64);
        let src = at + remaining - step;
        store.seek(SeekFrom::Start(src))?;
        store.read_exact(&mut buf[..step as usize])?;
        store.seek(SeekFrom::Start(src + n))?;
        store.write_all(&buf[..step as usize])?;
        remaining -= step;
    }

    zero_fill(store, at, n)
}

/// Delete `n` bytes at `at`, moving everything after them back.
pub fn remove_range<S: ContainerStore + ?Sized>(store: &mut S, at: u64, n: u64) -> Result<()> {
    let old_len = store.byte_len()?;
    if at.checked_add(n).map_or(true, |end| end > old_len) {
        return Err(Error::InvalidInput(format!(
            "Range {}+{} beyond end of store ({} bytes)",
            at, n, old_len
        )));
    }
    if n == 0 {
        return Ok(());
    }

    let mut buf = vec![0u8; COPY_BUFFER];
    let mut src = at + n;
    while src < old_len {
        let step = (old_len - src).min(COPY_BUFFER as u64);
        store.seek(SeekFrom::Start(src))?;
        store.read_exact(&mut buf[..step as usize])?;
        store.seek(SeekFrom::Start(src - n))?;
        store.write_all(&buf[..step as usize])?;
        src += step;
    }

    store.truncate_to(old_len - n)
}

/// Overwrite `n` bytes at `at` with zeros.
pub fn zero_fill<S: ContainerStore + ?Sized>(store: &mut S, at: u64, n: u64) -> Result<()> {
    let zeros = vec![0u8; COPY_BUFFER.min(n as usize)];
    store.seek(SeekFrom::Start(at))?;
    let mut remaining = n;
    while remaining > 0 {
        let step = remaining.min(zeros.len() as u64) as usize;
        store.write_all(&zeros[..step])?;
        remaining -= step as u64;
    }
    Ok(())
}

/// One store used as both the source and the sink of a streaming pass.
///
/// [`Splice::range`] reads a fixed byte range while [`Splice::tail`] appends
/// at the end; each call repositions the store, so the two can be handed to
/// a codec as an independent reader and writer.
pub struct Splice<'a, S: ?Sized> {
    store: RefCell<&'a mut S>,
}

impl<'a, S: ContainerStore + ?Sized> Splice<'a, S> {
    pub fn new(store: &'a mut S) -> Self {
        Self {
            store: RefCell::new(store),
        }
    }

    fn borrow(&self) -> io::Result<RefMut<'_, &'a mut S>> {
        self.store
            .try_borrow_mut()
            .map_err(|_| io::Error::new(io::ErrorKind::WouldBlock, "store already in use"))
    }

    /// Reader over `[start, start + len)`.
    pub fn range(&self, start: u64, len: u64) -> RangeReader<'_, 'a, S> {
        RangeReader {
            splice: self,
            pos: start,
            end: start.saturating_add(len),
        }
    }

    /// Writer appending at the end of the store.
    pub fn tail(&self) -> TailWriter<'_, 'a, S> {
        TailWriter { splice: self }
    }
}

pub struct RangeReader<'s, 'a, S: ?Sized> {
    splice: &'s Splice<'a, S>,
    pos: u64,
    end: u64,
}

impl<S: ContainerStore + ?Sized> Read for RangeReader<'_, '_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.end || buf.is_empty() {
            return Ok(0);
        }
        let want = (self.end - self.pos).min(buf.len() as u64) as usize;
        let mut store = self.splice.borrow()?;
        store.seek(SeekFrom::Start(self.pos))?;
        let n = store.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

pub struct TailWriter<'s, 'a, S: ?Sized> {
    splice: &'s Splice<'a, S>,
}

impl<S: ContainerStore + ?Sized> Write for TailWriter<'_, '_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut store = self.splice.borrow()?;
        store.seek(SeekFrom::End(0))?;
        store.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.splice.borrow()?.flush()
    }
}

/// Memory store whose writes fail while positioned at a chosen offset.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FailingStore {
    inner: MemoryStore,
    fail_at: Option<u64>,
}

#[cfg(test)]
impl FailingStore {
    pub(crate) fn wrap(inner: MemoryStore) -> Self {
        Self {
            inner,
            fail_at: None,
        }
    }

    /// Fail every write that starts at `offset`; `None` heals the store.
    pub(crate) fn fail_writes_at(&mut self, offset: Option<u64>) {
        self.fail_at = offset;
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    pub(crate) fn into_inner(self) -> MemoryStore {
        self.inner
    }
}

#[cfg(test)]
impl Read for FailingStore {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

#[cfg(test)]
impl Write for FailingStore {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_at == Some(self.inner.inner.position()) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
impl Seek for FailingStore {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

#[cfg(test)]
impl ContainerStore for FailingStore {
    fn byte_len(&mut self) -> Result<u64> {
        self.inner.byte_len()
    }

    fn truncate_to(&mut self, len: u64) -> Result<()> {
        self.inner.truncate_to(len)
    }
}
