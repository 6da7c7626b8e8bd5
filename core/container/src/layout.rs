//! Section layout of a container file.
//!
//! ```text
//! HEADER-START | encrypted header | HEADER-PAD | padding | HEADER-END
//! payload region ...
//! LOG-START | encrypted footer | LOG-END
//! ```
//!
//! Markers are eight ASCII bytes XORed with a static key. The key is not a
//! secret; it only keeps the markers from appearing verbatim in the file.
//! All payload offsets stored in the header are absolute offsets into the
//! container, so anything that moves the payload region must rebase them.

use std::io::SeekFrom;

use tracing::debug;

use crate::store::{self, ContainerStore};
use capsule_common::{Error, Result};

/// Length of every section marker.
pub const MARKER_LEN: u64 = 8;

const MARKER_KEY: [u8; 8] = [0x9b, 0x2f, 0xe4, 0x71, 0x0d, 0xc8, 0x56, 0xa3];

/// Bytes read per step while scanning for a marker.
const SCAN_BUFFER: usize = 64 * 1024;

/// Section markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    HeaderStart,
    HeaderPad,
    HeaderEnd,
    LogStart,
    LogEnd,
}

impl Marker {
    fn plain(self) -> &'static [u8; 8] {
        match self {
            Marker::HeaderStart => b"CPSLHDR<",
            Marker::HeaderPad => b"CPSLPAD|",
            Marker::HeaderEnd => b"CPSLHDR>",
            Marker::LogStart => b"CPSLLOG<",
            Marker::LogEnd => b"CPSLLOG>",
        }
    }

    /// The obfuscated bytes as they appear on disk.
    pub fn bytes(self) -> [u8; 8] {
        let mut out = *self.plain();
        for (b, k) in out.iter_mut().zip(MARKER_KEY.iter()) {
            *b ^= k;
        }
        out
    }

    pub fn name(self) -> &'static str {
        match self {
            Marker::HeaderStart => "HEADER-START",
            Marker::HeaderPad => "HEADER-PAD",
            Marker::HeaderEnd => "HEADER-END",
            Marker::LogStart => "LOG-START",
            Marker::LogEnd => "LOG-END",
        }
    }
}

/// Find the first occurrence of `marker` in `[from, to)`.
pub fn find_magic<S: ContainerStore + ?Sized>(
    store: &mut S,
    marker: Marker,
    from: u64,
    to: u64,
) -> Result<Option<u64>> {
    let needle = marker.bytes();
    let overlap = needle.len() - 1;
    let mut buf = vec![0u8; SCAN_BUFFER];
    let mut pos = from;

    while pos + MARKER_LEN <= to {
        let want = ((to - pos) as usize).min(SCAN_BUFFER);
        store.seek(SeekFrom::Start(pos))?;
        store.read_exact(&mut buf[..want])?;
        if let Some(i) = buf[..want].windows(needle.len()).position(|w| w == needle) {
            return Ok(Some(pos + i as u64));
        }
        if want < SCAN_BUFFER {
            break;
        }
        pos += (want - overlap) as u64;
    }
    Ok(None)
}

/// Find the last occurrence of `marker` in `[from, to)`.
pub fn rfind_magic<S: ContainerStore + ?Sized>(
    store: &mut S,
    marker: Marker,
    from: u64,
    to: u64,
) -> Result<Option<u64>> {
    let needle = marker.bytes();
    let overlap = needle.len() as u64 - 1;
    let mut buf = vec![0u8; SCAN_BUFFER];
    let mut end = to;

    while end >= from + MARKER_LEN {
        let start = end.saturating_sub(SCAN_BUFFER as u64).max(from);
        let want = (end - start) as usize;
        store.seek(SeekFrom::Start(start))?;
        store.read_exact(&mut buf[..want])?;
        if let Some(i) = buf[..want].windows(needle.len()).rposition(|w| w == needle) {
            return Ok(Some(start + i as u64));
        }
        if start == from {
            break;
        }
        end = start + overlap;
    }
    Ok(None)
}

/// Marker offsets of the header region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    /// Offset of the HEADER-PAD marker.
    pub pad_marker: u64,
    /// Offset of the HEADER-END marker.
    pub end_marker: u64,
}

impl HeaderLayout {
    /// Scan the store for the header markers.
    ///
    /// # Errors
    /// - `MarkerNotFound` if any of the three header markers is missing
    pub fn locate<S: ContainerStore + ?Sized>(store: &mut S) -> Result<Self> {
        let len = store.byte_len()?;
        if len < MARKER_LEN * 3 {
            return Err(Error::MarkerNotFound(format!(
                "{} (store is only {} bytes)",
                Marker::HeaderStart.name(),
                len
            )));
        }
        let mut start = [0u8; MARKER_LEN as usize];
        store.seek(SeekFrom::Start(0))?;
        store.read_exact(&mut start)?;
        if start != Marker::HeaderStart.bytes() {
            return Err(Error::MarkerNotFound(Marker::HeaderStart.name().to_string()));
        }

        let pad_marker = find_magic(store, Marker::HeaderPad, MARKER_LEN, len)?
            .ok_or_else(|| Error::MarkerNotFound(Marker::HeaderPad.name().to_string()))?;
        let end_marker = find_magic(store, Marker::HeaderEnd, pad_marker + MARKER_LEN, len)?
            .ok_or_else(|| Error::MarkerNotFound(Marker::HeaderEnd.name().to_string()))?;

        Ok(Self {
            pad_marker,
            end_marker,
        })
    }

    /// Bytes of the encrypted header currently on disk.
    pub fn slot_len(&self) -> u64 {
        self.pad_marker - MARKER_LEN
    }

    /// Padding bytes between HEADER-PAD and HEADER-END.
    pub fn padding(&self) -> u64 {
        self.end_marker - (self.pad_marker + MARKER_LEN)
    }

    /// Room available for an encrypted header plus its HEADER-PAD marker.
    pub fn capacity(&self) -> u64 {
        self.end_marker - MARKER_LEN
    }

    /// Total size of the header region; also where the payload region begins.
    pub fn region_len(&self) -> u64 {
        self.end_marker + MARKER_LEN
    }

    /// First byte after the HEADER-PAD marker.
    pub fn pad_start(&self) -> u64 {
        self.pad_marker + MARKER_LEN
    }
}

/// Read the encrypted header bytes.
pub fn read_header_blob<S: ContainerStore + ?Sized>(
    store: &mut S,
    layout: &HeaderLayout,
) -> Result<Vec<u8>> {
    store::read_range(store, MARKER_LEN, layout.slot_len())
}

/// Write a complete header region of exactly `region_len` bytes at offset 0.
///
/// Anything between the new HEADER-PAD marker and HEADER-END is zeroed,
/// which also wipes a stale HEADER-PAD marker left by a larger header.
///
/// # Errors
/// - `InvalidInput` if the blob and three markers do not fit
pub fn write_header_region<S: ContainerStore + ?Sized>(
    store: &mut S,
    blob: &[u8],
    region_len: u64,
) -> Result<HeaderLayout> {
    let needed = blob.len() as u64 + MARKER_LEN * 3;
    if needed > region_len {
        return Err(Error::InvalidInput(format!(
            "Header of {} bytes does not fit a {}-byte region",
            blob.len(),
            region_len
        )));
    }
    let pad_marker = MARKER_LEN + blob.len() as u64;
    let end_marker = region_len - MARKER_LEN;

    store::write_at(store, 0, &Marker::HeaderStart.bytes())?;
    store::write_at(store, MARKER_LEN, blob)?;
    store::write_at(store, pad_marker, &Marker::HeaderPad.bytes())?;
    store::zero_fill(store, pad_marker + MARKER_LEN, end_marker - pad_marker - MARKER_LEN)?;
    store::write_at(store, end_marker, &Marker::HeaderEnd.bytes())?;

    debug!(blob_len = blob.len(), region_len, "Header region written");
    Ok(HeaderLayout {
        pad_marker,
        end_marker,
    })
}

/// Marker offsets of the trailing footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FooterLayout {
    pub start_marker: u64,
    pub end_marker: u64,
}

impl FooterLayout {
    pub fn blob_len(&self) -> u64 {
        self.end_marker - self.start_marker - MARKER_LEN
    }
}

/// Locate the footer at the end of the store, if one was committed.
///
/// A store that does not end in LOG-END has no footer. A LOG-END without a
/// matching LOG-START is corruption.
pub fn locate_footer<S: ContainerStore + ?Sized>(
    store: &mut S,
    payload_start: u64,
) -> Result<Option<FooterLayout>> {
    let len = store.byte_len()?;
    if len < payload_start + MARKER_LEN * 2 {
        return Ok(None);
    }
    let end_marker = len - MARKER_LEN;
    let mut tail = [0u8; MARKER_LEN as usize];
    store.seek(SeekFrom::Start(end_marker))?;
    store.read_exact(&mut tail)?;
    if tail != Marker::LogEnd.bytes() {
        return Ok(None);
    }

    let start_marker = rfind_magic(store, Marker::LogStart, payload_start, end_marker)?
        .ok_or_else(|| Error::MarkerNotFound(Marker::LogStart.name().to_string()))?;
    Ok(Some(FooterLayout {
        start_marker,
        end_marker,
    }))
}

pub fn read_footer_blob<S: ContainerStore + ?Sized>(
    store: &mut S,
    layout: &FooterLayout,
) -> Result<Vec<u8>> {
    store::read_range(store, layout.start_marker + MARKER_LEN, layout.blob_len())
}

/// Drop the footer in one shot by truncating at LOG-START.
pub fn remove_footer<S: ContainerStore + ?Sized>(store: &mut S, layout: &FooterLayout) -> Result<()> {
    store.truncate_to(layout.start_marker)?;
    debug!(at = layout.start_marker, "Footer removed");
    Ok(())
}

/// Append `LOG-START | blob | LOG-END` at the end of the store.
pub fn append_footer<S: ContainerStore + ?Sized>(store: &mut S, blob: &[u8]) -> Result<FooterLayout> {
    let start_marker = store::append(store, &Marker::LogStart.bytes())?;
    store::append(store, blob)?;
    let end_marker = store::append(store, &Marker::LogEnd.bytes())?;
    Ok(FooterLayout {
        start_marker,
        end_marker,
    })
}
