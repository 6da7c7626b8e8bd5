//! Header persistence and the resize protocol.
//!
//! `header_size` lives inside the header it measures, so writing a new value
//! can change the serialized length again when the number gains or loses a
//! digit. [`settle_header_size`] resolves this in two passes and treats a
//! third mismatch as corruption. [`persist_header`] then fits the encrypted
//! header into the on-disk slot, growing the header region and rebasing every
//! payload offset when it does not fit.

use tracing::{debug, info, warn};

use crate::layout::{self, HeaderLayout, MARKER_LEN};
use crate::registry::Header;
use crate::shifter;
use crate::store::{self, ContainerStore};
use capsule_common::{Error, Result};
use capsule_crypto::Codec;

fn width(n: i64) -> i64 {
    n.to_string().len() as i64
}

/// Bring `header_size` to the serialized length of the header and return
/// the serialized bytes.
///
/// # Errors
/// - `Integrity` if the length has not settled after the second pass
pub fn settle_header_size(header: &mut Header) -> Result<Vec<u8>> {
    let old = header.vault.header_size as i64;
    let measured = header.to_bytes()?.len() as i64;
    // Only the width of this one field differs between the two serializations.
    let candidate = measured + (width(measured) - width(old));
    header.vault.header_size = candidate.max(0) as u64;

    let mut bytes = header.to_bytes()?;
    if bytes.len() as u64 != header.vault.header_size {
        header.vault.header_size = bytes.len() as u64;
        bytes = header.to_bytes()?;
        if bytes.len() as u64 != header.vault.header_size {
            return Err(Error::Integrity(format!(
                "Header size did not converge: declared {}, serialized {}",
                header.vault.header_size,
                bytes.len()
            )));
        }
    }
    Ok(bytes)
}

/// Where the header ended up after [`persist_header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Persisted {
    pub layout: HeaderLayout,
    /// Bytes inserted into the header region, zero when the slot sufficed.
    pub grown: u64,
}

/// Encrypt `header` and write it over the header region of `store`.
///
/// A header that fits the current slot is written in place and the rest of
/// the region is zeroed, leaving the spare room for later growth. One that
/// does not fit grows the region by the shortfall plus `min_padding`,
/// shifting the payload region forward, rebasing every stored offset, and
/// settling and encrypting a second time before the write.
///
/// # Errors
/// - `MarkerNotFound` if the header region cannot be located
/// - `Integrity` if the header does not fit after growing
/// - Encryption and I/O errors. A failure after growing closes the gap
///   again and restores the offsets.
pub fn persist_header<S: ContainerStore + ?Sized>(
    store: &mut S,
    header: &mut Header,
    codec: &Codec,
    password: &[u8],
    min_padding: u64,
) -> Result<Persisted> {
    let current = HeaderLayout::locate(store)?;
    let plain = settle_header_size(header)?;
    let blob = codec.encrypt(&plain, password)?;

    let needed = blob.len() as u64 + MARKER_LEN;
    if needed <= current.capacity() {
        let layout = layout::write_header_region(store, &blob, current.region_len())?;
        debug!(
            header_size = header.vault.header_size,
            blob_len = blob.len(),
            spare = layout.padding(),
            "Header persisted"
        );
        return Ok(Persisted { layout, grown: 0 });
    }

    let grown = needed - current.capacity() + min_padding;
    let at = current.pad_start();
    let region_len = current.region_len() + grown;
    store::insert_gap(store, at, grown)?;
    shifter::shift_for_insert(&mut header.map, at, grown);
    info!(grown, region_len, "Header region grown");

    match reseal_grown(store, header, codec, password, region_len) {
        Ok(layout) => Ok(Persisted { layout, grown }),
        Err(e) => {
            // Close the gap so the header still on disk matches the payload.
            if let Err(undo) = store::remove_range(store, at, grown) {
                warn!(error = %undo, "Closing the header gap failed");
            }
            shifter::shift_for_removal(&mut header.map, at, grown);
            Err(e)
        }
    }
}

/// Settle and seal a header whose offsets were just rebased, then write it
/// over the grown region.
fn reseal_grown<S: ContainerStore + ?Sized>(
    store: &mut S,
    header: &mut Header,
    codec: &Codec,
    password: &[u8],
    region_len: u64,
) -> Result<HeaderLayout> {
    // Rebased offsets can change digit widths, so settle and seal again.
    let plain = settle_header_size(header)?;
    let blob = codec.encrypt(&plain, password)?;
    if blob.len() as u64 + MARKER_LEN * 3 > region_len {
        return Err(Error::Integrity(format!(
            "Header of {} bytes does not fit the grown {}-byte region",
            blob.len(),
            region_len
        )));
    }
    let layout = layout::write_header_region(store, &blob, region_len)?;
    debug!(
        header_size = header.vault.header_size,
        blob_len = blob.len(),
        spare = layout.padding(),
        "Header persisted"
    );
    Ok(layout)
}

/// Run a multi-step append and trim the store back to its prior length if
/// any step fails.
///
/// # Errors
/// - `RolledBack` carrying the original fault and the outcome of the trim
pub fn with_rollback<S, T, F>(store: &mut S, op: F) -> Result<T>
where
    S: ContainerStore + ?Sized,
    F: FnOnce(&mut S) -> Result<T>,
{
    let original = store.byte_len()?;
    match op(store) {
        Ok(value) => Ok(value),
        Err(cause) => {
            let rollback = match store.truncate_to(original) {
                Ok(()) => format!("container trimmed back to {} bytes", original),
                Err(e) => format!("trimming back to {} bytes failed: {}", original, e),
            };
            Err(Error::rolled_back(cause, rollback))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::registry::tests::{add_dir, file_record};
    use crate::registry::ROOT_DIR;
    use crate::store::MemoryStore;
    use capsule_common::IdKind;

    const PW: &[u8] = b"correct horse";

    /// A store holding an empty header with `slack` spare bytes in its region.
    fn fresh(slack: u64) -> (MemoryStore, Header, Codec) {
        let codec = test_config().codec();
        let mut header = Header::new("vault", "cap", true);
        let plain = settle_header_size(&mut header).unwrap();
        let blob = codec.encrypt(&plain, PW).unwrap();
        let mut store = MemoryStore::new();
        let region_len = blob.len() as u64 + MARKER_LEN * 3 + slack;
        layout::write_header_region(&mut store, &blob, region_len).unwrap();
        (store, header, codec)
    }

    #[test]
    fn test_settle_reaches_fixed_point() {
        let mut header = Header::new("vault", "cap", true);
        for declared in [0u64, 9, 99, 999, 123_456_789] {
            header.vault.header_size = declared;
            let bytes = settle_header_size(&mut header).unwrap();
            assert_eq!(bytes.len() as u64, header.vault.header_size);
            assert_eq!(header.to_bytes().unwrap().len() as u64, header.vault.header_size);
        }
    }

    #[test]
    fn test_persist_in_place() {
        let (mut store, mut header, codec) = fresh(1024);
        let before = store.byte_len().unwrap();
        let persisted = persist_header(&mut store, &mut header, &codec, PW, 256).unwrap();
        assert_eq!(persisted.grown, 0);
        assert_eq!(store.byte_len().unwrap(), before);
        assert_eq!(header.to_bytes().unwrap().len() as u64, header.vault.header_size);

        let located = HeaderLayout::locate(&mut store).unwrap();
        let blob = layout::read_header_blob(&mut store, &located).unwrap();
        let plain = codec.decrypt(&blob, PW).unwrap();
        assert_eq!(plain.len() as u64, header.vault.header_size);
    }

    #[test]
    fn test_growth_shifts_payload_offsets() {
        let (mut store, mut header, codec) = fresh(16);
        let region = HeaderLayout::locate(&mut store).unwrap().region_len();

        // A payload right after the header region.
        let payload = b"payload bytes that must survive the move";
        let start = store::append(&mut store, payload).unwrap();
        assert_eq!(start, region);
        let id = header.reserve_id(IdKind::File).unwrap();
        let end = start + payload.len() as u64;
        header
            .insert_file(file_record(id, ROOT_DIR, start as i64, end as i64))
            .unwrap();
        for n in 0..10 {
            add_dir(&mut header, &format!("folder-{}", n), ROOT_DIR);
        }

        let persisted = persist_header(&mut store, &mut header, &codec, PW, 256).unwrap();
        assert!(persisted.grown > 0);
        assert_eq!(persisted.layout.region_len(), region + persisted.grown);

        let file = header.file(id).unwrap();
        assert_eq!(file.loc_start as u64, start + persisted.grown);
        let (s, e) = file.range();
        assert_eq!(store::read_range(&mut store, s, e - s).unwrap(), payload);
        assert_eq!(header.to_bytes().unwrap().len() as u64, header.vault.header_size);

        // Shrinking back leaves the region size alone.
        for n in 0..10 {
            let dir = header
                .map
                .directories
                .values()
                .find(|d| d.name == format!("folder-{}", n))
                .map(|d| d.id)
                .unwrap();
            assert!(header.safe_remove_folder(dir).removed());
        }
        let again = persist_header(&mut store, &mut header, &codec, PW, 256).unwrap();
        assert_eq!(again.grown, 0);
        assert_eq!(again.layout.region_len(), persisted.layout.region_len());
    }

    #[test]
    fn test_failed_growth_closes_gap() {
        let (store, mut header, codec) = fresh(16);
        let mut store = store::FailingStore::wrap(store);
        let payload = b"bytes behind the header region";
        let start = store::append(&mut store, payload).unwrap();
        let id = header.reserve_id(IdKind::File).unwrap();
        header
            .insert_file(file_record(
                id,
                ROOT_DIR,
                start as i64,
                (start + payload.len() as u64) as i64,
            ))
            .unwrap();
        for n in 0..10 {
            add_dir(&mut header, &format!("folder-{}", n), ROOT_DIR);
        }
        let before = store.as_bytes().to_vec();

        store.fail_writes_at(Some(0));
        let err = persist_header(&mut store, &mut header, &codec, PW, 256).unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{:?}", err);
        assert_eq!(store.as_bytes(), &before[..]);
        assert_eq!(header.file(id).unwrap().loc_start as u64, start);

        store.fail_writes_at(None);
        let persisted = persist_header(&mut store, &mut header, &codec, PW, 256).unwrap();
        assert!(persisted.grown > 0);
        let (s, e) = header.file(id).unwrap().range();
        assert_eq!(store::read_range(&mut store, s, e - s).unwrap(), payload);
    }

    #[test]
    fn test_rollback_trims_to_original_length() {
        let mut store = MemoryStore::from_bytes(vec![7u8; 32]);
        let err = with_rollback(&mut store, |s| {
            store::append(s, &[1u8; 100])?;
            Err::<(), _>(Error::SizeMismatch {
                expected: 132,
                actual: 100,
            })
        })
        .unwrap_err();
        assert_eq!(store.as_bytes(), &[7u8; 32][..]);
        let msg = err.to_string();
        assert!(msg.contains("Size mismatch"), "{}", msg);
        assert!(msg.contains("trimmed back to 32 bytes"), "{}", msg);
    }
}
