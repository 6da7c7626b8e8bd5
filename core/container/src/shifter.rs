//! Offset rebasing after a physical insert or delete.

use crate::registry::VaultMap;

/// Pivot value that shifts every record.
pub const UNCONDITIONAL: i64 = -1;

fn eligible(start: i64, pivot: i64) -> bool {
    pivot == UNCONDITIONAL || start > pivot
}

/// Add `delta` to every stored range that starts after `pivot`.
///
/// Payload, icon and note ranges are tested independently against the
/// pre-shift pivot. Icon ranges with a non-positive bound are absent and
/// never move. Bytes inserted at offset `at` correspond to a pivot of
/// `at - 1`; bytes removed from `[s, e)` correspond to a pivot of `s` with
/// `delta = s - e`.
pub fn shift_offsets(map: &mut VaultMap, delta: i64, pivot: i64) {
    if delta == 0 {
        return;
    }
    for file in map.files.values_mut() {
        if eligible(file.loc_start, pivot) {
            file.loc_start += delta;
            file.loc_end += delta;
        }
        let meta = &mut file.metadata;
        if meta.icon_data_start > 0 && meta.icon_data_end > 0 && eligible(meta.icon_data_start, pivot) {
            meta.icon_data_start += delta;
            meta.icon_data_end += delta;
        }
    }
    for note in map.notes.values_mut() {
        if eligible(note.loc_start, pivot) {
            note.loc_start += delta;
            note.loc_end += delta;
        }
    }
}

/// Rebase after inserting `len` bytes at offset `at`.
pub fn shift_for_insert(map: &mut VaultMap, at: u64, len: u64) {
    shift_offsets(map, len as i64, at as i64 - 1);
}

/// Rebase after removing `len` bytes starting at offset `at`.
pub fn shift_for_removal(map: &mut VaultMap, at: u64, len: u64) {
    shift_offsets(map, -(len as i64), at as i64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{file_record, note_record};
    use crate::registry::ROOT_DIR;
    use proptest::prelude::*;

    fn sample_map() -> VaultMap {
        let mut map = VaultMap::default();
        let mut a = file_record(1, ROOT_DIR, 100, 200);
        a.metadata.icon_data_start = 200;
        a.metadata.icon_data_end = 240;
        let b = file_record(2, ROOT_DIR, 240, 400);
        map.files.insert(1, a);
        map.files.insert(2, b);
        map.notes.insert(1, note_record(1, 2, 400, 420));
        map
    }

    #[test]
    fn test_pivot_is_exclusive() {
        let mut map = sample_map();
        shift_offsets(&mut map, 10, 240);
        assert_eq!(map.files[&1].range(), (100, 200));
        assert_eq!(map.files[&2].range(), (240, 400));
        assert_eq!(map.notes[&1].range(), (410, 430));
    }

    #[test]
    fn test_icon_shifted_independently() {
        let mut map = sample_map();
        shift_offsets(&mut map, 5, 150);
        assert_eq!(map.files[&1].range(), (100, 200));
        assert_eq!(map.files[&1].icon_range(), Some((205, 245)));
        assert_eq!(map.files[&2].range(), (245, 405));
    }

    #[test]
    fn test_unconditional_shifts_everything() {
        let mut map = sample_map();
        shift_offsets(&mut map, 64, UNCONDITIONAL);
        assert_eq!(map.files[&1].range(), (164, 264));
        assert_eq!(map.notes[&1].range(), (464, 484));
    }

    #[test]
    fn test_absent_icon_never_moves() {
        let mut map = sample_map();
        shift_offsets(&mut map, 100, UNCONDITIONAL);
        let meta = &map.files[&2].metadata;
        assert_eq!((meta.icon_data_start, meta.icon_data_end), (-1, -1));
    }

    #[test]
    fn test_removal_closes_gap() {
        let mut map = sample_map();
        // Drop file 2's bytes [240, 400).
        map.files.remove(&2);
        shift_for_removal(&mut map, 240, 160);
        assert_eq!(map.notes[&1].range(), (240, 260));
        assert_eq!(map.files[&1].icon_range(), Some((200, 240)));
    }

    #[test]
    fn test_insert_at_record_start_moves_it() {
        let mut map = sample_map();
        shift_for_insert(&mut map, 100, 8);
        assert_eq!(map.files[&1].range(), (108, 208));
    }

    proptest! {
        #[test]
        fn prop_shift_round_trip(delta in 1i64..10_000, pivot in -1i64..1_000) {
            let original = sample_map();
            let mut map = original.clone();
            shift_offsets(&mut map, delta, pivot);
            shift_offsets(&mut map, -delta, pivot);
            prop_assert_eq!(map, original);
        }
    }
}
