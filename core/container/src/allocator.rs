//! Dense identifier allocation.
//!
//! Identifiers are positive integers. A new identifier fills the lowest hole
//! left by a deletion before extending the sequence, so ids stay small over
//! the lifetime of a container.

use std::collections::{BTreeSet, HashSet};

use capsule_common::{Error, Result};

/// Upper bound on the fallback scan past the maximum id.
const FALLBACK_SCAN_LIMIT: u64 = 1 << 20;

/// Every value that appears more than once in `ids`, ascending.
pub fn find_duplicates(ids: &[u64]) -> Vec<u64> {
    let mut seen = HashSet::with_capacity(ids.len());
    let mut duplicates = BTreeSet::new();
    for &id in ids {
        if !seen.insert(id) {
            duplicates.insert(id);
        }
    }
    duplicates.into_iter().collect()
}

/// Fail with `IdCollision` if any identifier repeats.
pub fn ensure_unique(ids: &[u64]) -> Result<()> {
    let duplicates = find_duplicates(ids);
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(Error::IdCollision(duplicates))
    }
}

/// Pick the next identifier for a namespace holding `existing`.
///
/// # Errors
/// - `IdCollision` listing every value that appears more than once
/// - `Integrity` if no free identifier can be found
pub fn allocate(existing: &[u64]) -> Result<u64> {
    if existing.is_empty() {
        return Ok(1);
    }

    ensure_unique(existing)?;
    let seen: HashSet<u64> = existing.iter().copied().collect();

    let gap = existing
        .iter()
        .filter_map(|&id| id.checked_sub(1))
        .filter(|&candidate| candidate > 0 && !seen.contains(&candidate))
        .min();
    if let Some(candidate) = gap {
        return Ok(candidate);
    }

    let max = existing.iter().copied().max().unwrap_or(0);
    if let Some(next) = max.checked_add(1).filter(|n| !seen.contains(n)) {
        return Ok(next);
    }

    (max.saturating_add(2)..max.saturating_add(2).saturating_add(FALLBACK_SCAN_LIMIT))
        .find(|candidate| !seen.contains(candidate))
        .ok_or_else(|| Error::Integrity("No free identifier available".to_string()))
}
