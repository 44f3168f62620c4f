//! LRU eviction policy: picks the entry to evict when a backend is over capacity.

use crate::storage::CacheEntry;
use std::time::Instant;

/// Select the eviction candidate among `entries`: the minimum
/// `(last_accessed, access_sequence)` pair, lexicographically. Ties on
/// `last_accessed` (same clock tick) are broken by the lower
/// `access_sequence`, so eviction order is deterministic even when many
/// entries are touched within one clock tick.
pub fn select_eviction_candidate<'a, V, I>(entries: I) -> Option<String>
where
    I: Iterator<Item = (&'a String, &'a CacheEntry<V>)>,
    V: 'a,
{
    entries
        .min_by_key(|(_, entry)| (entry.last_accessed, entry.access_sequence))
        .map(|(key, _)| key.clone())
}
