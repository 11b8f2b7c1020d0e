//! Key Router - CRC-32 mod N shard placement
//!
//! The mapping only depends on the key bytes and the shard count, so the
//! same key lands on the same shard across restarts as long as N is
//! unchanged.

/// A key split into the part used for hashing and the part sent to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedKey<'a> {
    /// Text the shard index is computed from
    pub hash_key: &'a str,
    /// Key with the tag removed, as the store sees it
    pub stripped_key: &'a str,
}

/// Extract a colocation tag from a key
///
/// `"user:1{grp}"` hashes on `"grp"` and is stored as `"user:1"`. The tag
/// runs from after the last `{` up to the final character, so a trailing
/// `}` is expected. A `{` in first position does not start a tag.
pub fn extract_tag(key: &str) -> Option<TaggedKey<'_>> {
    let start = key.rfind('{')?;
    if start == 0 {
        return None;
    }
    let body = &key[start + 1..];
    let hash_key = match body.char_indices().last() {
        Some((last, _)) => &body[..last],
        None => "",
    };
    Some(TaggedKey {
        hash_key,
        stripped_key: &key[..start],
    })
}

/// Shard index in `[1, shard_count]` for a routing key
pub fn shard_index_of(key: &str, shard_count: usize) -> usize {
    debug_assert!(shard_count > 0);
    (crc32fast::hash(key.as_bytes()) as usize % shard_count) + 1
}

/// Alias of the master serving a shard
pub fn master_alias(shard: usize) -> String {
    format!("node_{}", shard)
}
