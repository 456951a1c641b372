//! Tag registry.
//!
//! Tracks which response entries each cache tag covers, so that purging a
//! tag removes every entry that was computed from the data the tag names.
//! Tags are opaque strings minted by the write path, e.g.
//! `course:41:staff`; they are never deleted explicitly and disappear once
//! no entry references them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::lock::{rw_read, rw_write};
use super::response::ResponseKey;

const SOURCE: &str = "cache::tags";

/// Maximum accepted tag length, in bytes.
pub const MAX_TAG_LEN: usize = 200;

/// An opaque label grouping cache entries that must be invalidated together.
///
/// Restricted to `[A-Za-z0-9_:-]` and 1–200 bytes so tags can travel safely
/// through trigger payloads, headers and log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheTag(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagParseError {
    #[error("tag must not be empty")]
    Empty,
    #[error("tag exceeds {MAX_TAG_LEN} bytes (got {0})")]
    TooLong(usize),
    #[error("tag contains disallowed character `{0}`")]
    InvalidChar(char),
}

impl CacheTag {
    pub fn parse(raw: &str) -> Result<Self, TagParseError> {
        if raw.is_empty() {
            return Err(TagParseError::Empty);
        }
        if raw.len() > MAX_TAG_LEN {
            return Err(TagParseError::TooLong(raw.len()));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '-')))
        {
            return Err(TagParseError::InvalidChar(bad));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CacheTag {
    type Error = TagParseError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<CacheTag> for String {
    fn from(tag: CacheTag) -> Self {
        tag.0
    }
}

/// Bidirectional tag ↔ response-key registry.
///
/// Both directions are kept so that purging a tag finds every covered entry
/// and evicting an entry cleans up the tag mappings it participated in.
pub struct TagRegistry {
    /// Maps each tag to every response key it covers.
    tag_to_keys: RwLock<HashMap<CacheTag, HashSet<ResponseKey>>>,
    /// Maps each response key to the tags it was stored under.
    key_to_tags: RwLock<HashMap<ResponseKey, HashSet<CacheTag>>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self {
            tag_to_keys: RwLock::new(HashMap::new()),
            key_to_tags: RwLock::new(HashMap::new()),
        }
    }

    /// Associate `tags` with a response entry at write time.
    ///
    /// Replaces any previous association for the key: an entry is never
    /// mutated in place, so a re-computed entry carries exactly the tags of
    /// its latest computation.
    pub fn tag(&self, key: ResponseKey, tags: HashSet<CacheTag>) {
        let mut t2k = rw_write(&self.tag_to_keys, SOURCE, "tag.t2k");
        let mut k2t = rw_write(&self.key_to_tags, SOURCE, "tag.k2t");

        if let Some(previous) = k2t.remove(&key) {
            detach(&mut t2k, &key, &previous);
        }
        for tag in &tags {
            t2k.entry(tag.clone()).or_default().insert(key.clone());
        }
        k2t.insert(key, tags);
    }

    /// Remove every entry referencing any of the given tags.
    ///
    /// Returns the keys that were covered, deduplicated, so the store can
    /// drop them. Idempotent and commutative: purging a tag twice, or tags
    /// in any order within one call, yields the same final state. Both maps
    /// are updated under one write-lock pair, so no entry is ever observed
    /// half-purged.
    pub fn purge(&self, tags: &[CacheTag]) -> Vec<ResponseKey> {
        let mut t2k = rw_write(&self.tag_to_keys, SOURCE, "purge.t2k");
        let mut k2t = rw_write(&self.key_to_tags, SOURCE, "purge.k2t");

        let mut purged: HashSet<ResponseKey> = HashSet::new();
        for tag in tags {
            if let Some(keys) = t2k.remove(tag) {
                purged.extend(keys);
            }
        }

        // An entry covered by a purged tag is removed entirely, including
        // its links to tags that were not part of this purge.
        for key in &purged {
            if let Some(remaining) = k2t.remove(key) {
                detach(&mut t2k, key, &remaining);
            }
        }

        purged.into_iter().collect()
    }

    /// Drop all mappings for an entry, e.g. after LRU eviction.
    pub fn release(&self, key: &ResponseKey) {
        let mut t2k = rw_write(&self.tag_to_keys, SOURCE, "release.t2k");
        let mut k2t = rw_write(&self.key_to_tags, SOURCE, "release.k2t");

        if let Some(tags) = k2t.remove(key) {
            detach(&mut t2k, key, &tags);
        }
    }

    /// Number of live tags (referenced by at least one entry).
    pub fn tag_count(&self) -> usize {
        rw_read(&self.tag_to_keys, SOURCE, "tag_count").len()
    }

    /// Number of tagged entries.
    pub fn key_count(&self) -> usize {
        rw_read(&self.key_to_tags, SOURCE, "key_count").len()
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn detach(
    t2k: &mut HashMap<CacheTag, HashSet<ResponseKey>>,
    key: &ResponseKey,
    tags: &HashSet<CacheTag>,
) {
    for tag in tags {
        if let Some(keys) = t2k.get_mut(tag) {
            keys.remove(key);
            if keys.is_empty() {
                t2k.remove(tag);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(raw: &str) -> CacheTag {
        CacheTag::parse(raw).expect("valid tag")
    }

    fn tags(raw: &[&str]) -> HashSet<CacheTag> {
        raw.iter().map(|t| tag(t)).collect()
    }

    #[test]
    fn parse_accepts_expected_charset() {
        assert!(CacheTag::parse("course:41:staff").is_ok());
        assert!(CacheTag::parse("a-b_c:9").is_ok());
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(CacheTag::parse(""), Err(TagParseError::Empty));
        assert_eq!(
            CacheTag::parse("has space"),
            Err(TagParseError::InvalidChar(' '))
        );
        let long = "x".repeat(MAX_TAG_LEN + 1);
        assert_eq!(
            CacheTag::parse(&long),
            Err(TagParseError::TooLong(MAX_TAG_LEN + 1))
        );
    }

    #[test]
    fn tag_and_purge_roundtrip() {
        let registry = TagRegistry::new();
        let key = ResponseKey::new("/courses/41/staff");

        registry.tag(key.clone(), tags(&["course:41:staff", "course:41"]));
        assert_eq!(registry.key_count(), 1);
        assert_eq!(registry.tag_count(), 2);

        let purged = registry.purge(&[tag("course:41:staff")]);
        assert_eq!(purged, vec![key]);
        // The other tag the entry carried is gone too.
        assert_eq!(registry.tag_count(), 0);
        assert_eq!(registry.key_count(), 0);
    }

    #[test]
    fn purge_is_idempotent() {
        let registry = TagRegistry::new();
        registry.tag(
            ResponseKey::new("/courses/41"),
            tags(&["course:41"]),
        );

        let first = registry.purge(&[tag("course:41")]);
        assert_eq!(first.len(), 1);
        let second = registry.purge(&[tag("course:41")]);
        assert!(second.is_empty());
        assert_eq!(registry.tag_count(), 0);
    }

    #[test]
    fn purge_deduplicates_keys_across_tags() {
        let registry = TagRegistry::new();
        let key = ResponseKey::new("/courses/41/roster");
        registry.tag(key.clone(), tags(&["course:41", "course:41:roster"]));

        let purged = registry.purge(&[tag("course:41"), tag("course:41:roster")]);
        assert_eq!(purged, vec![key]);
    }

    #[test]
    fn retag_replaces_previous_association() {
        let registry = TagRegistry::new();
        let key = ResponseKey::new("/courses/41");
        registry.tag(key.clone(), tags(&["course:41", "term:fall"]));
        registry.tag(key.clone(), tags(&["course:41"]));

        // The dropped tag no longer covers the entry.
        assert!(registry.purge(&[tag("term:fall")]).is_empty());
        assert_eq!(registry.purge(&[tag("course:41")]), vec![key]);
    }

    #[test]
    fn release_cleans_up_mappings() {
        let registry = TagRegistry::new();
        let key = ResponseKey::new("/courses/41");
        registry.tag(key.clone(), tags(&["course:41"]));

        registry.release(&key);
        assert_eq!(registry.tag_count(), 0);
        assert_eq!(registry.key_count(), 0);
        assert!(registry.purge(&[tag("course:41")]).is_empty());
    }
}
