//! Canonical containers: sets and maps whose literal form is independent of
//! insertion order.
//!
//! Members are keyed by their own content hash, and iteration walks members
//! in ascending hash order, so two containers holding the same members are
//! literally (and therefore hash-) identical no matter how they were built.

use std::collections::BTreeMap;

use weft_base::Hash;

use crate::context::field_value_hash;
use crate::error::LiteralError;
use crate::object::FieldValue;
use crate::reference::HashReference;

/// A set of hashable members in canonical (ascending member hash) order.
#[derive(Debug, Clone, Default)]
pub struct HashedSet {
    elements: BTreeMap<Hash, FieldValue>,
}

impl HashedSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from members, hashing each one.
    pub fn from_members(
        members: impl IntoIterator<Item = FieldValue>,
    ) -> Result<Self, LiteralError> {
        let mut set = Self::new();
        for member in members {
            set.insert(member)?;
        }
        Ok(set)
    }

    /// Build a set of references.
    pub fn from_references(
        refs: impl IntoIterator<Item = HashReference>,
    ) -> Result<Self, LiteralError> {
        Self::from_members(refs.into_iter().map(FieldValue::Reference))
    }

    /// Insert a member. Returns `true` if it was not present yet.
    pub fn insert(&mut self, member: FieldValue) -> Result<bool, LiteralError> {
        let hash = field_value_hash(&member)?;
        Ok(self.elements.insert(hash, member).is_none())
    }

    /// Remove a member by its content hash.
    pub fn remove(&mut self, member_hash: &Hash) -> Option<FieldValue> {
        self.elements.remove(member_hash)
    }

    /// Whether a member with this content hash is present.
    pub fn contains_hash(&self, member_hash: &Hash) -> bool {
        self.elements.contains_key(member_hash)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Members in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldValue> {
        self.elements.values()
    }

    /// The references among the members, in canonical order.
    pub fn iter_references(&self) -> impl Iterator<Item = &HashReference> {
        self.elements.values().filter_map(FieldValue::as_reference)
    }

    /// Hashes of the referenced objects, for sets of references.
    pub fn reference_hashes(&self) -> Vec<Hash> {
        self.iter_references().map(|r| r.hash).collect()
    }
}

/// A map from hashable keys to hashable values, ordered by key hash.
#[derive(Debug, Clone, Default)]
pub struct HashedMap {
    entries: BTreeMap<Hash, (FieldValue, FieldValue)>,
}

impl HashedMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing any entry whose key has the same hash.
    pub fn insert(&mut self, key: FieldValue, value: FieldValue) -> Result<(), LiteralError> {
        let key_hash = field_value_hash(&key)?;
        self.entries.insert(key_hash, (key, value));
        Ok(())
    }

    /// Look up a value by its key's content hash.
    pub fn get(&self, key_hash: &Hash) -> Option<&FieldValue> {
        self.entries.get(key_hash).map(|(_k, v)| v)
    }

    /// Remove an entry by its key's content hash.
    pub fn remove(&mut self, key_hash: &Hash) -> Option<(FieldValue, FieldValue)> {
        self.entries.remove(key_hash)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in canonical (ascending key hash) order.
    pub fn iter(&self) -> impl Iterator<Item = (&FieldValue, &FieldValue)> {
        self.entries.values().map(|(k, v)| (k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_insertion_order_is_irrelevant() {
        let make = |order: &[&str]| {
            HashedSet::from_members(order.iter().map(|s| FieldValue::from(*s))).unwrap()
        };
        let a = make(&["b", "a", "c"]);
        let b = make(&["c", "a", "b"]);
        let hashes_a: Vec<_> = a.iter().map(|m| field_value_hash(m).unwrap()).collect();
        let hashes_b: Vec<_> = b.iter().map(|m| field_value_hash(m).unwrap()).collect();
        assert_eq!(hashes_a, hashes_b);
    }

    #[test]
    fn set_deduplicates_by_content() {
        let mut set = HashedSet::new();
        assert!(set.insert(FieldValue::from("x")).unwrap());
        assert!(!set.insert(FieldValue::from("x")).unwrap());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn map_replaces_by_key_hash() {
        let mut map = HashedMap::new();
        map.insert(FieldValue::from("k"), FieldValue::from(1.0))
            .unwrap();
        map.insert(FieldValue::from("k"), FieldValue::from(2.0))
            .unwrap();
        assert_eq!(map.len(), 1);
        let key_hash = field_value_hash(&FieldValue::from("k")).unwrap();
        assert!(matches!(
            map.get(&key_hash),
            Some(FieldValue::Number(n)) if *n == 2.0
        ));
    }
}
