//! The blake3 hash used throughout weft.

use std::fmt;
use std::str::FromStr;

use serde::{
    de::{self, SeqAccess},
    ser::SerializeTuple,
    Deserialize, Deserializer, Serialize, Serializer,
};

use crate::value::{canonical_string, Value, ValueError};

/// Hash type used throughout.
///
/// The canonical textual form is lowercase hex; it is the form that appears
/// inside hash preimages (dependency placeholders, derived ids, signature
/// payloads), so it must never change.
#[derive(PartialEq, Eq, Copy, Clone, Hash)]
pub struct Hash(blake3::Hash);

impl Hash {
    /// Calculate the hash of the provided bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        Hash(blake3::hash(buf.as_ref()))
    }

    /// Hash a canonical value.
    pub fn of_value(value: &Value) -> Result<Self, ValueError> {
        Ok(Self::new(canonical_string(value)?))
    }

    /// Hash a canonical value with a seed concatenated into the preimage.
    ///
    /// Used for derived ids and for signed challenges that must not collide
    /// with stored object hashes.
    pub fn of_value_seeded(value: &Value, seed: &str) -> Result<Self, ValueError> {
        let mut preimage = canonical_string(value)?;
        preimage.push_str(seed);
        Ok(Self::new(preimage))
    }

    /// Bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Create a `Hash` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    /// Convert the hash to its canonical hex string.
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<[u8; 32]> for Hash {
    fn from(value: [u8; 32]) -> Self {
        Hash(blake3::Hash::from(value))
    }
}

impl From<Hash> for [u8; 32] {
    fn from(value: Hash) -> Self {
        *value.as_bytes()
    }
}

impl PartialOrd for Hash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Hash({}…{})", &hex[..6], &hex[hex.len() - 4..])
    }
}

impl FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        if s.len() != 64 || hex::decode_to_slice(s, &mut bytes).is_err() {
            return Err(ParseHashError);
        }
        Ok(Self::from(bytes))
    }
}

/// Failed to parse a hex hash string.
#[derive(Debug, thiserror::Error)]
#[error("invalid hash: expected 64 hex characters")]
pub struct ParseHashError;

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            let mut s = serializer.serialize_tuple(32)?;
            for item in self.0.as_bytes() {
                s.serialize_element(item)?;
            }
            s.end()
        }
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            deserializer.deserialize_tuple(32, HashVisitor)
        }
    }
}

struct HashVisitor;

impl<'de> de::Visitor<'de> for HashVisitor {
    type Value = Hash;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an array of 32 bytes containing hash data")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut bytes = [0u8; 32];
        for (idx, byte) in bytes.iter_mut().enumerate() {
            *byte = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(idx, &self))?;
        }
        Ok(Hash::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let hash = Hash::new(b"hello");
        let hex = hash.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex, hex.to_lowercase());
        assert_eq!(Hash::from_str(&hex).unwrap(), hash);
    }

    #[test]
    fn value_hash_ignores_key_order() {
        let a = Value::object([("x", Value::from(1.0)), ("y", Value::from(2.0))]);
        let b = Value::object([("y", Value::from(2.0)), ("x", Value::from(1.0))]);
        assert_eq!(Hash::of_value(&a).unwrap(), Hash::of_value(&b).unwrap());
    }

    #[test]
    fn seeded_hash_differs() {
        let v = Value::from("payload");
        let plain = Hash::of_value(&v).unwrap();
        let seeded = Hash::of_value_seeded(&v, "seed").unwrap();
        assert_ne!(plain, seeded);
        assert_eq!(Hash::of_value_seeded(&v, "seed").unwrap(), seeded);
    }
}
