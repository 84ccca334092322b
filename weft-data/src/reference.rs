use serde::{Deserialize, Serialize};
use weft_base::Hash;

use crate::context::object_hash;
use crate::error::LiteralError;
use crate::object::HashedObject;

/// A non-owning, typed pointer to another hashed object.
///
/// References literalize as dependencies of kind
/// [`Reference`](crate::DependencyKind::Reference): the referenced literal is
/// not embedded in the referring literal tree, only named by hash and class.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HashReference {
    /// Hash of the referenced object.
    pub hash: Hash,
    /// Class tag of the referenced object.
    pub class_name: String,
}

impl HashReference {
    /// Create a reference from parts.
    pub fn new(hash: Hash, class_name: impl Into<String>) -> Self {
        HashReference {
            hash,
            class_name: class_name.into(),
        }
    }

    /// Create a reference to an in-memory object, hashing it if needed.
    pub fn to(target: &dyn HashedObject) -> Result<Self, LiteralError> {
        let hash = match target.meta().last_hash() {
            Some(hash) => *hash,
            None => object_hash(target)?,
        };
        Ok(HashReference::new(hash, target.class_name()))
    }
}
