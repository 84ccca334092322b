//! The process-wide class registry.
//!
//! Reconstruction needs to turn a class tag back into an instance. Core
//! classes are registered on first use; applications add their own classes
//! with [`register_class`] before loading literals that mention them.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::error::LiteralError;
use crate::identity::{Identity, KeyPair};
use crate::object::{HashedObject, ObjectFields, ObjectMeta};
use crate::ops::{CascadedInvalidateOp, InvalidateAfterOp};

/// Builds an instance from decoded fields and meta.
pub type ConstructorFn =
    fn(ObjectFields, ObjectMeta) -> Result<Box<dyn HashedObject>, LiteralError>;

static REGISTRY: OnceLock<RwLock<HashMap<String, ConstructorFn>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, ConstructorFn>> {
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, ConstructorFn> = HashMap::new();
        map.insert(Identity::CLASS.to_string(), Identity::construct);
        map.insert(KeyPair::CLASS.to_string(), KeyPair::construct);
        map.insert(
            InvalidateAfterOp::CLASS.to_string(),
            InvalidateAfterOp::construct,
        );
        map.insert(
            CascadedInvalidateOp::CLASS.to_string(),
            CascadedInvalidateOp::construct,
        );
        RwLock::new(map)
    })
}

/// Register a class constructor under its class tag.
///
/// Re-registering a tag replaces the previous constructor.
pub fn register_class(name: impl Into<String>, ctor: ConstructorFn) {
    registry().write().insert(name.into(), ctor);
}

/// Look up the constructor for a class tag.
pub fn lookup_class(name: &str) -> Option<ConstructorFn> {
    registry().read().get(name).copied()
}
