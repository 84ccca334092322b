//! The content-addressed object model.
//!
//! Objects implementing [`HashedObject`] literalize into a canonical
//! [`Literal`] (value + class tag + dependency list) inside a [`Context`];
//! the hash of the canonical value is the object's identity. Identities sign
//! object hashes, mutation ops form causal histories over mutables, and the
//! class registry turns class tags back into instances at load time.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

mod collections;
mod context;
mod error;
mod events;
mod identity;
mod literal;
mod object;
mod ops;
mod reference;
mod registry;

pub use collections::{HashedMap, HashedSet};
pub use context::{clone_object, object_hash, Context};
pub use error::LiteralError;
pub use events::{EventRelay, MutationEvent, Observer};
pub use identity::{Identity, KeyPair};
pub use literal::{Dependency, DependencyKind, Literal};
pub use object::{
    check_derived_field, derived_id, random_id, FieldValue, HashedObject, ObjectFields, ObjectId,
    ObjectMeta, ObjectRc, Resources,
};
pub use ops::{
    CascadedInvalidateOp, Invalidation, InvalidateAfterOp, Mutable, Op, OpHeader, OpQueue, OP_FLAG,
};
pub use reference::HashReference;
pub use registry::{lookup_class, register_class, ConstructorFn};
