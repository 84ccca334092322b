//! The content-addressed object trait and its supporting types.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use weft_base::{Hash, Value};

use crate::collections::{HashedMap, HashedSet};
use crate::context::Context;
use crate::events::EventRelay;
use crate::identity::Identity;
use crate::ops::{Mutable, Op};
use crate::reference::HashReference;

/// A shared handle to a content-addressed object.
pub type ObjectRc = Arc<dyn HashedObject>;

/// An object id: either random or derived from the parent's id and a field
/// name. Stored as a plain string so it literalizes as a primitive.
pub type ObjectId = String;

/// The field map a class exposes for literalization.
pub type ObjectFields = BTreeMap<String, FieldValue>;

/// Generate a fresh random 128-bit object id.
pub fn random_id() -> ObjectId {
    format!("{:032x}", rand::random::<u128>())
}

/// Compute the id of a child object derived from its parent's id and the
/// field it hangs off.
///
/// Uses the seeded hash variant: the parent id is the hashed value and the
/// field path is the seed concatenated into the preimage.
pub fn derived_id(parent_id: &str, field_name: &str) -> ObjectId {
    let value = Value::String(format!("#{parent_id}"));
    Hash::of_value_seeded(&value, &format!(".{field_name}"))
        .expect("strings always render")
        .to_hex()
}

/// The content of one literalizable field.
///
/// Mirrors the canonical [`Value`] domain, extended with the four
/// content-addressed shapes: nested objects, references, and the canonical
/// set/map containers. A back-edge between objects must be a
/// [`FieldValue::Reference`]; ownership cycles are unrepresentable.
#[derive(Debug, Clone, derive_more::From)]
pub enum FieldValue {
    /// A boolean.
    Bool(bool),
    /// A finite number.
    Number(f64),
    /// A string.
    String(String),
    /// An ordered array of field values.
    Array(Vec<FieldValue>),
    /// A plain record with string keys. Keys must not start with `_`.
    Record(BTreeMap<String, FieldValue>),
    /// A nested hashed object, owned by this literal tree.
    Object(ObjectRc),
    /// A non-owning pointer to another hashed object.
    Reference(HashReference),
    /// A canonical set.
    Set(HashedSet),
    /// A canonical map.
    Map(HashedMap),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl FieldValue {
    /// The string content, if this is a string field.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The reference, if this is a reference field.
    pub fn as_reference(&self) -> Option<&HashReference> {
        match self {
            FieldValue::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// The nested object, if this is an object field.
    pub fn as_object(&self) -> Option<&ObjectRc> {
        match self {
            FieldValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// The set, if this is a set field.
    pub fn as_set(&self) -> Option<&HashedSet> {
        match self {
            FieldValue::Set(s) => Some(s),
            _ => None,
        }
    }
}

/// Bookkeeping common to every hashed object.
///
/// `last_hash` and `last_signature` are write-once cells so they can be
/// filled in through a shared reference while an object is being literalized
/// or saved; re-identifying an object replaces the cells wholesale.
#[derive(Debug, Default, Clone)]
pub struct ObjectMeta {
    /// Optional object id (random or derived). Literalized as the `id` field.
    pub id: Option<ObjectId>,
    /// Optional author. Literalized as the `author` field; presence demands a
    /// signature at save time.
    pub author: Option<Arc<Identity>>,
    /// Hash memoized by the last literalization.
    pub last_hash: OnceLock<Hash>,
    /// Signature memoized by the last signing or load.
    pub last_signature: OnceLock<String>,
    /// Whether the store should sign this object when saving it.
    pub sign_on_save: bool,
    relay: OnceLock<Arc<EventRelay>>,
}

impl ObjectMeta {
    /// Meta for an authored object; enables signing on save.
    pub fn authored(author: Arc<Identity>) -> Self {
        ObjectMeta {
            author: Some(author),
            sign_on_save: true,
            ..Default::default()
        }
    }

    /// The memoized hash, if the object has been literalized or loaded.
    pub fn last_hash(&self) -> Option<&Hash> {
        self.last_hash.get()
    }

    /// The memoized signature, if the object has been signed or loaded.
    pub fn last_signature(&self) -> Option<&str> {
        self.last_signature.get().map(|s| s.as_str())
    }

    /// The object's event relay, created lazily on first access.
    ///
    /// Clones of the meta share the relay, so observers survive
    /// clone-through-literalization.
    pub fn event_relay(&self) -> Arc<EventRelay> {
        self.relay.get_or_init(EventRelay::new_arc).clone()
    }

    /// Drop memoized hash and signature, e.g. after re-identifying.
    pub fn reset_memo(&mut self) {
        self.last_hash = OnceLock::new();
        self.last_signature = OnceLock::new();
    }
}

/// An object whose identity is the hash of its canonical literal.
///
/// Implementations expose their literalizable state through [`fields`]; the
/// walker in [`crate::context`] turns that map into a [`crate::Literal`] and
/// back. Fields that must not be literalized (caches, queues, attached key
/// pairs) simply stay out of the map.
///
/// [`fields`]: HashedObject::fields
pub trait HashedObject: fmt::Debug + Send + Sync + 'static {
    /// The class tag recorded in the literal and looked up in the
    /// [`crate::ClassRegistry`] at reconstruction time.
    fn class_name(&self) -> &'static str;

    /// The literalizable fields. `id` and `author` are injected by the
    /// walker from [`ObjectMeta`]; classes must not emit them here.
    fn fields(&self) -> ObjectFields;

    /// Shared bookkeeping.
    fn meta(&self) -> &ObjectMeta;

    /// Mutable access to the bookkeeping.
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Clone into a shared handle.
    fn clone_rc(&self) -> ObjectRc;

    /// Downcasting support.
    fn as_any(&self) -> &dyn Any;

    /// Flags recorded in the literal (`op` for mutation ops).
    fn flags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Class-specific hash override. When `Some`, it replaces the hash of the
    /// literal value (identities hash their public key).
    fn custom_hash(&self) -> Option<Hash> {
        None
    }

    /// Called after reconstruction, once fields and meta are assigned.
    fn init(&mut self) {}

    /// Class-specific invariants, checked during validated loads. The
    /// context gives access to every referenced object reconstructed so far.
    fn validate(&self, _context: &Context) -> bool {
        true
    }

    /// Names of fields whose child object ids derive from this object's id.
    fn derived_field_names(&self) -> &'static [&'static str] {
        &[]
    }

    /// Mutable handles on the children named by [`derived_field_names`];
    /// children must be owned (not shared) so their ids can cascade.
    ///
    /// [`derived_field_names`]: HashedObject::derived_field_names
    fn derived_children_mut(&mut self) -> Vec<(&'static str, &mut dyn HashedObject)> {
        Vec::new()
    }

    /// This object viewed as a mutation op, if it is one.
    fn as_op(&self) -> Option<&dyn Op> {
        None
    }

    /// This object viewed as a mutable, if it is one.
    fn as_mutable(&self) -> Option<&dyn Mutable> {
        None
    }

    /// Assign an id, cascading derived ids into the children reported by
    /// [`derived_children_mut`].
    ///
    /// [`derived_children_mut`]: HashedObject::derived_children_mut
    fn set_id(&mut self, id: ObjectId) {
        self.meta_mut().reset_memo();
        self.meta_mut().id = Some(id.clone());
        for (name, child) in self.derived_children_mut() {
            child.set_id(derived_id(&id, name));
        }
    }

    /// Assign a fresh random id, cascading derived ids.
    fn set_random_id(&mut self) {
        self.set_id(random_id());
    }
}

/// Check that the child under `field_name` carries the id derived from its
/// parent's id.
pub fn check_derived_field(parent: &dyn HashedObject, field_name: &str) -> bool {
    let Some(parent_id) = parent.meta().id.as_deref() else {
        return false;
    };
    let expected = derived_id(parent_id, field_name);
    match parent.fields().get(field_name) {
        Some(FieldValue::Object(child)) => child.meta().id.as_deref() == Some(&expected),
        _ => false,
    }
}

/// Shared aliasing state threaded through contexts.
///
/// When a context carries resources, reconstructing or literalizing an object
/// whose hash appears in `aliasing` yields the aliased instance instead, so
/// shared subgraphs keep a single in-memory identity across contexts.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    /// Replacement objects, by hash.
    pub aliasing: std::collections::HashMap<Hash, ObjectRc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_distinct_hex() {
        let a = random_id();
        let b = random_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn derived_ids_are_deterministic() {
        let a = derived_id("parent", "field");
        let b = derived_id("parent", "field");
        assert_eq!(a, b);
        assert_ne!(a, derived_id("parent", "other"));
        assert_ne!(a, derived_id("other", "field"));
    }

    #[test]
    fn derived_ids_use_the_seeded_hash() {
        let expected = Hash::of_value_seeded(&Value::String("#parent".to_string()), ".field")
            .unwrap()
            .to_hex();
        assert_eq!(derived_id("parent", "field"), expected);
        // not the plain hash of the concatenated string
        let plain = Hash::of_value(&Value::String("#parent.field".to_string()))
            .unwrap()
            .to_hex();
        assert_ne!(derived_id("parent", "field"), plain);
    }
}
