//! Mutation ops, causal invalidation op types, and op headers.
//!
//! A mutation op is a hashed object describing one change to a mutable
//! object. Ops name their direct causal predecessors on the same target
//! (`prev_ops`) and may name cross-object preconditions (`causal_ops`);
//! when a precondition is invalidated, the store synthesizes a
//! [`CascadedInvalidateOp`] for every op that depended on it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use weft_base::{Hash, Value};

use crate::error::LiteralError;
use crate::object::{FieldValue, HashedObject, ObjectFields, ObjectMeta, ObjectRc};
use crate::collections::HashedSet;
use crate::reference::HashReference;

/// Flag carried by every mutation op literal.
pub const OP_FLAG: &str = "op";

/// A mutation op: one change to a mutable object.
pub trait Op: HashedObject {
    /// The mutable this op targets.
    fn target_object(&self) -> &HashReference;

    /// Direct causal predecessors within the same target.
    fn prev_ops(&self) -> &HashedSet;

    /// Cross-object preconditions: ops (usually on other mutables) this op
    /// is only valid under.
    fn causal_ops(&self) -> Option<&HashedSet> {
        None
    }

    /// This op viewed as an invalidation, if it is one.
    fn as_invalidation(&self) -> Option<&dyn Invalidation> {
        None
    }
}

/// An op that invalidates another op.
pub trait Invalidation: Op {
    /// The op being invalidated (for retroactive invalidations, the op whose
    /// late descendants become invalid).
    fn invalidated_op(&self) -> &HashReference;
}

/// A mutable object: accumulates ops between saves.
pub trait Mutable: HashedObject {
    /// Queue an op for the next save.
    fn enqueue_op(&self, op: ObjectRc);

    /// Drain the queued ops.
    fn take_queued_ops(&self) -> Vec<ObjectRc>;

    /// Whether ops are queued.
    fn has_queued_ops(&self) -> bool;
}

/// Shared op queue for [`Mutable`] implementations. Clones share the queue,
/// so clone-through-literalization does not lose pending ops.
#[derive(Clone, Default)]
pub struct OpQueue(Arc<Mutex<Vec<ObjectRc>>>);

impl fmt::Debug for OpQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpQueue(len={})", self.0.lock().len())
    }
}

impl OpQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an op.
    pub fn push(&self, op: ObjectRc) {
        self.0.lock().push(op);
    }

    /// Drain all queued ops in order.
    pub fn drain(&self) -> Vec<ObjectRc> {
        std::mem::take(&mut *self.0.lock())
    }

    /// Whether the queue holds ops.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Marks late descendants of an op as invalid.
///
/// Descendants of `target_op` (on the same mutable) that are not ancestors
/// of the `terminal_ops` set are invalidated once this op is saved.
#[derive(Debug, Clone)]
pub struct InvalidateAfterOp {
    meta: ObjectMeta,
    target_object: HashReference,
    prev_ops: HashedSet,
    target_op: HashReference,
    terminal_ops: HashedSet,
}

impl InvalidateAfterOp {
    /// Class tag.
    pub const CLASS: &'static str = "InvalidateAfterOp";

    /// Create an invalidation of the late descendants of `target_op`.
    pub fn new(
        target_object: HashReference,
        target_op: HashReference,
        terminal_ops: HashedSet,
        prev_ops: HashedSet,
    ) -> Self {
        InvalidateAfterOp {
            meta: ObjectMeta::default(),
            target_object,
            prev_ops,
            target_op,
            terminal_ops,
        }
    }

    /// The ops bounding the still-valid region.
    pub fn terminal_ops(&self) -> &HashedSet {
        &self.terminal_ops
    }

    pub(crate) fn construct(
        mut fields: ObjectFields,
        meta: ObjectMeta,
    ) -> Result<Box<dyn HashedObject>, LiteralError> {
        Ok(Box::new(InvalidateAfterOp {
            meta,
            target_object: take_reference(&mut fields, "target_object")?,
            prev_ops: take_set(&mut fields, "prev_ops")?,
            target_op: take_reference(&mut fields, "target_op")?,
            terminal_ops: take_set(&mut fields, "terminal_ops")?,
        }))
    }
}

impl HashedObject for InvalidateAfterOp {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn fields(&self) -> ObjectFields {
        let mut fields = ObjectFields::new();
        fields.insert(
            "target_object".to_string(),
            FieldValue::Reference(self.target_object.clone()),
        );
        fields.insert("prev_ops".to_string(), FieldValue::Set(self.prev_ops.clone()));
        fields.insert(
            "target_op".to_string(),
            FieldValue::Reference(self.target_op.clone()),
        );
        fields.insert(
            "terminal_ops".to_string(),
            FieldValue::Set(self.terminal_ops.clone()),
        );
        fields
    }

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn clone_rc(&self) -> ObjectRc {
        Arc::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn flags(&self) -> Vec<String> {
        vec![OP_FLAG.to_string()]
    }

    fn validate(&self, _context: &crate::Context) -> bool {
        self.terminal_ops.iter().all(|m| m.as_reference().is_some())
            && self.prev_ops.iter().all(|m| m.as_reference().is_some())
    }

    fn as_op(&self) -> Option<&dyn Op> {
        Some(self)
    }
}

impl Op for InvalidateAfterOp {
    fn target_object(&self) -> &HashReference {
        &self.target_object
    }

    fn prev_ops(&self) -> &HashedSet {
        &self.prev_ops
    }

    fn as_invalidation(&self) -> Option<&dyn Invalidation> {
        Some(self)
    }
}

impl Invalidation for InvalidateAfterOp {
    fn invalidated_op(&self) -> &HashReference {
        &self.target_op
    }
}

/// A store-generated op transmitting an invalidation to a dependent op.
///
/// The causing invalidation is embedded (not referenced), so a cascade's
/// dependency list folds in the invalidation's own edges and index queries
/// on the invalidated op's hash find the whole chain. Cascades carry no id
/// and no author, so their hash is a deterministic function of
/// `(target_op, reason)` — saving the same cascade twice is a no-op.
#[derive(Debug, Clone)]
pub struct CascadedInvalidateOp {
    meta: ObjectMeta,
    target_object: HashReference,
    prev_ops: HashedSet,
    target_op: HashReference,
    reason: ObjectRc,
}

impl CascadedInvalidateOp {
    /// Class tag.
    pub const CLASS: &'static str = "CascadedInvalidateOp";

    /// Create the cascade invalidating `target_op` (an op on
    /// `target_object`) because of the invalidation `reason`.
    pub fn create(
        target_object: HashReference,
        target_op: HashReference,
        reason: ObjectRc,
    ) -> Self {
        CascadedInvalidateOp {
            meta: ObjectMeta::default(),
            target_object,
            prev_ops: HashedSet::new(),
            target_op,
            reason,
        }
    }

    /// The invalidation that caused this cascade.
    pub fn reason(&self) -> &ObjectRc {
        &self.reason
    }

    pub(crate) fn construct(
        mut fields: ObjectFields,
        meta: ObjectMeta,
    ) -> Result<Box<dyn HashedObject>, LiteralError> {
        let reason = match fields.remove("reason") {
            Some(FieldValue::Object(reason)) => reason,
            _ => return Err(LiteralError::invalid("cascade embeds no reason")),
        };
        Ok(Box::new(CascadedInvalidateOp {
            meta,
            target_object: take_reference(&mut fields, "target_object")?,
            prev_ops: take_set(&mut fields, "prev_ops")?,
            target_op: take_reference(&mut fields, "target_op")?,
            reason,
        }))
    }
}

impl HashedObject for CascadedInvalidateOp {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn fields(&self) -> ObjectFields {
        let mut fields = ObjectFields::new();
        fields.insert(
            "target_object".to_string(),
            FieldValue::Reference(self.target_object.clone()),
        );
        fields.insert("prev_ops".to_string(), FieldValue::Set(self.prev_ops.clone()));
        fields.insert(
            "target_op".to_string(),
            FieldValue::Reference(self.target_op.clone()),
        );
        fields.insert("reason".to_string(), FieldValue::Object(self.reason.clone()));
        fields
    }

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn clone_rc(&self) -> ObjectRc {
        Arc::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn flags(&self) -> Vec<String> {
        vec![OP_FLAG.to_string()]
    }

    fn validate(&self, _context: &crate::Context) -> bool {
        self.reason
            .as_op()
            .and_then(|op| op.as_invalidation())
            .is_some()
    }

    fn as_op(&self) -> Option<&dyn Op> {
        Some(self)
    }
}

impl Op for CascadedInvalidateOp {
    fn target_object(&self) -> &HashReference {
        &self.target_object
    }

    fn prev_ops(&self) -> &HashedSet {
        &self.prev_ops
    }

    fn as_invalidation(&self) -> Option<&dyn Invalidation> {
        Some(self)
    }
}

impl Invalidation for CascadedInvalidateOp {
    fn invalidated_op(&self) -> &HashReference {
        &self.target_op
    }
}

/// Per-op causal header, computed when an op is saved.
///
/// `header_hash` is a deterministic digest over the op hash and the sorted
/// header hashes of the op's direct predecessors; it is the unit sync
/// protocols compare.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpHeader {
    /// Hash of the op this header belongs to.
    pub op_hash: Hash,
    /// Header hashes of the op's direct predecessors, by op hash.
    pub prev_headers: BTreeMap<Hash, Hash>,
    /// Digest over `op_hash` and the ordered predecessor header hashes.
    pub header_hash: Hash,
}

impl OpHeader {
    /// Compute the header for an op given its predecessors' header hashes.
    pub fn new(op_hash: Hash, prev_headers: BTreeMap<Hash, Hash>) -> Self {
        let mut prev_hex: Vec<String> = prev_headers.values().map(Hash::to_hex).collect();
        prev_hex.sort();
        let value = Value::Array(vec![
            Value::String(op_hash.to_hex()),
            Value::Array(prev_hex.into_iter().map(Value::String).collect()),
        ]);
        let header_hash = Hash::of_value(&value).expect("strings always render");
        OpHeader {
            op_hash,
            prev_headers,
            header_hash,
        }
    }
}

fn take_reference(fields: &mut ObjectFields, name: &str) -> Result<HashReference, LiteralError> {
    match fields.remove(name) {
        Some(FieldValue::Reference(r)) => Ok(r),
        Some(FieldValue::Object(_)) => Err(LiteralError::invalid(format!(
            "field {name:?} embeds an object where a reference is required"
        ))),
        _ => Err(LiteralError::invalid(format!(
            "missing reference field {name:?}"
        ))),
    }
}

fn take_set(fields: &mut ObjectFields, name: &str) -> Result<HashedSet, LiteralError> {
    match fields.remove(name) {
        Some(FieldValue::Set(s)) => Ok(s),
        _ => Err(LiteralError::invalid(format!("missing set field {name:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::object_hash;

    fn reference(tag: u8, class: &str) -> HashReference {
        HashReference::new(Hash::new([tag]), class)
    }

    #[test]
    fn cascade_hash_is_deterministic() {
        let target = reference(1, "GuestBook");
        let op = reference(2, "SignOp");
        let reason = InvalidateAfterOp::new(
            target.clone(),
            reference(4, "SignOp"),
            HashedSet::new(),
            HashedSet::new(),
        );
        let a = CascadedInvalidateOp::create(target.clone(), op.clone(), Arc::new(reason.clone()));
        let b = CascadedInvalidateOp::create(target, op, Arc::new(reason));
        assert_eq!(object_hash(&a).unwrap(), object_hash(&b).unwrap());
    }

    #[test]
    fn header_hash_covers_predecessors() {
        let op = Hash::new(b"op");
        let root = OpHeader::new(Hash::new(b"root"), BTreeMap::new());
        let mut prevs = BTreeMap::new();
        prevs.insert(root.op_hash, root.header_hash);
        let with_prev = OpHeader::new(op, prevs);
        let without_prev = OpHeader::new(op, BTreeMap::new());
        assert_ne!(with_prev.header_hash, without_prev.header_hash);
        // deterministic
        let mut prevs = BTreeMap::new();
        prevs.insert(root.op_hash, root.header_hash);
        assert_eq!(OpHeader::new(op, prevs).header_hash, with_prev.header_hash);
    }
}
