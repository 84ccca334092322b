//! Test classes shared by the store integration tests.
#![allow(dead_code)]

use std::sync::{Arc, OnceLock};

use weft_data::{
    register_class, Context, FieldValue, HashReference, HashedObject, HashedSet, Identity,
    LiteralError, Mutable, ObjectFields, ObjectMeta, ObjectRc, Op, OpQueue, OP_FLAG,
};
use weft_store::{MemoryBackend, Store};

pub fn new_store(name: &str) -> Store {
    register_test_classes();
    Store::new(Arc::new(MemoryBackend::new(name)))
}

pub fn register_test_classes() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        register_class(ChatRoom::CLASS, ChatRoom::construct);
        register_class(GuestBook::CLASS, GuestBook::construct);
        register_class(SignOp::CLASS, SignOp::construct);
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init()
            .ok();
    });
}

/// An authored chat room.
#[derive(Debug, Clone)]
pub struct ChatRoom {
    meta: ObjectMeta,
    pub topic: String,
}

impl ChatRoom {
    pub const CLASS: &'static str = "ChatRoom";

    pub fn new(topic: &str, author: Arc<Identity>) -> Self {
        ChatRoom {
            meta: ObjectMeta::authored(author),
            topic: topic.to_string(),
        }
    }

    fn construct(
        mut fields: ObjectFields,
        meta: ObjectMeta,
    ) -> Result<Box<dyn HashedObject>, LiteralError> {
        let topic = match fields.remove("topic") {
            Some(FieldValue::String(topic)) => topic,
            _ => return Err(LiteralError::InvalidLiteral {
                reason: "chat room has no topic".into(),
            }),
        };
        Ok(Box::new(ChatRoom { meta, topic }))
    }
}

impl HashedObject for ChatRoom {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn fields(&self) -> ObjectFields {
        let mut fields = ObjectFields::new();
        fields.insert("topic".to_string(), FieldValue::String(self.topic.clone()));
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

    fn validate(&self, _context: &Context) -> bool {
        !self.topic.is_empty()
    }
}

/// A mutable guest book; visitors sign it with [`SignOp`]s.
#[derive(Debug, Clone)]
pub struct GuestBook {
    meta: ObjectMeta,
    pub name: String,
    queue: OpQueue,
}

impl GuestBook {
    pub const CLASS: &'static str = "GuestBook";

    pub fn new(name: &str) -> Self {
        GuestBook {
            meta: ObjectMeta::default(),
            name: name.to_string(),
            queue: OpQueue::new(),
        }
    }

    fn construct(
        mut fields: ObjectFields,
        meta: ObjectMeta,
    ) -> Result<Box<dyn HashedObject>, LiteralError> {
        let name = match fields.remove("name") {
            Some(FieldValue::String(name)) => name,
            _ => return Err(LiteralError::InvalidLiteral {
                reason: "guest book has no name".into(),
            }),
        };
        Ok(Box::new(GuestBook {
            meta,
            name,
            queue: OpQueue::new(),
        }))
    }
}

impl HashedObject for GuestBook {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn fields(&self) -> ObjectFields {
        let mut fields = ObjectFields::new();
        fields.insert("name".to_string(), FieldValue::String(self.name.clone()));
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

    fn as_mutable(&self) -> Option<&dyn Mutable> {
        Some(self)
    }
}

impl Mutable for GuestBook {
    fn enqueue_op(&self, op: ObjectRc) {
        self.queue.push(op);
    }

    fn take_queued_ops(&self) -> Vec<ObjectRc> {
        self.queue.drain()
    }

    fn has_queued_ops(&self) -> bool {
        !self.queue.is_empty()
    }
}

/// One signature in a guest book.
#[derive(Debug, Clone)]
pub struct SignOp {
    meta: ObjectMeta,
    target_object: HashReference,
    prev_ops: HashedSet,
    causal_ops: Option<HashedSet>,
    pub guest: String,
}

impl SignOp {
    pub const CLASS: &'static str = "SignOp";

    pub fn new(
        target_object: HashReference,
        guest: &str,
        prev_ops: HashedSet,
        causal_ops: Option<HashedSet>,
    ) -> Self {
        SignOp {
            meta: ObjectMeta::default(),
            target_object,
            prev_ops,
            causal_ops,
            guest: guest.to_string(),
        }
    }

    fn construct(
        mut fields: ObjectFields,
        meta: ObjectMeta,
    ) -> Result<Box<dyn HashedObject>, LiteralError> {
        let target_object = match fields.remove("target_object") {
            Some(FieldValue::Reference(r)) => r,
            _ => return Err(LiteralError::InvalidLiteral {
                reason: "sign op has no target".into(),
            }),
        };
        let prev_ops = match fields.remove("prev_ops") {
            Some(FieldValue::Set(s)) => s,
            _ => return Err(LiteralError::InvalidLiteral {
                reason: "sign op has no predecessor set".into(),
            }),
        };
        let causal_ops = match fields.remove("causal_ops") {
            Some(FieldValue::Set(s)) => Some(s),
            None => None,
            Some(_) => return Err(LiteralError::InvalidLiteral {
                reason: "causal op set has the wrong shape".into(),
            }),
        };
        let guest = match fields.remove("guest") {
            Some(FieldValue::String(guest)) => guest,
            _ => return Err(LiteralError::InvalidLiteral {
                reason: "sign op has no guest".into(),
            }),
        };
        Ok(Box::new(SignOp {
            meta,
            target_object,
            prev_ops,
            causal_ops,
            guest,
        }))
    }
}

impl HashedObject for SignOp {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn fields(&self) -> ObjectFields {
        let mut fields = ObjectFields::new();
        fields.insert(
            "target_object".to_string(),
            FieldValue::Reference(self.target_object.clone()),
        );
        fields.insert(
            "prev_ops".to_string(),
            FieldValue::Set(self.prev_ops.clone()),
        );
        if let Some(causal_ops) = &self.causal_ops {
            fields.insert("causal_ops".to_string(), FieldValue::Set(causal_ops.clone()));
        }
        fields.insert("guest".to_string(), FieldValue::String(self.guest.clone()));
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

    fn as_op(&self) -> Option<&dyn Op> {
        Some(self)
    }
}

impl Op for SignOp {
    fn target_object(&self) -> &HashReference {
        &self.target_object
    }

    fn prev_ops(&self) -> &HashedSet {
        &self.prev_ops
    }

    fn causal_ops(&self) -> Option<&HashedSet> {
        self.causal_ops.as_ref()
    }
}
