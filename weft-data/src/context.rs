//! Literalization contexts: turning objects into literals and back.
//!
//! A [`Context`] is the working set of one (de)literalization run: every
//! literal and reconstructed object encountered so far, keyed by hash. The
//! same context is shared across a batch of related loads so common
//! subgraphs are reconstructed once.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::trace;
use weft_base::{Hash, Value};

use crate::error::LiteralError;
use crate::identity::Identity;
use crate::literal::{
    Dependency, DependencyKind, Literal, TYPE_DEPENDENCY, TYPE_MAP, TYPE_OBJECT, TYPE_REFERENCE,
    TYPE_SET,
};
use crate::object::{FieldValue, HashedObject, ObjectFields, ObjectMeta, ObjectRc, Resources};
use crate::registry::lookup_class;
use crate::{HashReference, HashedMap, HashedSet};

/// Working set for literalization and reconstruction.
#[derive(Debug, Default)]
pub struct Context {
    /// Literals by hash.
    pub literals: HashMap<Hash, Literal>,
    /// Reconstructed or source objects by hash.
    pub objects: HashMap<Hash, ObjectRc>,
    /// Hashes of the objects this context was built around.
    pub root_hashes: Vec<Hash>,
    /// Optional shared resources (aliasing).
    pub resources: Option<Resources>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context carrying shared resources.
    pub fn with_resources(resources: Resources) -> Self {
        Context {
            resources: Some(resources),
            ..Default::default()
        }
    }

    /// Literalize `obj` (and its whole owned subtree) into this context and
    /// record it as a root. Returns the root hash.
    pub fn literalize(&mut self, obj: &dyn HashedObject) -> Result<Hash, LiteralError> {
        let hash = literalize_into(obj, self)?;
        if !self.root_hashes.contains(&hash) {
            self.root_hashes.push(hash);
        }
        Ok(hash)
    }

    /// Add an externally loaded literal to the working set.
    pub fn insert_literal(&mut self, literal: Literal) {
        self.literals.insert(literal.hash, literal);
    }

    /// Reconstruct the object stored under `hash`, without validation.
    ///
    /// Idempotent: repeated calls for the same hash return the same handle.
    pub fn object(&mut self, hash: Hash) -> Result<ObjectRc, LiteralError> {
        deliteralize(hash, self, false)
    }

    /// Reconstruct with full validation: recomputed hash, signature, and the
    /// class `validate` hook. On failure, objects added by this call are
    /// evicted so the context holds no partially validated state.
    ///
    /// Not re-entrant over a shared context.
    pub fn object_with_validation(&mut self, hash: Hash) -> Result<ObjectRc, LiteralError> {
        let before: HashSet<Hash> = self.objects.keys().copied().collect();
        match deliteralize(hash, self, true) {
            Ok(obj) => Ok(obj),
            Err(err) => {
                self.objects.retain(|h, _| before.contains(h));
                Err(err)
            }
        }
    }
}

/// Compute the hash of an in-memory object without keeping the context.
pub fn object_hash(obj: &dyn HashedObject) -> Result<Hash, LiteralError> {
    let mut ctx = Context::new();
    literalize_into(obj, &mut ctx)
}

/// Clone an object by literalizing it into a fresh context and
/// reconstructing from there.
///
/// Signatures and authorship travel with the literals, so the clone hashes
/// and verifies exactly like the original.
pub fn clone_object(obj: &dyn HashedObject) -> Result<ObjectRc, LiteralError> {
    let mut ctx = Context::new();
    let hash = literalize_into(obj, &mut ctx)?;
    // drop the source instances so reconstruction builds fresh ones
    ctx.objects.clear();
    deliteralize(hash, &mut ctx, false)
}

/// Content hash of one field value, used to canonically order collection
/// members. Nested objects hash through their placeholder form.
pub(crate) fn field_value_hash(fv: &FieldValue) -> Result<Hash, LiteralError> {
    let mut enc = Encoder {
        ctx: None,
        deps: BTreeSet::new(),
    };
    let value = enc.encode(fv, "")?;
    Ok(Hash::of_value(&value)?)
}

pub(crate) fn literalize_into(
    obj: &dyn HashedObject,
    ctx: &mut Context,
) -> Result<Hash, LiteralError> {
    let mut fields = obj.fields();
    for name in fields.keys() {
        if name.starts_with('_') || name.contains('.') || name.is_empty() {
            return Err(LiteralError::invalid(format!(
                "illegal field name {name:?} in class {:?}",
                obj.class_name()
            )));
        }
    }
    if let Some(id) = &obj.meta().id {
        if fields
            .insert("id".to_string(), FieldValue::String(id.clone()))
            .is_some()
        {
            return Err(LiteralError::invalid("class emitted a field named \"id\""));
        }
    }
    if let Some(author) = &obj.meta().author {
        let author_rc: ObjectRc = author.clone();
        if fields
            .insert("author".to_string(), FieldValue::Object(author_rc))
            .is_some()
        {
            return Err(LiteralError::invalid(
                "class emitted a field named \"author\"",
            ));
        }
    }

    let (field_values, deps) = {
        let mut enc = Encoder {
            ctx: Some(ctx),
            deps: BTreeSet::new(),
        };
        let mut field_values = BTreeMap::new();
        for (name, fv) in &fields {
            field_values.insert(name.clone(), enc.encode(fv, name)?);
        }
        (field_values, enc.deps)
    };

    let value = Value::object([
        ("_class", Value::from(obj.class_name())),
        ("_fields", Value::Object(field_values)),
        (
            "_flags",
            Value::Array(obj.flags().into_iter().map(Value::from).collect()),
        ),
        ("_type", Value::from(TYPE_OBJECT)),
    ]);

    let hash = match obj.custom_hash() {
        Some(hash) => hash,
        None => Hash::of_value(&value)?,
    };

    let author_hash = match &obj.meta().author {
        Some(author) => Some(author.id_hash()),
        None => None,
    };

    let literal = Literal {
        hash,
        value,
        class_name: obj.class_name().to_string(),
        dependencies: deps.into_iter().collect(),
        author: author_hash,
        signature: obj.meta().last_signature().map(str::to_string),
    };

    obj.meta().last_hash.set(hash).ok();

    let rc = match ctx
        .resources
        .as_ref()
        .and_then(|r| r.aliasing.get(&hash).cloned())
    {
        Some(alias) => alias,
        None => obj.clone_rc(),
    };
    trace!(class = obj.class_name(), %hash, "literalized");
    ctx.literals.insert(hash, literal);
    ctx.objects.insert(hash, rc);
    Ok(hash)
}

struct Encoder<'a> {
    /// When absent, only hashes are computed and dependencies are not
    /// collected (collection member hashing).
    ctx: Option<&'a mut Context>,
    deps: BTreeSet<Dependency>,
}

impl Encoder<'_> {
    fn encode(&mut self, fv: &FieldValue, path: &str) -> Result<Value, LiteralError> {
        match fv {
            FieldValue::Bool(b) => Ok(Value::Bool(*b)),
            FieldValue::Number(n) => Ok(Value::Number(*n)),
            FieldValue::String(s) => Ok(Value::String(s.clone())),
            FieldValue::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| self.encode(item, path))
                    .collect::<Result<_, _>>()?,
            )),
            FieldValue::Record(map) => {
                let mut out = BTreeMap::new();
                for (key, item) in map {
                    if key.starts_with('_') {
                        return Err(LiteralError::invalid(format!(
                            "record key {key:?} starts with underscore"
                        )));
                    }
                    out.insert(key.clone(), self.encode(item, path)?);
                }
                Ok(Value::Object(out))
            }
            FieldValue::Object(child) => {
                let hash = match self.ctx.as_deref_mut() {
                    Some(ctx) => {
                        let hash = literalize_into(&**child, ctx)?;
                        let transitive: Vec<Dependency> = ctx
                            .literals
                            .get(&hash)
                            .map(|l| l.dependencies.clone())
                            .unwrap_or_default();
                        for dep in transitive {
                            self.deps.insert(Dependency {
                                path: format!("{path}.{}", dep.path),
                                hash: dep.hash,
                                class_name: dep.class_name,
                                kind: dep.kind,
                                direct: false,
                            });
                        }
                        hash
                    }
                    None => object_hash(&**child)?,
                };
                self.deps.insert(Dependency {
                    path: path.to_string(),
                    hash,
                    class_name: child.class_name().to_string(),
                    kind: DependencyKind::Literal,
                    direct: true,
                });
                Ok(Value::object([
                    ("_hash", Value::from(hash.to_hex())),
                    ("_type", Value::from(TYPE_DEPENDENCY)),
                ]))
            }
            FieldValue::Reference(reference) => {
                self.deps.insert(Dependency {
                    path: path.to_string(),
                    hash: reference.hash,
                    class_name: reference.class_name.clone(),
                    kind: DependencyKind::Reference,
                    direct: true,
                });
                Ok(Value::object([
                    ("_class", Value::from(reference.class_name.as_str())),
                    ("_hash", Value::from(reference.hash.to_hex())),
                    ("_type", Value::from(TYPE_REFERENCE)),
                ]))
            }
            FieldValue::Set(set) => {
                let elements = set
                    .iter()
                    .map(|member| self.encode(member, path))
                    .collect::<Result<_, _>>()?;
                Ok(Value::object([
                    ("_elements", Value::Array(elements)),
                    ("_type", Value::from(TYPE_SET)),
                ]))
            }
            FieldValue::Map(map) => {
                let entries = map
                    .iter()
                    .map(|(key, value)| {
                        Ok(Value::Array(vec![
                            self.encode(key, path)?,
                            self.encode(value, path)?,
                        ]))
                    })
                    .collect::<Result<_, LiteralError>>()?;
                Ok(Value::object([
                    ("_entries", Value::Array(entries)),
                    ("_type", Value::from(TYPE_MAP)),
                ]))
            }
        }
    }
}

pub(crate) fn deliteralize(
    hash: Hash,
    ctx: &mut Context,
    validate: bool,
) -> Result<ObjectRc, LiteralError> {
    if let Some(obj) = ctx.objects.get(&hash) {
        return Ok(obj.clone());
    }
    let literal = ctx
        .literals
        .get(&hash)
        .cloned()
        .ok_or(LiteralError::MissingDependency { hash })?;

    for dep in literal.literal_dependencies() {
        deliteralize(dep.hash, ctx, validate)?;
    }

    let value_map = literal
        .value
        .as_object()
        .ok_or_else(|| LiteralError::invalid("literal value is not an object"))?;
    match value_map.get("_type").and_then(Value::as_str) {
        Some(TYPE_OBJECT) => {}
        other => {
            return Err(LiteralError::invalid(format!(
                "unexpected literal type tag {other:?}"
            )))
        }
    }
    let class_name = value_map
        .get("_class")
        .and_then(Value::as_str)
        .ok_or_else(|| LiteralError::invalid("literal has no class tag"))?
        .to_string();
    if class_name != literal.class_name {
        return Err(LiteralError::invalid(format!(
            "literal class tag {class_name:?} disagrees with recorded class {:?}",
            literal.class_name
        )));
    }
    let fields_value = value_map
        .get("_fields")
        .and_then(Value::as_object)
        .ok_or_else(|| LiteralError::invalid("literal has no field map"))?;

    let mut fields = ObjectFields::new();
    for (name, value) in fields_value {
        fields.insert(name.clone(), decode_field_value(value, ctx)?);
    }

    let mut meta = ObjectMeta::default();
    match fields.remove("id") {
        None => {}
        Some(FieldValue::String(id)) => meta.id = Some(id),
        Some(_) => return Err(LiteralError::invalid("id field is not a string")),
    }
    if let Some(author_field) = fields.remove("author") {
        let author_obj = author_field
            .as_object()
            .ok_or_else(|| LiteralError::invalid("author field is not an embedded object"))?;
        let identity = author_obj
            .as_any()
            .downcast_ref::<Identity>()
            .cloned()
            .ok_or_else(|| LiteralError::invalid("author is not an identity"))?;
        meta.author = Some(Arc::new(identity));
        meta.sign_on_save = true;
    }

    let ctor =
        lookup_class(&class_name).ok_or(LiteralError::UnknownClass { name: class_name })?;
    let mut obj = ctor(fields, meta)?;
    obj.init();
    obj.meta().last_hash.set(hash).ok();
    if let Some(signature) = &literal.signature {
        obj.meta().last_signature.set(signature.clone()).ok();
    }

    if validate {
        let computed = object_hash(&*obj)?;
        if computed != hash {
            return Err(LiteralError::WrongHash {
                declared: hash,
                computed,
            });
        }
        if literal.author.is_some() {
            let signature = literal
                .signature
                .as_deref()
                .ok_or(LiteralError::MissingSignature { hash })?;
            let author = obj.meta().author.clone().expect("author reconstructed");
            if !author.verify(&hash, signature) {
                return Err(LiteralError::BadSignature { hash });
            }
        }
        if !obj.validate(ctx) {
            return Err(LiteralError::ValidationFailed {
                class_name: obj.class_name().to_string(),
            });
        }
    }

    let rc: ObjectRc = match ctx
        .resources
        .as_ref()
        .and_then(|r| r.aliasing.get(&hash).cloned())
    {
        Some(alias) => alias,
        None => Arc::from(obj),
    };
    trace!(class = rc.class_name(), %hash, validate, "reconstructed");
    ctx.objects.insert(hash, rc.clone());
    Ok(rc)
}

fn decode_field_value(value: &Value, ctx: &Context) -> Result<FieldValue, LiteralError> {
    match value {
        Value::Bool(b) => Ok(FieldValue::Bool(*b)),
        Value::Number(n) => Ok(FieldValue::Number(*n)),
        Value::String(s) => Ok(FieldValue::String(s.clone())),
        Value::Array(items) => Ok(FieldValue::Array(
            items
                .iter()
                .map(|item| decode_field_value(item, ctx))
                .collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => match map.get("_type").and_then(Value::as_str) {
            None => {
                let mut out = BTreeMap::new();
                for (key, item) in map {
                    if key.starts_with('_') {
                        return Err(LiteralError::invalid(format!(
                            "record key {key:?} starts with underscore"
                        )));
                    }
                    out.insert(key.clone(), decode_field_value(item, ctx)?);
                }
                Ok(FieldValue::Record(out))
            }
            Some(TYPE_DEPENDENCY) => {
                let hash = decode_hash(map)?;
                let obj = ctx
                    .objects
                    .get(&hash)
                    .cloned()
                    .ok_or(LiteralError::MissingDependency { hash })?;
                Ok(FieldValue::Object(obj))
            }
            Some(TYPE_REFERENCE) => {
                let hash = decode_hash(map)?;
                let class_name = map
                    .get("_class")
                    .and_then(Value::as_str)
                    .ok_or_else(|| LiteralError::invalid("reference has no class tag"))?;
                Ok(FieldValue::Reference(HashReference::new(hash, class_name)))
            }
            Some(TYPE_SET) => {
                let elements = map
                    .get("_elements")
                    .and_then(Value::as_array)
                    .ok_or_else(|| LiteralError::invalid("set has no element list"))?;
                let members = elements
                    .iter()
                    .map(|item| decode_field_value(item, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(FieldValue::Set(HashedSet::from_members(members)?))
            }
            Some(TYPE_MAP) => {
                let entries = map
                    .get("_entries")
                    .and_then(Value::as_array)
                    .ok_or_else(|| LiteralError::invalid("map has no entry list"))?;
                let mut out = HashedMap::new();
                for entry in entries {
                    let pair = entry
                        .as_array()
                        .filter(|pair| pair.len() == 2)
                        .ok_or_else(|| LiteralError::invalid("map entry is not a pair"))?;
                    out.insert(
                        decode_field_value(&pair[0], ctx)?,
                        decode_field_value(&pair[1], ctx)?,
                    )?;
                }
                Ok(FieldValue::Map(out))
            }
            Some(other) => Err(LiteralError::invalid(format!(
                "unexpected field type tag {other:?}"
            ))),
        },
    }
}

fn decode_hash(map: &BTreeMap<String, Value>) -> Result<Hash, LiteralError> {
    map.get("_hash")
        .and_then(Value::as_str)
        .and_then(|hex| hex.parse().ok())
        .ok_or_else(|| LiteralError::invalid("missing or malformed hash"))
}
