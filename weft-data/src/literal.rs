//! The persisted form of a hashed object.

use serde::{Deserialize, Serialize};
use weft_base::{Hash, Value};

/// Marker recorded under `_type` in every object literal value.
pub const TYPE_OBJECT: &str = "hashed_object";
/// Marker for an embedded (owned) subobject placeholder.
pub const TYPE_DEPENDENCY: &str = "hashed_object_dependency";
/// Marker for a non-owning reference.
pub const TYPE_REFERENCE: &str = "hashed_object_reference";
/// Marker for a canonical set.
pub const TYPE_SET: &str = "hashed_set";
/// Marker for a canonical map.
pub const TYPE_MAP: &str = "hashed_map";

/// How a dependency is held by the referring literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// The dependency's full literal travels with the referring one.
    Literal,
    /// Only the hash and class are recorded.
    Reference,
}

/// One edge in a literal's dependency list.
///
/// `path` is the dot-joined field path where the dependency appears; for
/// dependencies folded in from an embedded subobject the subobject's own
/// paths are prefixed with the field that holds it, and `direct` is false.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dependency {
    /// Field path within the referring literal.
    pub path: String,
    /// Hash of the depended-upon object.
    pub hash: Hash,
    /// Class tag of the depended-upon object.
    pub class_name: String,
    /// Whether the dependency travels as a literal or a bare reference.
    pub kind: DependencyKind,
    /// Whether the dependency appears as a direct field of the referring
    /// object, as opposed to inside an embedded subobject.
    pub direct: bool,
}

impl Dependency {
    /// The last segment of the dependency path (the field name closest to
    /// the depended-upon object). Index queries match on this as well as on
    /// the full path.
    pub fn tail_path(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }
}

/// The canonical, persistable form of a hashed object: its hash, its
/// canonical value, and everything it depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Literal {
    /// The object's hash.
    pub hash: Hash,
    /// The canonical value the hash covers.
    pub value: Value,
    /// The object's class tag, duplicated out of `value` for indexing.
    pub class_name: String,
    /// All dependencies, direct and folded-in, in canonical order.
    pub dependencies: Vec<Dependency>,
    /// Hash of the author identity, when the object is authored.
    pub author: Option<Hash>,
    /// Hex signature over the object's hash, when signed.
    pub signature: Option<String>,
}

impl Literal {
    /// Flags recorded under `_flags` in the literal value.
    pub fn flags(&self) -> Vec<&str> {
        self.value
            .as_object()
            .and_then(|map| map.get("_flags"))
            .and_then(Value::as_array)
            .map(|flags| flags.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Whether this literal carries the given flag.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags().contains(&flag)
    }

    /// The dependencies that travel as literals.
    pub fn literal_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Literal)
    }

    /// Direct dependencies at the given field path.
    pub fn direct_dependencies_at(&self, path: &str) -> impl Iterator<Item = &Dependency> + '_ {
        let path = path.to_string();
        self.dependencies
            .iter()
            .filter(move |d| d.direct && d.path == path)
    }
}
