//! In-memory backend.
//!
//! Literals live in hash maps, the secondary indexes in sorted sets keyed by
//! the literal hash's hex form (which doubles as the paging cursor). Shared
//! state sits behind a single lock; each `store` call is one write-lock
//! scope, which gives the atomicity the contract asks for.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;
use weft_base::Hash;
use weft_data::{Dependency, Literal, OpHeader, OP_FLAG};

use crate::backend::{
    Backend, BackendError, SearchParams, SearchResults, SortOrder, StoredCallback, TerminalOpsInfo,
};

/// A [`Backend`] holding everything in process memory.
#[derive(Clone)]
pub struct MemoryBackend {
    name: String,
    state: Arc<RwLock<State>>,
    callback: Arc<RwLock<Option<StoredCallback>>>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("callback", &self.callback.read().is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct State {
    closed: bool,
    literals: HashMap<Hash, Literal>,
    headers: HashMap<Hash, OpHeader>,
    header_hash_index: HashMap<Hash, Hash>,
    /// (class name, literal hash hex)
    by_class: BTreeSet<(String, String)>,
    /// (path key, referenced hash hex, literal hash hex)
    by_reference: BTreeSet<(String, String, String)>,
    /// (class name, path key, referenced hash hex, literal hash hex)
    by_class_reference: BTreeSet<(String, String, String, String)>,
    terminal: HashMap<Hash, TerminalState>,
}

#[derive(Debug, Default)]
struct TerminalState {
    last_op: Option<Hash>,
    terminals: BTreeSet<Hash>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryBackend {
    /// Create a named in-memory backend.
    pub fn new(name: impl Into<String>) -> Self {
        MemoryBackend {
            name: name.into(),
            state: Default::default(),
            callback: Default::default(),
        }
    }

    /// Number of stored literals.
    pub fn len(&self) -> usize {
        self.state.read().literals.len()
    }

    /// Whether nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Index keys a dependency is findable under: its full path and, when the
/// path is nested, its final segment.
fn path_keys(dep: &Dependency) -> Vec<&str> {
    let tail = dep.tail_path();
    if tail == dep.path {
        vec![dep.path.as_str()]
    } else {
        vec![dep.path.as_str(), tail]
    }
}

/// Apply order, cursor and limit to the sort keys of one index prefix.
/// The cursor is set iff further results exist past the returned page.
fn page<'a>(
    keys: impl DoubleEndedIterator<Item = &'a String> + 'a,
    params: &'a SearchParams,
) -> (Vec<String>, Option<String>) {
    let limit = params.limit.unwrap_or(usize::MAX);
    let cursor = params.start.as_deref();
    let keys: Box<dyn Iterator<Item = &'a String> + 'a> = match params.order {
        SortOrder::Ascending => {
            Box::new(keys.filter(move |k| cursor.map_or(true, |c| k.as_str() > c)))
        }
        SortOrder::Descending => {
            Box::new(keys.rev().filter(move |k| cursor.map_or(true, |c| k.as_str() < c)))
        }
    };
    let mut out: Vec<String> = Vec::new();
    for key in keys {
        if out.len() >= limit {
            return (out.clone(), out.last().cloned());
        }
        out.push(key.clone());
    }
    (out, None)
}

impl State {
    fn results(&self, hashes: Vec<String>, end_cursor: Option<String>) -> SearchResults {
        let literals = hashes
            .iter()
            .filter_map(|hex| hex.parse().ok())
            .filter_map(|hash: Hash| self.literals.get(&hash).cloned())
            .collect();
        SearchResults {
            literals,
            end_cursor,
        }
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn store(&self, literal: &Literal, header: Option<&OpHeader>) -> Result<(), BackendError> {
        let newly_stored = {
            let mut state = self.state.write();
            if state.closed {
                return Err(BackendError(format!("backend {} is closed", self.name)));
            }
            if state.literals.contains_key(&literal.hash) {
                false
            } else {
                let hex = literal.hash.to_hex();
                state
                    .by_class
                    .insert((literal.class_name.clone(), hex.clone()));
                for dep in &literal.dependencies {
                    let referenced = dep.hash.to_hex();
                    for key in path_keys(dep) {
                        state.by_reference.insert((
                            key.to_string(),
                            referenced.clone(),
                            hex.clone(),
                        ));
                        state.by_class_reference.insert((
                            literal.class_name.clone(),
                            key.to_string(),
                            referenced.clone(),
                            hex.clone(),
                        ));
                    }
                }
                if literal.has_flag(OP_FLAG) {
                    if let Some(target) = literal
                        .dependencies
                        .iter()
                        .find(|d| d.direct && d.path == "target_object")
                    {
                        let entry = state.terminal.entry(target.hash).or_default();
                        for prev in literal
                            .dependencies
                            .iter()
                            .filter(|d| d.direct && d.path == "prev_ops")
                        {
                            entry.terminals.remove(&prev.hash);
                        }
                        entry.terminals.insert(literal.hash);
                        entry.last_op = Some(literal.hash);
                    }
                    if let Some(header) = header {
                        state
                            .header_hash_index
                            .insert(header.header_hash, header.op_hash);
                        state.headers.insert(header.op_hash, header.clone());
                    }
                }
                state.literals.insert(literal.hash, literal.clone());
                true
            }
        };
        if newly_stored {
            trace!(backend = %self.name, hash = %literal.hash, class = %literal.class_name, "stored literal");
            let callback = self.callback.read().clone();
            if let Some(callback) = callback {
                callback(literal);
            }
        }
        Ok(())
    }

    fn load(&self, hash: &Hash) -> Result<Option<Literal>, BackendError> {
        Ok(self.state.read().literals.get(hash).cloned())
    }

    fn load_terminal_ops(&self, target: &Hash) -> Result<Option<TerminalOpsInfo>, BackendError> {
        Ok(self.state.read().terminal.get(target).map(|t| TerminalOpsInfo {
            last_op: t.last_op,
            terminal_ops: t.terminals.iter().copied().collect(),
        }))
    }

    fn load_op_header(&self, op_hash: &Hash) -> Result<Option<OpHeader>, BackendError> {
        Ok(self.state.read().headers.get(op_hash).cloned())
    }

    fn load_op_header_by_header_hash(
        &self,
        header_hash: &Hash,
    ) -> Result<Option<OpHeader>, BackendError> {
        let state = self.state.read();
        Ok(state
            .header_hash_index
            .get(header_hash)
            .and_then(|op_hash| state.headers.get(op_hash))
            .cloned())
    }

    fn search_by_class(
        &self,
        class_name: &str,
        params: &SearchParams,
    ) -> Result<SearchResults, BackendError> {
        let state = self.state.read();
        let low = Bound::Included((class_name.to_string(), String::new()));
        let keys: Vec<&String> = state
            .by_class
            .range((low, Bound::Unbounded))
            .take_while(|(class, _)| class == class_name)
            .map(|(_, hex)| hex)
            .collect();
        let (hashes, cursor) = page(keys.into_iter(), params);
        Ok(state.results(hashes, cursor))
    }

    fn search_by_reference(
        &self,
        path: &str,
        hash: &Hash,
        params: &SearchParams,
    ) -> Result<SearchResults, BackendError> {
        let state = self.state.read();
        let referenced = hash.to_hex();
        let low = Bound::Included((path.to_string(), referenced.clone(), String::new()));
        let keys: Vec<&String> = state
            .by_reference
            .range((low, Bound::Unbounded))
            .take_while(|(p, r, _)| p == path && *r == referenced)
            .map(|(_, _, hex)| hex)
            .collect();
        let (hashes, cursor) = page(keys.into_iter(), params);
        Ok(state.results(hashes, cursor))
    }

    fn search_by_referencing_class(
        &self,
        class_name: &str,
        path: &str,
        hash: &Hash,
        params: &SearchParams,
    ) -> Result<SearchResults, BackendError> {
        let state = self.state.read();
        let referenced = hash.to_hex();
        let low = Bound::Included((
            class_name.to_string(),
            path.to_string(),
            referenced.clone(),
            String::new(),
        ));
        let keys: Vec<&String> = state
            .by_class_reference
            .range((low, Bound::Unbounded))
            .take_while(|(c, p, r, _)| c == class_name && p == path && *r == referenced)
            .map(|(_, _, _, hex)| hex)
            .collect();
        let (hashes, cursor) = page(keys.into_iter(), params);
        Ok(state.results(hashes, cursor))
    }

    fn set_stored_callback(&self, callback: StoredCallback) {
        *self.callback.write() = Some(callback);
    }

    fn close(&self) {
        self.state.write().closed = true;
    }
}
