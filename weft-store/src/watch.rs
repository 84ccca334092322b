//! Stored-literal watch tables.
//!
//! Three callback tables, keyed by class, by `(path, referenced hash)` and
//! by `(class, path, referenced hash)`. Every literal the backend persists
//! is matched against all three; callbacks fire in registration order and a
//! panicking callback does not suppress the rest.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;
use weft_base::Hash;
use weft_data::Literal;

/// Callback invoked with the literal that matched.
pub type WatchCallback = Arc<dyn Fn(&Literal) + Send + Sync>;

/// Token for removing a registered watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchToken(u64);

#[derive(Default)]
pub(crate) struct Watchers {
    inner: RwLock<WatchTables>,
}

#[derive(Default)]
struct WatchTables {
    next_id: u64,
    by_class: HashMap<String, Vec<(u64, WatchCallback)>>,
    by_reference: HashMap<(String, Hash), Vec<(u64, WatchCallback)>>,
    by_class_reference: HashMap<(String, String, Hash), Vec<(u64, WatchCallback)>>,
}

impl WatchTables {
    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Watchers {
    pub(crate) fn watch_class(&self, class_name: &str, callback: WatchCallback) -> WatchToken {
        let mut tables = self.inner.write();
        let id = tables.next();
        tables
            .by_class
            .entry(class_name.to_string())
            .or_default()
            .push((id, callback));
        WatchToken(id)
    }

    pub(crate) fn watch_references(
        &self,
        path: &str,
        hash: Hash,
        callback: WatchCallback,
    ) -> WatchToken {
        let mut tables = self.inner.write();
        let id = tables.next();
        tables
            .by_reference
            .entry((path.to_string(), hash))
            .or_default()
            .push((id, callback));
        WatchToken(id)
    }

    pub(crate) fn watch_class_references(
        &self,
        class_name: &str,
        path: &str,
        hash: Hash,
        callback: WatchCallback,
    ) -> WatchToken {
        let mut tables = self.inner.write();
        let id = tables.next();
        tables
            .by_class_reference
            .entry((class_name.to_string(), path.to_string(), hash))
            .or_default()
            .push((id, callback));
        WatchToken(id)
    }

    pub(crate) fn remove(&self, token: WatchToken) -> bool {
        let mut tables = self.inner.write();
        let mut removed = false;
        for list in tables.by_class.values_mut() {
            let before = list.len();
            list.retain(|(id, _)| *id != token.0);
            removed |= list.len() != before;
        }
        for list in tables.by_reference.values_mut() {
            let before = list.len();
            list.retain(|(id, _)| *id != token.0);
            removed |= list.len() != before;
        }
        for list in tables.by_class_reference.values_mut() {
            let before = list.len();
            list.retain(|(id, _)| *id != token.0);
            removed |= list.len() != before;
        }
        removed
    }

    pub(crate) fn fire(&self, literal: &Literal) {
        let mut matched: Vec<(u64, WatchCallback)> = Vec::new();
        {
            let tables = self.inner.read();
            if let Some(list) = tables.by_class.get(&literal.class_name) {
                matched.extend(list.iter().cloned());
            }
            for dep in &literal.dependencies {
                let mut keys = vec![dep.path.as_str()];
                let tail = dep.tail_path();
                if tail != dep.path {
                    keys.push(tail);
                }
                for key in keys {
                    if let Some(list) = tables.by_reference.get(&(key.to_string(), dep.hash)) {
                        matched.extend(list.iter().cloned());
                    }
                    if let Some(list) = tables.by_class_reference.get(&(
                        literal.class_name.clone(),
                        key.to_string(),
                        dep.hash,
                    )) {
                        matched.extend(list.iter().cloned());
                    }
                }
            }
        }
        // fire in registration order, once per callback even if several
        // dependencies matched it
        matched.sort_by_key(|(id, _)| *id);
        matched.dedup_by_key(|(id, _)| *id);
        for (_, callback) in matched {
            if catch_unwind(AssertUnwindSafe(|| callback(literal))).is_err() {
                warn!(hash = %literal.hash, "watch callback panicked");
            }
        }
    }
}
