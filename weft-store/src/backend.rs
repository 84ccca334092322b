//! The storage backend contract.
//!
//! A backend persists literals (plus op headers) and answers the index
//! queries the store builds on. Each `store` call is atomic and idempotent
//! per literal hash; everything else is read-only.

use std::fmt;
use std::sync::Arc;

use weft_base::Hash;
use weft_data::{Literal, OpHeader};

/// Callback invoked by a backend after every newly persisted literal.
pub type StoredCallback = Arc<dyn Fn(&Literal) + Send + Sync>;

/// Iteration direction for index queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Ascending by sort key (literal hash).
    #[default]
    Ascending,
    /// Descending by sort key.
    Descending,
}

/// Paging parameters for index queries.
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    /// Iteration direction.
    pub order: SortOrder,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Resume strictly past this cursor (an earlier `end_cursor`).
    pub start: Option<String>,
}

impl SearchParams {
    /// Ascending iteration with a limit.
    pub fn batch(limit: usize) -> Self {
        SearchParams {
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// The same query resuming past `cursor`.
    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.start = Some(cursor.into());
        self
    }
}

/// One page of index query results.
#[derive(Debug, Default)]
pub struct SearchResults {
    /// Matching literals in sort-key order.
    pub literals: Vec<Literal>,
    /// Cursor to pass as `start` for the next page; absent when no further
    /// results exist.
    pub end_cursor: Option<String>,
}

/// Terminal-op bookkeeping for one mutable object.
#[derive(Debug, Clone, Default)]
pub struct TerminalOpsInfo {
    /// The op most recently stored for the mutable.
    pub last_op: Option<Hash>,
    /// Ops no stored op names as a predecessor.
    pub terminal_ops: Vec<Hash>,
}

/// Backend failure.
#[derive(Debug, thiserror::Error)]
#[error("backend error: {0}")]
pub struct BackendError(pub String);

/// Persistence contract consumed by [`crate::Store`].
pub trait Backend: fmt::Debug + Send + Sync + 'static {
    /// Instance name (e.g. the store name it was opened under).
    fn name(&self) -> &str;

    /// Implementation name.
    fn backend_name(&self) -> &'static str;

    /// Persist a literal and, for ops, its header. Atomic per call and
    /// idempotent per `literal.hash`: re-storing an existing hash is a
    /// no-op that does not fire the stored callback.
    fn store(&self, literal: &Literal, header: Option<&OpHeader>) -> Result<(), BackendError>;

    /// Fetch a literal by hash.
    fn load(&self, hash: &Hash) -> Result<Option<Literal>, BackendError>;

    /// Terminal-op info for a mutable, if any op was stored for it.
    fn load_terminal_ops(&self, target: &Hash) -> Result<Option<TerminalOpsInfo>, BackendError>;

    /// Fetch the causal header of an op.
    fn load_op_header(&self, op_hash: &Hash) -> Result<Option<OpHeader>, BackendError>;

    /// Fetch a causal header by its own header hash.
    fn load_op_header_by_header_hash(
        &self,
        header_hash: &Hash,
    ) -> Result<Option<OpHeader>, BackendError>;

    /// Literals of a class, in sort-key order.
    fn search_by_class(
        &self,
        class_name: &str,
        params: &SearchParams,
    ) -> Result<SearchResults, BackendError>;

    /// Literals holding a dependency on `hash` at `path`. The path matches
    /// the dependency's full path or its final segment, so folded-in
    /// dependencies are found under the field name they sit at.
    fn search_by_reference(
        &self,
        path: &str,
        hash: &Hash,
        params: &SearchParams,
    ) -> Result<SearchResults, BackendError>;

    /// Like [`search_by_reference`], additionally filtered by the referring
    /// literal's class.
    ///
    /// [`search_by_reference`]: Backend::search_by_reference
    fn search_by_referencing_class(
        &self,
        class_name: &str,
        path: &str,
        hash: &Hash,
        params: &SearchParams,
    ) -> Result<SearchResults, BackendError>;

    /// Register the callback fired after each newly persisted literal.
    fn set_stored_callback(&self, callback: StoredCallback);

    /// Release resources. Subsequent writes fail.
    fn close(&self);
}
