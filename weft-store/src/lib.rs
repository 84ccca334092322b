//! Persistence and causal invalidation for content-addressed object graphs.
//!
//! The [`Store`] saves and loads [`weft_data`] object graphs through a
//! pluggable [`Backend`], keeping two invariants: no literal is stored
//! before its dependencies, and every stored op whose causal precondition is
//! invalidated has a matching cascade-invalidation op in the store. The only
//! shipped backend is the in-memory [`MemoryBackend`]; persistence formats
//! live behind the trait.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

mod backend;
mod memory;
mod store;
mod watch;

pub use backend::{
    Backend, BackendError, SearchParams, SearchResults, SortOrder, StoredCallback, TerminalOpsInfo,
};
pub use memory::MemoryBackend;
pub use store::{LoadResults, Store, StoreError, StoreStats};
pub use watch::{WatchCallback, WatchToken};
