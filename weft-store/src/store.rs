//! Save/load orchestration over a [`Backend`].
//!
//! Saving literalizes an object graph, refuses incomplete dependency
//! closures, signs authored literals, computes causal headers for ops, and
//! keeps the causal-invalidation closure: whenever an op's precondition is
//! (or later becomes) invalidated, a deterministic cascade op recording that
//! fact is synthesized and stored alongside.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};
use weft_base::Hash;
use weft_data::{
    object_hash, CascadedInvalidateOp, Context, HashReference, HashedObject, HashedSet, Identity,
    InvalidateAfterOp, KeyPair, Literal, LiteralError, ObjectRc, OpHeader, OP_FLAG,
};

use crate::backend::{Backend, BackendError, SearchParams, SearchResults, TerminalOpsInfo};
use crate::watch::{WatchCallback, WatchToken, Watchers};

const BATCH_SIZE: usize = 50;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A dependency is stored under a different class than the referring
    /// literal declares.
    #[error("class mismatch for {hash}: declared {declared:?}, stored {stored:?}")]
    ClassMismatch {
        /// The dependency hash.
        hash: Hash,
        /// Class declared by the referring literal.
        declared: String,
        /// Class found in the backend.
        stored: String,
    },
    /// The object graph references objects that are neither part of it nor
    /// already stored.
    #[error("missing dependencies: {hashes:?}")]
    MissingDependencies {
        /// The absent hashes.
        hashes: Vec<Hash>,
    },
    /// A predecessor op has no stored header.
    #[error("missing header for predecessor op {op_hash}")]
    MissingPrevOpHeader {
        /// The predecessor's hash.
        op_hash: Hash,
    },
    /// An authored object must be signed but no signing key is available.
    #[error("no signing key available for identity {identity}")]
    SigningKeyUnavailable {
        /// Hash of the author identity.
        identity: Hash,
    },
    /// Literalization or validation failure.
    #[error(transparent)]
    Literal(#[from] LiteralError),
    /// Backend failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Counters exposed for observability and tests.
#[derive(Debug, Default)]
pub struct StoreStats {
    literals_saved: AtomicU64,
    cascades_synthesized: AtomicU64,
}

impl StoreStats {
    /// Literals newly persisted through this store.
    pub fn literals_saved(&self) -> u64 {
        self.literals_saved.load(Ordering::Relaxed)
    }

    /// Cascade ops synthesized by causal maintenance.
    pub fn cascades_synthesized(&self) -> u64 {
        self.cascades_synthesized.load(Ordering::Relaxed)
    }
}

/// A batch of reconstructed objects plus the paging cursor.
#[derive(Debug, Default)]
pub struct LoadResults {
    /// The reconstructed objects, in backend sort order.
    pub objects: Vec<ObjectRc>,
    /// Cursor for the next page, when more results exist.
    pub end_cursor: Option<String>,
}

/// Object store over a pluggable [`Backend`].
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    watchers: Arc<Watchers>,
    stats: Arc<StoreStats>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.backend.name())
            .field("backend", &self.backend.backend_name())
            .finish()
    }
}

impl Store {
    /// Open a store over a backend. The store registers itself as the
    /// backend's stored-object callback to fan out watches.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let watchers = Arc::new(Watchers::default());
        let fan_out = watchers.clone();
        backend.set_stored_callback(Arc::new(move |literal| fan_out.fire(literal)));
        Store {
            backend,
            watchers,
            stats: Arc::new(StoreStats::default()),
        }
    }

    /// The instance name.
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Counters.
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Close the underlying backend.
    pub fn close(&self) {
        self.backend.close();
    }

    // ---- saving ----

    /// Save an object graph.
    ///
    /// Not re-entrant for the same root: callers must not overlap saves of
    /// one object graph. Distinct roots may be saved concurrently.
    pub fn save(&self, obj: &dyn HashedObject) -> Result<Hash, StoreError> {
        let mut ctx = Context::new();
        let root = ctx.literalize(obj)?;
        self.check_dependencies(&ctx, root)?;
        let mut visited = HashSet::new();
        self.save_literal(root, &mut ctx, &mut visited)?;

        // flush op queues of the saved mutables; ops save through the
        // regular path, so this does not recurse across op boundaries
        let mut mutables: Vec<ObjectRc> = Vec::new();
        if obj.as_mutable().is_some() {
            if let Some(root_obj) = ctx.objects.get(&root) {
                mutables.push(root_obj.clone());
            }
        }
        let direct_deps: Vec<Hash> = ctx
            .literals
            .get(&root)
            .map(|l| {
                l.literal_dependencies()
                    .filter(|d| d.direct)
                    .map(|d| d.hash)
                    .collect()
            })
            .unwrap_or_default();
        for hash in direct_deps {
            if let Some(dep_obj) = ctx.objects.get(&hash) {
                if dep_obj.as_mutable().is_some() {
                    mutables.push(dep_obj.clone());
                }
            }
        }
        for mutable in mutables {
            for op in mutable.as_mutable().expect("checked above").take_queued_ops() {
                self.save(&*op)?;
            }
        }
        Ok(root)
    }

    fn check_dependencies(&self, ctx: &Context, root: Hash) -> Result<(), StoreError> {
        let Some(literal) = ctx.literals.get(&root) else {
            return Ok(());
        };
        let mut missing = Vec::new();
        for dep in &literal.dependencies {
            if ctx.literals.contains_key(&dep.hash) {
                continue;
            }
            match self.backend.load(&dep.hash)? {
                Some(stored) => {
                    if stored.class_name != dep.class_name {
                        return Err(StoreError::ClassMismatch {
                            hash: dep.hash,
                            declared: dep.class_name.clone(),
                            stored: stored.class_name,
                        });
                    }
                }
                None => missing.push(dep.hash),
            }
        }
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(StoreError::MissingDependencies { hashes: missing });
        }
        Ok(())
    }

    /// Save one literal after its literal dependencies; on first
    /// persistence of an op, run causal maintenance.
    fn save_literal(
        &self,
        hash: Hash,
        ctx: &mut Context,
        visited: &mut HashSet<Hash>,
    ) -> Result<(), StoreError> {
        if !visited.insert(hash) {
            return Ok(());
        }
        let Some(mut literal) = ctx.literals.get(&hash).cloned() else {
            return Ok(());
        };
        let dep_hashes: Vec<Hash> = literal.literal_dependencies().map(|d| d.hash).collect();
        for dep in dep_hashes {
            self.save_literal(dep, ctx, visited)?;
        }
        if self.backend.load(&hash)?.is_some() {
            trace!(%hash, "already stored");
            return Ok(());
        }

        let obj = ctx.objects.get(&hash).cloned();
        if let Some(obj) = &obj {
            if literal.signature.is_none() && obj.meta().sign_on_save {
                if let Some(author) = obj.meta().author.clone() {
                    let signature = self.sign_with(&author, &hash)?;
                    obj.meta().last_signature.set(signature.clone()).ok();
                    literal.signature = Some(signature);
                    if let Some(stored) = ctx.literals.get_mut(&hash) {
                        stored.signature = literal.signature.clone();
                    }
                }
            }
        }

        let header = if literal.has_flag(OP_FLAG) {
            Some(self.compute_header(&literal)?)
        } else {
            None
        };
        self.backend.store(&literal, header.as_ref())?;
        self.stats.literals_saved.fetch_add(1, Ordering::Relaxed);
        debug!(class = %literal.class_name, %hash, "saved literal");

        if literal.has_flag(OP_FLAG) {
            self.causal_maintenance(hash, ctx, visited)?;
        }
        Ok(())
    }

    fn sign_with(&self, author: &Arc<Identity>, hash: &Hash) -> Result<String, StoreError> {
        if let Some(signature) = author.sign(hash) {
            return Ok(signature);
        }
        // the identity came without its private half; try this store
        let kp_hash = KeyPair::hash_for_public_key(author.public_key());
        if let Some(kp_literal) = self.backend.load(&kp_hash)? {
            let mut ctx = Context::new();
            ctx.insert_literal(kp_literal);
            if let Ok(kp_obj) = ctx.object(kp_hash) {
                if let Some(kp) = kp_obj.as_any().downcast_ref::<KeyPair>() {
                    let kp = Arc::new(kp.clone());
                    author.attach_key_pair(kp.clone());
                    return Ok(kp.sign(hash));
                }
            }
        }
        Err(StoreError::SigningKeyUnavailable {
            identity: author.id_hash(),
        })
    }

    fn compute_header(&self, literal: &Literal) -> Result<OpHeader, StoreError> {
        let mut prev_headers = BTreeMap::new();
        for dep in literal.direct_dependencies_at("prev_ops") {
            let header = self
                .backend
                .load_op_header(&dep.hash)?
                .ok_or(StoreError::MissingPrevOpHeader { op_hash: dep.hash })?;
            prev_headers.insert(dep.hash, header.header_hash);
        }
        Ok(OpHeader::new(literal.hash, prev_headers))
    }

    // ---- causal-invalidation maintenance ----

    fn causal_maintenance(
        &self,
        hash: Hash,
        ctx: &mut Context,
        visited: &mut HashSet<Hash>,
    ) -> Result<(), StoreError> {
        let Some(obj) = ctx.objects.get(&hash).cloned() else {
            return Ok(());
        };
        let Some(op) = obj.as_op() else {
            return Ok(());
        };
        let op_target = op.target_object().clone();
        let op_ref = HashReference::new(hash, obj.class_name());

        // the new op's preconditions may already be invalidated
        let causal_refs: Vec<HashReference> = op
            .causal_ops()
            .map(|set| set.iter_references().cloned().collect())
            .unwrap_or_default();
        for precondition in causal_refs {
            for inv in self.load_all_invalidations(&precondition.hash)? {
                let Some(invalidation) = inv.as_op().and_then(|o| o.as_invalidation()) else {
                    continue;
                };
                let applies = invalidation.invalidated_op().hash == precondition.hash
                    && (inv.class_name() == CascadedInvalidateOp::CLASS
                        || invalidation.target_object().hash == op_target.hash);
                if applies {
                    let cascade = CascadedInvalidateOp::create(
                        op_target.clone(),
                        op_ref.clone(),
                        inv.clone(),
                    );
                    self.save_synthesized(cascade, ctx, visited)?;
                }
            }
        }

        // a newly saved invalidation reaches ops that already depend on its
        // target
        if let Some(invalidation) = op.as_invalidation() {
            let invalidated = invalidation.invalidated_op().clone();
            let still_valid: Option<HashSet<Hash>> =
                match obj.as_any().downcast_ref::<InvalidateAfterOp>() {
                    Some(after) => Some(self.prev_ops_closure(after.terminal_ops())?),
                    None => None,
                };
            for consequence in self.load_all_consequences(&invalidated.hash)? {
                let consequence_hash = self.hash_of(&consequence)?;
                if still_valid
                    .as_ref()
                    .is_some_and(|valid| valid.contains(&consequence_hash))
                {
                    continue;
                }
                let Some(consequence_op) = consequence.as_op() else {
                    continue;
                };
                let cascade = CascadedInvalidateOp::create(
                    consequence_op.target_object().clone(),
                    HashReference::new(consequence_hash, consequence.class_name()),
                    obj.clone(),
                );
                self.save_synthesized(cascade, ctx, visited)?;
            }
        }
        Ok(())
    }

    fn save_synthesized(
        &self,
        cascade: CascadedInvalidateOp,
        ctx: &mut Context,
        visited: &mut HashSet<Hash>,
    ) -> Result<(), StoreError> {
        let cascade_hash = ctx.literalize(&cascade)?;
        if self.backend.load(&cascade_hash)?.is_some() {
            return Ok(());
        }
        debug!(%cascade_hash, "synthesizing cascade invalidation");
        self.stats.cascades_synthesized.fetch_add(1, Ordering::Relaxed);
        self.save_literal(cascade_hash, ctx, visited)
    }

    fn prev_ops_closure(&self, terminal_ops: &HashedSet) -> Result<HashSet<Hash>, StoreError> {
        let mut closure = HashSet::new();
        let mut frontier: Vec<Hash> = terminal_ops.reference_hashes();
        while let Some(hash) = frontier.pop() {
            if !closure.insert(hash) {
                continue;
            }
            if let Some(literal) = self.backend.load(&hash)? {
                for dep in literal.direct_dependencies_at("prev_ops") {
                    frontier.push(dep.hash);
                }
            }
        }
        Ok(closure)
    }

    fn hash_of(&self, obj: &ObjectRc) -> Result<Hash, StoreError> {
        match obj.meta().last_hash() {
            Some(hash) => Ok(*hash),
            None => Ok(object_hash(&**obj)?),
        }
    }

    // ---- loading ----

    /// Fetch a raw literal.
    pub fn load_literal(&self, hash: &Hash) -> Result<Option<Literal>, StoreError> {
        Ok(self.backend.load(hash)?)
    }

    /// Load and reconstruct an object. With `validate`, hash, signature and
    /// class invariants are enforced.
    pub fn load(&self, hash: &Hash, validate: bool) -> Result<Option<ObjectRc>, StoreError> {
        let mut ctx = Context::new();
        self.load_with_context(hash, &mut ctx, validate)
    }

    /// Load into a shared context, so related loads reuse reconstructed
    /// subgraphs.
    pub fn load_with_context(
        &self,
        hash: &Hash,
        ctx: &mut Context,
        validate: bool,
    ) -> Result<Option<ObjectRc>, StoreError> {
        if !self.populate(hash, ctx)? {
            return Ok(None);
        }
        let obj = if validate {
            ctx.object_with_validation(*hash)?
        } else {
            ctx.object(*hash)?
        };
        self.attach_key_pairs(ctx)?;
        Ok(Some(obj))
    }

    /// Pull a literal and its transitive literal dependencies into `ctx`.
    fn populate(&self, hash: &Hash, ctx: &mut Context) -> Result<bool, StoreError> {
        if !ctx.literals.contains_key(hash) {
            match self.backend.load(hash)? {
                Some(literal) => {
                    let deps: Vec<Hash> =
                        literal.literal_dependencies().map(|d| d.hash).collect();
                    ctx.insert_literal(literal);
                    for dep in deps {
                        self.populate(&dep, ctx)?;
                    }
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Attach locally stored signing keys to identities that arrived
    /// without their private half.
    fn attach_key_pairs(&self, ctx: &Context) -> Result<(), StoreError> {
        let objects: Vec<ObjectRc> = ctx.objects.values().cloned().collect();
        for obj in &objects {
            let mut identities: Vec<&Identity> = Vec::new();
            if let Some(identity) = obj.as_any().downcast_ref::<Identity>() {
                identities.push(identity);
            }
            if let Some(author) = obj.meta().author.as_deref() {
                identities.push(author);
            }
            for identity in identities {
                if identity.key_pair().is_some() {
                    continue;
                }
                let kp_hash = KeyPair::hash_for_public_key(identity.public_key());
                if let Some(kp_literal) = self.backend.load(&kp_hash)? {
                    let mut kp_ctx = Context::new();
                    kp_ctx.insert_literal(kp_literal);
                    if let Ok(kp_obj) = kp_ctx.object(kp_hash) {
                        if let Some(kp) = kp_obj.as_any().downcast_ref::<KeyPair>() {
                            identity.attach_key_pair(Arc::new(kp.clone()));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn reconstruct_batch(&self, results: SearchResults) -> Result<LoadResults, StoreError> {
        let mut ctx = Context::new();
        let mut objects = Vec::new();
        for literal in results.literals {
            if self.populate(&literal.hash, &mut ctx)? {
                objects.push(ctx.object(literal.hash)?);
            }
        }
        Ok(LoadResults {
            objects,
            end_cursor: results.end_cursor,
        })
    }

    /// Objects of a class, one page.
    pub fn load_by_class(
        &self,
        class_name: &str,
        params: &SearchParams,
    ) -> Result<LoadResults, StoreError> {
        let results = self.backend.search_by_class(class_name, params)?;
        self.reconstruct_batch(results)
    }

    /// Objects referencing `hash` at `path`, one page.
    pub fn load_by_reference(
        &self,
        path: &str,
        hash: &Hash,
        params: &SearchParams,
    ) -> Result<LoadResults, StoreError> {
        let results = self.backend.search_by_reference(path, hash, params)?;
        self.reconstruct_batch(results)
    }

    /// Objects of `class_name` referencing `hash` at `path`, one page.
    pub fn load_by_referencing_class(
        &self,
        class_name: &str,
        path: &str,
        hash: &Hash,
        params: &SearchParams,
    ) -> Result<LoadResults, StoreError> {
        let results = self
            .backend
            .search_by_referencing_class(class_name, path, hash, params)?;
        self.reconstruct_batch(results)
    }

    /// All ops targeting a mutable, in backend sort order.
    pub fn load_all_ops(&self, target: &Hash) -> Result<Vec<ObjectRc>, StoreError> {
        self.load_all_filtered("target_object", target, |obj| {
            obj.as_op().is_some_and(|op| op.target_object().hash == *target)
        })
    }

    /// All invalidations whose target is the given op.
    pub fn load_all_invalidations(&self, op_hash: &Hash) -> Result<Vec<ObjectRc>, StoreError> {
        self.load_all_filtered("target_op", op_hash, |obj| {
            obj.as_op()
                .and_then(|op| op.as_invalidation())
                .is_some_and(|inv| inv.invalidated_op().hash == *op_hash)
        })
    }

    /// All ops that name the given op as a causal precondition.
    pub fn load_all_consequences(&self, op_hash: &Hash) -> Result<Vec<ObjectRc>, StoreError> {
        self.load_all_filtered("causal_ops", op_hash, |obj| {
            obj.as_op()
                .and_then(|op| op.causal_ops())
                .is_some_and(|set| set.reference_hashes().contains(op_hash))
        })
    }

    fn load_all_filtered(
        &self,
        path: &str,
        hash: &Hash,
        keep: impl Fn(&ObjectRc) -> bool,
    ) -> Result<Vec<ObjectRc>, StoreError> {
        let mut out = Vec::new();
        let mut params = SearchParams::batch(BATCH_SIZE);
        loop {
            let results = self.backend.search_by_reference(path, hash, &params)?;
            let cursor = results.end_cursor.clone();
            let batch = self.reconstruct_batch(results)?;
            out.extend(batch.objects.into_iter().filter(&keep));
            match cursor {
                Some(cursor) => params = params.after(cursor),
                None => break,
            }
        }
        Ok(out)
    }

    /// Terminal-op info for a mutable.
    pub fn load_terminal_ops(&self, target: &Hash) -> Result<Option<TerminalOpsInfo>, StoreError> {
        Ok(self.backend.load_terminal_ops(target)?)
    }

    /// Causal header of an op.
    pub fn load_op_header(&self, op_hash: &Hash) -> Result<Option<OpHeader>, StoreError> {
        Ok(self.backend.load_op_header(op_hash)?)
    }

    /// Causal header by its own hash.
    pub fn load_op_header_by_header_hash(
        &self,
        header_hash: &Hash,
    ) -> Result<Option<OpHeader>, StoreError> {
        Ok(self.backend.load_op_header_by_header_hash(header_hash)?)
    }

    // ---- watches ----

    /// Watch newly stored literals of a class.
    pub fn watch_class(&self, class_name: &str, callback: WatchCallback) -> WatchToken {
        self.watchers.watch_class(class_name, callback)
    }

    /// Watch newly stored literals referencing `hash` at `path`.
    pub fn watch_references(&self, path: &str, hash: Hash, callback: WatchCallback) -> WatchToken {
        self.watchers.watch_references(path, hash, callback)
    }

    /// Watch newly stored literals of `class_name` referencing `hash` at
    /// `path`.
    pub fn watch_class_references(
        &self,
        class_name: &str,
        path: &str,
        hash: Hash,
        callback: WatchCallback,
    ) -> WatchToken {
        self.watchers
            .watch_class_references(class_name, path, hash, callback)
    }

    /// Remove a watch.
    pub fn remove_watch(&self, token: WatchToken) -> bool {
        self.watchers.remove(token)
    }
}
