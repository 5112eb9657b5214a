//! Document cache with type-based invalidation.
//!
//! Keeps the latest error-free result of every query id, indexed by the type
//! names the query selects. A mutation result evicts every cached query that
//! shares a type with it and asks the client to re-run those queries against
//! the network.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use quick_cache::sync::Cache;
use switchboard_core::{Operation, OperationId, OperationKind, OperationResult, RequestPolicy};

use super::{Exchange, ExchangeClient, ExchangeIO};
use crate::stream::Source;

/// Default maximum number of cached results.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

struct CacheState {
    results: Cache<OperationId, OperationResult>,
    type_index: Mutex<TypeIndex>,
    /// Index size past which ids evicted from `results` are swept out.
    prune_threshold: usize,
}

/// Type name -> ids of cached queries selecting that type.
///
/// `results` evicts on its own, so the index may briefly hold ids that are
/// no longer cached. `CacheState::store` sweeps them once `len` passes the
/// prune threshold.
#[derive(Default)]
struct TypeIndex {
    by_type: HashMap<String, HashSet<OperationId>>,
    len: usize,
}

impl TypeIndex {
    fn insert(&mut self, type_name: &str, id: &OperationId) {
        let ids = self.by_type.entry(type_name.to_string()).or_default();
        if ids.insert(id.clone()) {
            self.len += 1;
        }
    }

    fn retain(&mut self, mut keep: impl FnMut(&OperationId) -> bool) {
        self.by_type.retain(|_, ids| {
            ids.retain(&mut keep);
            !ids.is_empty()
        });
        self.len = self.by_type.values().map(HashSet::len).sum();
    }

    fn clear(&mut self) {
        self.by_type.clear();
        self.len = 0;
    }
}

/// Serves queries from memory according to their request policy.
///
/// Cloning yields another handle to the same cache, which is how the client
/// keeps access for [`CacheExchange::clear`] after registering it.
#[derive(Clone)]
pub struct CacheExchange {
    state: Arc<CacheState>,
}

impl fmt::Debug for CacheExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheExchange")
            .field("cached", &self.state.results.len())
            .finish_non_exhaustive()
    }
}

impl Default for CacheExchange {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl CacheExchange {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache holding at most `capacity` results. Evicted entries simply
    /// miss on the next lookup.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Arc::new(CacheState {
                results: Cache::new(capacity),
                type_index: Mutex::new(TypeIndex::default()),
                prune_threshold: capacity.saturating_mul(2),
            }),
        }
    }

    /// Drops every cached result and the type index.
    ///
    /// Live result sources are not refreshed.
    pub fn clear(&self) {
        self.state.results.clear();
        self.state.type_index.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.results.is_empty()
    }

    /// Returns the cached result for `id`, if any.
    #[must_use]
    pub fn get(&self, id: &OperationId) -> Option<OperationResult> {
        self.state.results.get(id)
    }
}

impl CacheState {
    fn should_use_cache(&self, operation: &Operation) -> bool {
        operation.kind == OperationKind::Query
            && operation.policy != RequestPolicy::NetworkOnly
            && (operation.policy == RequestPolicy::CacheOnly
                || self.results.peek(&operation.id).is_some())
    }

    /// The cached emission for `operation`, served under the incoming
    /// operation rather than the one that originally fetched it.
    fn cached_result(&self, operation: &Operation) -> Option<OperationResult> {
        if !self.should_use_cache(operation) {
            return None;
        }
        let cached = self.results.get(&operation.id)?;
        Some(
            cached
                .with_operation(operation.clone())
                .with_stale(operation.policy == RequestPolicy::CacheAndNetwork),
        )
    }

    fn should_forward(&self, operation: &Operation) -> bool {
        if operation.kind != OperationKind::Query {
            return true;
        }
        match operation.policy {
            RequestPolicy::CacheOnly => false,
            RequestPolicy::CacheFirst => self.results.peek(&operation.id).is_none(),
            RequestPolicy::NetworkOnly | RequestPolicy::CacheAndNetwork => true,
        }
    }

    fn on_result(&self, client: &dyn ExchangeClient, result: &OperationResult) {
        match result.operation.kind {
            OperationKind::Mutation => self.invalidate(client, &result.operation.types),
            OperationKind::Query if result.error.is_none() => self.store(result),
            _ => {}
        }
    }

    fn store(&self, result: &OperationResult) {
        let id = &result.operation.id;
        self.results.insert(id.clone(), result.clone().with_stale(false));
        let mut index = self.type_index.lock();
        for type_name in &result.operation.types {
            index.insert(type_name, id);
        }
        if index.len > self.prune_threshold {
            index.retain(|cached| self.results.peek(cached).is_some());
        }
    }

    fn invalidate(&self, client: &dyn ExchangeClient, types: &[String]) {
        let pending: HashSet<OperationId> = {
            let mut index = self.type_index.lock();
            let pending: HashSet<OperationId> = types
                .iter()
                .filter_map(|type_name| index.by_type.get(type_name))
                .flatten()
                .cloned()
                .collect();
            if !pending.is_empty() {
                index.retain(|id| !pending.contains(id));
            }
            pending
        };

        for id in pending {
            // Already evicted or cleared: nothing to refresh.
            let Some((_, cached)) = self.results.remove(&id) else {
                continue;
            };
            client.log(&format!("cache invalidated {id}, refetching"));
            client.reexecute(cached.operation.with_policy(RequestPolicy::NetworkOnly));
        }
    }
}

impl Exchange for CacheExchange {
    fn register(
        &self,
        client: Arc<dyn ExchangeClient>,
        operations: Source<Operation>,
        next: ExchangeIO,
    ) -> Source<OperationResult> {
        let operations = operations.share();

        let cached = {
            let state = Arc::clone(&self.state);
            operations.filter_map(move |operation| state.cached_result(&operation))
        };

        let forwarded = {
            let state = Arc::clone(&self.state);
            operations.filter(move |operation| state.should_forward(operation))
        };

        let state = Arc::clone(&self.state);
        let upstream = next(forwarded).tap(move |result| state.on_result(client.as_ref(), result));

        Source::merge(vec![cached, upstream])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
