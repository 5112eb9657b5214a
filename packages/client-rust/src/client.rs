//! The client: operation bus, exchange chain and per-operation result sources.
//!
//! Every operation is dispatched onto a single bus feeding the composed
//! exchange chain. The chain's results are shared and filtered back down to
//! one long-lived source per query or subscription id, kept in an `active`
//! map so that identical concurrent requests share one execution.
//!
//! ```text
//! execute ──▶ bus ──▶ [Dedup ▶ Cache ▶ … ▶ Fetch/WebSocket] ──▶ results (shared)
//!                                                                 │
//!         active[id] ◀── filter(id) ▶ stale marking ▶ take_until(teardown) ▶ share
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use switchboard_core::{
    ExecutionArgs, Operation, OperationId, OperationKind, OperationResult, RequestPolicy,
};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::exchange::{
    fallback_io, CacheExchange, ComposeExchange, DedupExchange, Exchange, ExchangeClient,
    FetchExchange, WebSocketExchange,
};
use crate::stream::{Source, Subject, Subscription};
use crate::transport::{FetchTransport, HttpTransport, SubscriptionTransport};

const LOG_TARGET: &str = "switchboard::client";

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Handle to a running exchange pipeline. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.config.url)
            .field("active", &self.inner.active.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Starts building a client with the default exchange chain.
    #[must_use]
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Creates a client around an already composed exchange.
    #[must_use]
    pub fn new(config: ClientConfig, exchange: Arc<dyn Exchange>) -> Self {
        Self::with_cache(config, exchange, None)
    }

    fn with_cache(
        config: ClientConfig,
        exchange: Arc<dyn Exchange>,
        cache: Option<CacheExchange>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let bus = Subject::new();
            let handle: Arc<dyn ExchangeClient> = Arc::new(ClientHandle {
                inner: weak.clone(),
            });
            let results = exchange.register(handle, bus.source(), fallback_io()).share();
            let keepalive = results.for_each(|_| {});
            ClientInner {
                config,
                bus,
                queue: Mutex::new(DispatchQueue::default()),
                results,
                keepalive,
                active: DashMap::new(),
                generation: AtomicU64::new(0),
                cache,
            }
        });
        Self { inner }
    }

    /// Returns the result source for `operation`.
    ///
    /// Nothing is sent until the source is subscribed; every subscription
    /// sends the operation again. Queries and subscriptions with the same id
    /// share one source while it is active. A mutation source yields its
    /// first result and completes. A teardown is dispatched at once and
    /// yields an empty source.
    #[must_use]
    pub fn execute(&self, operation: Operation) -> Source<OperationResult> {
        self.inner.execute(operation)
    }

    /// Sends `operation` again if its id is active. Mutations and inactive
    /// ids are ignored.
    pub fn reexecute(&self, operation: Operation) {
        self.inner.reexecute(operation);
    }

    /// Builds an operation against the configured endpoint and default policy.
    #[must_use]
    pub fn create_operation(&self, kind: OperationKind, args: ExecutionArgs) -> Operation {
        let mut operation = Operation::new(kind, args, self.inner.config.request_target());
        operation.policy = self.inner.config.default_policy;
        operation
    }

    /// A query with the given policy, or the configured default.
    #[must_use]
    pub fn query(
        &self,
        args: ExecutionArgs,
        policy: Option<RequestPolicy>,
    ) -> Source<OperationResult> {
        let operation = self.create_operation(OperationKind::Query, args);
        let policy = policy.unwrap_or(operation.policy);
        self.execute(operation.with_policy(policy))
    }

    #[must_use]
    pub fn mutation(&self, args: ExecutionArgs) -> Source<OperationResult> {
        self.execute(self.create_operation(OperationKind::Mutation, args))
    }

    #[must_use]
    pub fn subscription(&self, args: ExecutionArgs) -> Source<OperationResult> {
        self.execute(self.create_operation(OperationKind::Subscription, args))
    }

    /// Runs a query and waits for its first result.
    ///
    /// # Errors
    ///
    /// `ClientError::Operation` if that result carries an error, and
    /// `ClientError::NoResult` if the source completes without one.
    pub async fn query_async(
        &self,
        args: ExecutionArgs,
        policy: Option<RequestPolicy>,
    ) -> Result<OperationResult, ClientError> {
        let operation = self.create_operation(OperationKind::Query, args);
        let operation = operation.with_policy(policy.unwrap_or(operation.policy));
        let id = operation.id.clone();
        first_result(self.execute(operation), id).await
    }

    /// Runs a mutation and waits for its result.
    ///
    /// # Errors
    ///
    /// As for [`Client::query_async`].
    pub async fn mutation_async(
        &self,
        args: ExecutionArgs,
    ) -> Result<OperationResult, ClientError> {
        let operation = self.create_operation(OperationKind::Mutation, args);
        let id = operation.id.clone();
        first_result(self.execute(operation), id).await
    }

    /// Empties the document cache, if the client was built with one.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
    }

    /// Number of queries and subscriptions with a live result source.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    #[must_use]
    pub fn is_active(&self, id: &OperationId) -> bool {
        self.inner.active.contains_key(id)
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl ExchangeClient for Client {
    fn execute(&self, operation: Operation) -> Source<OperationResult> {
        self.inner.execute(operation)
    }

    fn reexecute(&self, operation: Operation) {
        self.inner.reexecute(operation);
    }

    fn log(&self, message: &str) {
        log(message);
    }
}

/// Encodes typed variables into execution arguments.
///
/// # Errors
///
/// `ClientError::Encode` if `variables` does not serialize to JSON.
pub fn encode_args<V: Serialize>(
    query: &str,
    variables: &V,
) -> Result<ExecutionArgs, ClientError> {
    let variables =
        serde_json::to_value(variables).map_err(|err| ClientError::Encode(err.to_string()))?;
    Ok(ExecutionArgs::new(query).with_variables(variables))
}

async fn first_result(
    source: Source<OperationResult>,
    id: OperationId,
) -> Result<OperationResult, ClientError> {
    let mut stream = source.take(1).into_stream();
    match stream.next().await {
        Some(result) => match &result.error {
            Some(error) => Err(ClientError::Operation(error.clone())),
            None => Ok(result),
        },
        None => Err(ClientError::NoResult { id }),
    }
}

fn log(message: &str) {
    tracing::debug!(target: LOG_TARGET, "{message}");
}

// ---------------------------------------------------------------------------
// ClientHandle
// ---------------------------------------------------------------------------

/// The client as handed to exchanges. Holds a weak reference so the chain
/// does not keep the client alive.
struct ClientHandle {
    inner: Weak<ClientInner>,
}

impl ExchangeClient for ClientHandle {
    fn execute(&self, operation: Operation) -> Source<OperationResult> {
        match self.inner.upgrade() {
            Some(inner) => inner.execute(operation),
            None => Source::empty(),
        }
    }

    fn reexecute(&self, operation: Operation) {
        if let Some(inner) = self.inner.upgrade() {
            inner.reexecute(operation);
        }
    }

    fn log(&self, message: &str) {
        log(message);
    }
}

// ---------------------------------------------------------------------------
// ClientInner
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DispatchQueue {
    pending: VecDeque<Operation>,
    draining: bool,
}

#[derive(Clone)]
struct ActiveSource {
    generation: u64,
    source: Source<OperationResult>,
}

struct ClientInner {
    config: ClientConfig,
    bus: Subject<Operation>,
    /// Serialises bus emissions: an operation dispatched while another is
    /// being delivered is queued and sent once that delivery completes.
    queue: Mutex<DispatchQueue>,
    results: Source<OperationResult>,
    keepalive: Subscription,
    active: DashMap<OperationId, ActiveSource>,
    generation: AtomicU64,
    cache: Option<CacheExchange>,
}

impl ClientInner {
    fn dispatch(&self, operation: Operation) {
        {
            let mut queue = self.queue.lock();
            queue.pending.push_back(operation);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        loop {
            let operation = {
                let mut queue = self.queue.lock();
                match queue.pending.pop_front() {
                    Some(operation) => operation,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            self.bus.next(operation);
        }
    }

    fn execute(self: &Arc<Self>, operation: Operation) -> Source<OperationResult> {
        let (source, registration) = match operation.kind {
            OperationKind::Teardown => {
                self.dispatch(operation);
                return Source::empty();
            }
            OperationKind::Mutation => {
                let id = operation.id.clone();
                let source = self
                    .results
                    .filter(move |result| {
                        result.operation.id == id && result.operation.kind == OperationKind::Mutation
                    })
                    .take(1);
                (source, None)
            }
            OperationKind::Query | OperationKind::Subscription => {
                let active = self
                    .active
                    .entry(operation.id.clone())
                    .or_insert_with(|| self.make_result_source(&operation))
                    .value()
                    .clone();
                (active.source.clone(), Some(active))
            }
        };

        let weak = Arc::downgrade(self);
        source.on_start(move || {
            if let Some(inner) = weak.upgrade() {
                if let Some(registration) = &registration {
                    inner.register(&operation.id, registration);
                }
                inner.dispatch(operation.clone());
            }
        })
    }

    /// Puts a resubscribed source back into `active` after its previous
    /// connection retired, so cancelling it tears the operation down again.
    /// A newer source already owning the id is left in place.
    fn register(&self, id: &OperationId, registration: &ActiveSource) {
        self.active
            .entry(id.clone())
            .or_insert_with(|| registration.clone());
    }

    /// Builds the shared source for a query or subscription id.
    fn make_result_source(self: &Arc<Self>, operation: &Operation) -> ActiveSource {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let (id, kind) = (operation.id.clone(), operation.kind);

        let filter_id = id.clone();
        let results = self
            .results
            .filter(move |result| result.operation.id == filter_id && result.operation.kind == kind)
            .on_end(retire(weak.clone(), operation.clone(), generation, true));

        let results = if kind == OperationKind::Query {
            let operations = self.bus.source();
            let stale_id = id.clone();
            results.switch_map(move |result: OperationResult| {
                if result.stale {
                    return Source::from_value(result);
                }
                // A re-request while live marks the last value stale until
                // the fresh one arrives.
                let refetch_id = stale_id.clone();
                let stale = result.clone().with_stale(true);
                let refetched = operations
                    .filter(move |op| {
                        op.kind == OperationKind::Query
                            && op.id == refetch_id
                            && op.policy != RequestPolicy::CacheOnly
                    })
                    .take(1)
                    .map(move |_| stale.clone());
                Source::merge(vec![Source::from_value(result), refetched])
            })
        } else {
            results
        };

        let teardown_id = id;
        let teardowns = self
            .bus
            .source()
            .filter(move |op| op.is_teardown() && op.id == teardown_id);

        let source = results
            .take_until(teardowns)
            .on_dispose(retire(weak.clone(), operation.clone(), generation, true))
            .on_end(retire(weak, operation.clone(), generation, false))
            .share();

        ActiveSource { generation, source }
    }

    fn reexecute(&self, operation: Operation) {
        if operation.kind == OperationKind::Mutation || !self.active.contains_key(&operation.id) {
            log(&format!(
                "ignoring reexecute of inactive {} {}",
                operation.kind, operation.id
            ));
            return;
        }
        self.dispatch(operation);
    }
}

/// Removes the source from `active` if it is still the registered one, and
/// optionally tells the chain to release the operation.
fn retire(
    weak: Weak<ClientInner>,
    operation: Operation,
    generation: u64,
    teardown: bool,
) -> impl Fn() + Send + Sync + 'static {
    move || {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let removed = inner
            .active
            .remove_if(&operation.id, |_, active| active.generation == generation)
            .is_some();
        if removed && teardown {
            inner.dispatch(operation.teardown());
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.bus.end();
        self.keepalive.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// ClientBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`Client`] from a config and either an explicit exchange list
/// or the default chain.
///
/// The default chain is `Dedup → Cache → Fetch`, followed by a WebSocket
/// exchange when a subscription transport is supplied. With
/// `subscriptions_for_all_operations` the WebSocket exchange is placed
/// before Fetch and claims queries and mutations too.
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    exchanges: Option<Vec<Arc<dyn Exchange>>>,
    cache: Option<CacheExchange>,
    fetch_transport: Option<Arc<dyn FetchTransport>>,
    subscription_transport: Option<Arc<dyn SubscriptionTransport>>,
}

impl ClientBuilder {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Replaces the default chain with `exchanges`, outermost first.
    #[must_use]
    pub fn exchanges(mut self, exchanges: Vec<Arc<dyn Exchange>>) -> Self {
        self.exchanges = Some(exchanges);
        self
    }

    /// Uses `cache` in the default chain, or, with an explicit chain,
    /// records it as the cache [`Client::clear_cache`] should clear.
    #[must_use]
    pub fn cache(mut self, cache: CacheExchange) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Overrides the HTTP transport of the default chain.
    #[must_use]
    pub fn fetch_transport(mut self, transport: Arc<dyn FetchTransport>) -> Self {
        self.fetch_transport = Some(transport);
        self
    }

    /// Adds a WebSocket exchange over `transport` to the default chain.
    #[must_use]
    pub fn subscription_transport(mut self, transport: Arc<dyn SubscriptionTransport>) -> Self {
        self.subscription_transport = Some(transport);
        self
    }

    /// # Errors
    ///
    /// `ClientError::Config` for an unusable endpoint URL, and
    /// `ClientError::Transport` if the default HTTP transport cannot be built.
    pub fn build(self) -> Result<Client, ClientError> {
        let url = self.config.url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ClientError::Config(format!(
                "endpoint must be an http(s) URL, got {url:?}"
            )));
        }

        if let Some(exchanges) = self.exchanges {
            let exchange = Arc::new(ComposeExchange::new(exchanges));
            return Ok(Client::with_cache(self.config, exchange, self.cache));
        }

        let cache = self
            .cache
            .unwrap_or_else(|| CacheExchange::with_capacity(self.config.cache_capacity));
        let fetch_transport = match self.fetch_transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config.fetch_config())?),
        };

        let mut exchanges: Vec<Arc<dyn Exchange>> =
            vec![Arc::new(DedupExchange::new()), Arc::new(cache.clone())];
        let all_operations = self.config.subscriptions_for_all_operations;
        let ws = self.subscription_transport.map(|transport| {
            Arc::new(WebSocketExchange::new(transport).for_all_operations(all_operations))
                as Arc<dyn Exchange>
        });
        match ws {
            Some(ws) if all_operations => {
                exchanges.push(ws);
                exchanges.push(Arc::new(FetchExchange::new(fetch_transport)));
            }
            Some(ws) => {
                exchanges.push(Arc::new(FetchExchange::new(fetch_transport)));
                exchanges.push(ws);
            }
            None => exchanges.push(Arc::new(FetchExchange::new(fetch_transport))),
        }

        tracing::info!(
            url = %self.config.url,
            exchanges = exchanges.len(),
            "client built with default exchanges"
        );
        let exchange = Arc::new(ComposeExchange::new(exchanges));
        Ok(Client::with_cache(self.config, exchange, Some(cache)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
