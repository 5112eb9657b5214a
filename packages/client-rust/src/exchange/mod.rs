//! The exchange protocol and its composition.
//!
//! An exchange is a middleware stage: it receives the stream of operations
//! flowing down from the client and a `next` function standing for the rest
//! of the chain, and returns the stream of results flowing back up. Exchanges
//! are composed right to left, so the first exchange in a list sees every
//! operation first and every result last.

pub mod cache;
pub mod debug;
pub mod dedup;
pub mod fetch;
pub mod map;
pub mod ws;

use std::fmt;
use std::sync::Arc;

use switchboard_core::{Operation, OperationResult};

use crate::stream::Source;

pub use cache::CacheExchange;
pub use debug::DebugExchange;
pub use dedup::DedupExchange;
pub use fetch::FetchExchange;
pub use map::MapExchange;
pub use ws::WebSocketExchange;

/// The rest of the chain, as seen by one exchange.
pub type ExchangeIO = Arc<dyn Fn(Source<Operation>) -> Source<OperationResult> + Send + Sync>;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// The client as seen from inside the chain.
///
/// Exchanges never touch the client's state directly; they request work
/// through these three methods only.
pub trait ExchangeClient: Send + Sync {
    /// Returns the shared result source for `operation`.
    fn execute(&self, operation: Operation) -> Source<OperationResult>;

    /// Sends `operation` down the chain again if its id is still active.
    fn reexecute(&self, operation: Operation);

    fn log(&self, message: &str);
}

/// A middleware stage of the pipeline.
///
/// `register` is called once per client. Any per-operation resource an
/// exchange creates must be released when it observes a teardown operation
/// with the same id.
pub trait Exchange: Send + Sync {
    fn register(
        &self,
        client: Arc<dyn ExchangeClient>,
        operations: Source<Operation>,
        next: ExchangeIO,
    ) -> Source<OperationResult>;
}

// ---------------------------------------------------------------------------
// ComposeExchange
// ---------------------------------------------------------------------------

/// Chains exchanges so that the first in the list is the outermost.
#[derive(Clone, Default)]
pub struct ComposeExchange {
    exchanges: Vec<Arc<dyn Exchange>>,
}

impl ComposeExchange {
    #[must_use]
    pub fn new(exchanges: Vec<Arc<dyn Exchange>>) -> Self {
        Self { exchanges }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

impl fmt::Debug for ComposeExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposeExchange")
            .field("exchanges", &self.exchanges.len())
            .finish()
    }
}

impl Exchange for ComposeExchange {
    fn register(
        &self,
        client: Arc<dyn ExchangeClient>,
        operations: Source<Operation>,
        next: ExchangeIO,
    ) -> Source<OperationResult> {
        let io = self.exchanges.iter().rev().fold(next, |next, exchange| {
            let exchange = Arc::clone(exchange);
            let client = Arc::clone(&client);
            Arc::new(move |operations: Source<Operation>| {
                exchange.register(Arc::clone(&client), operations, Arc::clone(&next))
            }) as ExchangeIO
        });
        io(operations)
    }
}

/// Shorthand for [`ComposeExchange::new`].
#[must_use]
pub fn compose_exchanges(exchanges: Vec<Arc<dyn Exchange>>) -> ComposeExchange {
    ComposeExchange::new(exchanges)
}

// ---------------------------------------------------------------------------
// Fallback
// ---------------------------------------------------------------------------

/// The end of every chain: swallows operations and produces no results.
///
/// An operation other than a teardown reaching this point was claimed by no
/// exchange, which is almost always a configuration mistake.
#[must_use]
pub fn fallback_io() -> ExchangeIO {
    Arc::new(|operations: Source<Operation>| {
        operations.filter_map(|operation| {
            if !operation.is_teardown() {
                tracing::warn!(
                    operation_id = %operation.id,
                    kind = %operation.kind,
                    "no exchange handled operation"
                );
            }
            None
        })
    })
}

/// [`fallback_io`] as an exchange, for placing explicitly at the end of a
/// chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackExchange;

impl Exchange for FallbackExchange {
    fn register(
        &self,
        _client: Arc<dyn ExchangeClient>,
        operations: Source<Operation>,
        _next: ExchangeIO,
    ) -> Source<OperationResult> {
        fallback_io()(operations)
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
