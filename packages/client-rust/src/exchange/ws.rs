//! Terminal exchange for long-lived operations over a [`SubscriptionTransport`].

use std::sync::Arc;

use switchboard_core::{CombinedError, Operation, OperationKind, OperationResult};

use super::{Exchange, ExchangeClient, ExchangeIO};
use crate::stream::Source;
use crate::transport::SubscriptionTransport;

/// Claims subscriptions, and optionally queries and mutations as well.
///
/// When the server completes a subscription on its own, the exchange asks the
/// client to re-execute the operation as a teardown so every other stage
/// releases what it holds for the id. An application teardown cancels the
/// live subscription instead.
#[derive(Clone)]
pub struct WebSocketExchange {
    transport: Arc<dyn SubscriptionTransport>,
    for_all_operations: bool,
}

impl std::fmt::Debug for WebSocketExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketExchange")
            .field("for_all_operations", &self.for_all_operations)
            .finish_non_exhaustive()
    }
}

impl WebSocketExchange {
    /// An exchange claiming subscriptions only.
    #[must_use]
    pub fn new(transport: Arc<dyn SubscriptionTransport>) -> Self {
        Self {
            transport,
            for_all_operations: false,
        }
    }

    /// Also route queries and mutations through the transport.
    #[must_use]
    pub fn for_all_operations(mut self, enabled: bool) -> Self {
        self.for_all_operations = enabled;
        self
    }

    fn claims(&self, operation: &Operation) -> bool {
        match operation.kind {
            OperationKind::Subscription => true,
            OperationKind::Query | OperationKind::Mutation => self.for_all_operations,
            OperationKind::Teardown => false,
        }
    }
}

impl Exchange for WebSocketExchange {
    fn register(
        &self,
        client: Arc<dyn ExchangeClient>,
        operations: Source<Operation>,
        next: ExchangeIO,
    ) -> Source<OperationResult> {
        let operations = operations.share();
        let teardowns = operations.filter(Operation::is_teardown);
        let transport = Arc::clone(&self.transport);

        let claimer = self.clone();
        let subscribed = operations
            .filter(move |operation| claimer.claims(operation))
            .merge_map(move |operation: Operation| {
                let id = operation.id.clone();
                let (transport, client) = (Arc::clone(&transport), Arc::clone(&client));
                let stream_op = operation.clone();
                let ended_op = operation.clone();

                Source::from_stream(move || {
                    transport.subscribe(&stream_op.request, &stream_op.args)
                })
                .map(move |message| match message {
                    Ok(execution) => OperationResult::from_execution(operation.clone(), execution),
                    Err(err) => OperationResult::error(operation.clone(), CombinedError::Network(err)),
                })
                // Placed before `take_until` so only a server-side completion
                // triggers it, never an application teardown.
                .on_end(move || {
                    client.log(&format!("subscription {} completed by server", ended_op.id));
                    client.reexecute(ended_op.teardown());
                })
                .take_until(teardowns.filter(move |teardown| teardown.id == id))
            });

        let claimer = self.clone();
        let forwarded = next(operations.filter(move |operation| !claimer.claims(operation)));

        Source::merge(vec![subscribed, forwarded])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
