//! Suppresses duplicate in-flight queries and subscriptions.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use switchboard_core::{Operation, OperationId, OperationKind, OperationResult};

use super::{Exchange, ExchangeClient, ExchangeIO};
use crate::stream::Source;

/// Forwards a query or subscription only if no result has been seen yet for
/// an earlier forward of the same id.
///
/// Dropped duplicates are not answered here; the client multicasts the
/// eventual result to every caller sharing the id.
#[derive(Debug, Clone, Default)]
pub struct DedupExchange {
    in_flight: Arc<Mutex<HashSet<OperationId>>>,
}

impl DedupExchange {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids forwarded and still awaiting a result or teardown.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Decides whether `operation` goes downstream, updating the in-flight set.
    fn admit(in_flight: &Mutex<HashSet<OperationId>>, operation: &Operation) -> bool {
        match operation.kind {
            OperationKind::Teardown => {
                in_flight.lock().remove(&operation.id);
                true
            }
            OperationKind::Mutation => true,
            OperationKind::Query | OperationKind::Subscription => {
                let mut in_flight = in_flight.lock();
                let duplicate = in_flight.contains(&operation.id);
                in_flight.insert(operation.id.clone());
                !duplicate
            }
        }
    }
}

impl Exchange for DedupExchange {
    fn register(
        &self,
        _client: Arc<dyn ExchangeClient>,
        operations: Source<Operation>,
        next: ExchangeIO,
    ) -> Source<OperationResult> {
        let admitted = {
            let in_flight = Arc::clone(&self.in_flight);
            operations.filter(move |operation| Self::admit(&in_flight, operation))
        };
        let in_flight = Arc::clone(&self.in_flight);
        next(admitted).tap(move |result| {
            in_flight.lock().remove(&result.operation.id);
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::exchange::testing::{
        data_for, keep_alive, mutation, query, register, subscription, MockClient, TestNext,
    };

    fn setup() -> (DedupExchange, TestNext) {
        (DedupExchange::new(), TestNext::new())
    }

    #[test]
    fn duplicate_query_is_forwarded_once() {
        let (dedup, next) = setup();
        let (ops, results) = register(&dedup, Arc::new(MockClient::default()), next.io());
        let _alive = keep_alive(&results);

        let op = query("{ todos { id } }");
        ops.next(op.clone());
        ops.next(op.clone());

        assert_eq!(next.forwarded_count(), 1);
        assert_eq!(dedup.in_flight_count(), 1);
    }

    #[test]
    fn result_clears_in_flight() {
        let (dedup, next) = setup();
        let (ops, results) = register(&dedup, Arc::new(MockClient::default()), next.io());
        let _alive = keep_alive(&results);

        let op = query("{ todos { id } }");
        ops.next(op.clone());
        next.results.next(data_for(&op));
        ops.next(op);

        assert_eq!(next.forwarded_count(), 2);
    }

    #[test]
    fn teardown_clears_in_flight_and_is_forwarded() {
        let (dedup, next) = setup();
        let (ops, results) = register(&dedup, Arc::new(MockClient::default()), next.io());
        let _alive = keep_alive(&results);

        let op = subscription("subscription { ticks }");
        ops.next(op.clone());
        ops.next(op.teardown());
        assert_eq!(dedup.in_flight_count(), 0);

        ops.next(op);
        assert_eq!(
            next.forwarded_kinds().iter().map(|(kind, _)| *kind).collect::<Vec<_>>(),
            vec![
                OperationKind::Subscription,
                OperationKind::Teardown,
                OperationKind::Subscription
            ]
        );
    }

    #[test]
    fn mutations_are_never_deduplicated() {
        let (dedup, next) = setup();
        let (ops, results) = register(&dedup, Arc::new(MockClient::default()), next.io());
        let _alive = keep_alive(&results);

        let op = mutation("mutation { addTodo { id } }");
        ops.next(op.clone());
        ops.next(op);

        assert_eq!(next.forwarded_count(), 2);
        assert_eq!(dedup.in_flight_count(), 0);
    }

    #[test]
    fn error_results_also_clear_in_flight() {
        let (dedup, next) = setup();
        let (ops, results) = register(&dedup, Arc::new(MockClient::default()), next.io());
        let _alive = keep_alive(&results);

        let op = query("{ broken }");
        ops.next(op.clone());
        next.results.next(OperationResult::error(
            op.clone(),
            switchboard_core::CombinedError::Unknown("boom".to_string()),
        ));

        assert_eq!(dedup.in_flight_count(), 0);
    }

    proptest! {
        #[test]
        fn forwards_once_per_id_between_results(repeats in proptest::collection::vec(1usize..5, 1..6)) {
            let (dedup, next) = setup();
            let (ops, results) = register(&dedup, Arc::new(MockClient::default()), next.io());
            let _alive = keep_alive(&results);

            let op = query("{ counter }");
            for count in &repeats {
                for _ in 0..*count {
                    ops.next(op.clone());
                }
                next.results.next(data_for(&op));
            }

            prop_assert_eq!(next.forwarded_count(), repeats.len());
            prop_assert_eq!(dedup.in_flight_count(), 0);
        }
    }
}
