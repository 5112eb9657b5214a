//! Application hooks over operations and results.

use std::sync::Arc;

use switchboard_core::{CombinedError, Operation, OperationResult};

use super::{Exchange, ExchangeClient, ExchangeIO};
use crate::stream::Source;

type OperationHook = Arc<dyn Fn(Operation) -> Operation + Send + Sync>;
type ResultHook = Arc<dyn Fn(OperationResult) -> OperationResult + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&CombinedError, &Operation) + Send + Sync>;

/// Rewrites operations on the way down and results on the way up.
///
/// Typical uses are injecting auth headers into `Operation::request` and
/// reporting errors. An operation hook must keep the operation's id.
#[derive(Clone, Default)]
pub struct MapExchange {
    on_operation: Option<OperationHook>,
    on_result: Option<ResultHook>,
    on_error: Option<ErrorHook>,
}

impl std::fmt::Debug for MapExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapExchange")
            .field("on_operation", &self.on_operation.is_some())
            .field("on_result", &self.on_result.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl MapExchange {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_operation<F>(mut self, f: F) -> Self
    where
        F: Fn(Operation) -> Operation + Send + Sync + 'static,
    {
        self.on_operation = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_result<F>(mut self, f: F) -> Self
    where
        F: Fn(OperationResult) -> OperationResult + Send + Sync + 'static,
    {
        self.on_result = Some(Arc::new(f));
        self
    }

    /// Called for every result carrying an error, before `on_result`.
    #[must_use]
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&CombinedError, &Operation) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl Exchange for MapExchange {
    fn register(
        &self,
        _client: Arc<dyn ExchangeClient>,
        operations: Source<Operation>,
        next: ExchangeIO,
    ) -> Source<OperationResult> {
        let operations = match self.on_operation.clone() {
            Some(hook) => operations.map(move |operation| hook(operation)),
            None => operations,
        };

        let (on_result, on_error) = (self.on_result.clone(), self.on_error.clone());
        if on_result.is_none() && on_error.is_none() {
            return next(operations);
        }
        next(operations).map(move |result| {
            if let (Some(hook), Some(error)) = (&on_error, &result.error) {
                hook(error, &result.operation);
            }
            match &on_result {
                Some(hook) => hook(result),
                None => result,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::exchange::testing::{query, register, MockClient, TestNext};
    use crate::stream::Recorder;

    #[test]
    fn operation_hook_rewrites_requests() {
        let exchange = MapExchange::new().on_operation(|mut operation| {
            operation
                .request
                .headers
                .insert("authorization", HeaderValue::from_static("Bearer t"));
            operation
        });
        let next = TestNext::new();
        let (ops, results) = register(&exchange, Arc::new(MockClient::default()), next.io());
        let _recorder = Recorder::attach(&results);

        let op = query("{ me }");
        ops.next(op.clone());

        let forwarded = next.forwarded.lock();
        assert_eq!(forwarded[0].id, op.id);
        assert_eq!(
            forwarded[0].request.headers.get("authorization").unwrap(),
            "Bearer t"
        );
    }

    #[test]
    fn result_and_error_hooks_run_on_the_way_up() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::clone(&seen);
        let exchange = MapExchange::new()
            .on_result(|result| result.with_stale(true))
            .on_error(move |error, _| errors.lock().push(error.to_string()));
        let next = TestNext::new();
        let (ops, results) = register(&exchange, Arc::new(MockClient::default()), next.io());
        let recorder = Recorder::attach(&results);

        let op = query("{ me }");
        ops.next(op.clone());
        next.results.next(OperationResult::data(op.clone(), json!(1)));
        next.results.next(OperationResult::error(
            op,
            CombinedError::Unknown("boom".to_string()),
        ));

        assert!(recorder.values().iter().all(|result| result.stale));
        assert_eq!(*seen.lock(), vec!["unknown error: boom".to_string()]);
    }
}
