//! Terminal exchange sending queries and mutations over a [`FetchTransport`].

use std::sync::Arc;
use std::time::Instant;

use switchboard_core::{
    CombinedError, ExecutionResult, Operation, OperationKind, OperationResult, TransportError,
};
use tracing::{info_span, Instrument};

use super::{Exchange, ExchangeClient, ExchangeIO};
use crate::stream::Source;
use crate::transport::{FetchResponse, FetchTransport};

/// Claims queries and mutations; everything else continues down the chain.
///
/// Each claimed operation is raced against a teardown carrying its id. Once
/// the teardown is seen the request is aborted and nothing is emitted for it.
#[derive(Clone)]
pub struct FetchExchange {
    transport: Arc<dyn FetchTransport>,
}

impl std::fmt::Debug for FetchExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchExchange").finish_non_exhaustive()
    }
}

impl FetchExchange {
    #[must_use]
    pub fn new(transport: Arc<dyn FetchTransport>) -> Self {
        Self { transport }
    }

    fn claims(operation: &Operation) -> bool {
        matches!(operation.kind, OperationKind::Query | OperationKind::Mutation)
    }
}

impl Exchange for FetchExchange {
    fn register(
        &self,
        _client: Arc<dyn ExchangeClient>,
        operations: Source<Operation>,
        next: ExchangeIO,
    ) -> Source<OperationResult> {
        let operations = operations.share();
        let teardowns = operations.filter(Operation::is_teardown);
        let transport = Arc::clone(&self.transport);

        let fetched = operations
            .filter(Self::claims)
            .merge_map(move |operation: Operation| {
                let id = operation.id.clone();
                let transport = Arc::clone(&transport);
                Source::from_future(move || execute_fetch(Arc::clone(&transport), operation.clone()))
                    .take_until(teardowns.filter(move |teardown| teardown.id == id))
            });

        let forwarded = next(operations.filter(|operation| !Self::claims(operation)));

        Source::merge(vec![fetched, forwarded])
    }
}

// ---------------------------------------------------------------------------
// Request execution
// ---------------------------------------------------------------------------

/// Runs one request to completion and maps every outcome onto a result.
async fn execute_fetch(transport: Arc<dyn FetchTransport>, operation: Operation) -> OperationResult {
    let span = info_span!(
        "fetch",
        operation_id = %operation.id,
        kind = %operation.kind,
        url = %operation.request.url,
        duration_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    async move {
        let start = Instant::now();
        let result = fetch_result(transport.as_ref(), operation).await;

        let outcome = match &result.error {
            None => "ok",
            Some(CombinedError::Network(_)) => "network_error",
            Some(CombinedError::Graphql(_)) => "graphql_error",
            Some(CombinedError::Unknown(_)) => "unknown_error",
        };
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::Span::current().record("duration_ms", duration_ms);
        tracing::Span::current().record("outcome", outcome);
        tracing::debug!(duration_ms, outcome, "fetch complete");

        result
    }
    .instrument(span)
    .await
}

async fn fetch_result(transport: &dyn FetchTransport, operation: Operation) -> OperationResult {
    let body = match serde_json::to_vec(&operation.args) {
        Ok(body) => body,
        Err(err) => {
            return OperationResult::error(operation, CombinedError::Unknown(err.to_string()))
        }
    };

    match transport.fetch(&operation.request, body).await {
        Ok(response) => decode_response(operation, &response),
        Err(err) => OperationResult::error(operation, CombinedError::Network(err)),
    }
}

/// Maps a raw response onto a result.
///
/// A non-2xx response is still decoded when its body is a GraphQL response,
/// since GraphQL-over-HTTP servers report request errors that way.
fn decode_response(operation: Operation, response: &FetchResponse) -> OperationResult {
    match serde_json::from_slice::<ExecutionResult>(&response.body) {
        Ok(execution)
            if response.is_success() || execution.data.is_some() || execution.errors.is_some() =>
        {
            OperationResult::from_execution(operation, execution)
        }
        Err(err) if response.is_success() => {
            OperationResult::error(operation, CombinedError::Unknown(err.to_string()))
        }
        _ => OperationResult::error(
            operation,
            CombinedError::Network(TransportError::Http {
                status: response.status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            }),
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use switchboard_core::{GraphqlError, RequestTarget};
    use tokio::sync::Notify;

    use super::*;
    use crate::exchange::testing::{mutation, query, register, subscription, MockClient, TestNext};
    use crate::stream::Recorder;

    /// Answers every request with a fixed response, optionally waiting for
    /// `gate` first.
    struct MockTransport {
        response: Result<FetchResponse, TransportError>,
        gate: Option<Arc<Notify>>,
        calls: Mutex<Vec<(RequestTarget, Vec<u8>)>>,
    }

    impl MockTransport {
        fn replying(response: Result<FetchResponse, TransportError>) -> Arc<Self> {
            Arc::new(Self {
                response,
                gate: None,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn gated(body: &'static str, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(FetchResponse::ok(body)),
                gate: Some(gate),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl FetchTransport for MockTransport {
        async fn fetch(
            &self,
            request: &RequestTarget,
            body: Vec<u8>,
        ) -> Result<FetchResponse, TransportError> {
            self.calls.lock().push((request.clone(), body));
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.response.clone()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn setup(transport: Arc<MockTransport>) -> (FetchExchange, TestNext) {
        (FetchExchange::new(transport), TestNext::new())
    }

    #[tokio::test]
    async fn successful_fetch_emits_data() {
        let transport = MockTransport::replying(Ok(FetchResponse::ok(r#"{"data":"hello"}"#)));
        let (fetch, next) = setup(Arc::clone(&transport));
        let (ops, results) = register(&fetch, Arc::new(MockClient::default()), next.io());
        let recorder = Recorder::attach(&results);

        let op = query("{ hello }");
        ops.next(op.clone());
        settle().await;

        let values = recorder.values();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].operation, op);
        assert_eq!(values[0].data, Some(json!("hello")));
        assert_eq!(values[0].error, None);
        assert!(!values[0].stale);
    }

    #[tokio::test]
    async fn request_body_is_the_encoded_args() {
        let transport = MockTransport::replying(Ok(FetchResponse::ok(r#"{"data":null}"#)));
        let (fetch, next) = setup(Arc::clone(&transport));
        let (ops, results) = register(&fetch, Arc::new(MockClient::default()), next.io());
        let _recorder = Recorder::attach(&results);

        ops.next(mutation("mutation { touch }"));
        settle().await;

        let calls = transport.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.url, "http://localhost/graphql");
        let body: serde_json::Value = serde_json::from_slice(&calls[0].1).unwrap();
        assert_eq!(body, json!({ "query": "mutation { touch }" }));
    }

    #[tokio::test]
    async fn graphql_errors_are_wrapped() {
        let transport = MockTransport::replying(Ok(FetchResponse::ok(
            r#"{"data":null,"errors":[{"message":"denied"}]}"#,
        )));
        let (fetch, next) = setup(transport);
        let (ops, results) = register(&fetch, Arc::new(MockClient::default()), next.io());
        let recorder = Recorder::attach(&results);

        ops.next(query("{ secret }"));
        settle().await;

        assert_eq!(
            recorder.values()[0].error,
            Some(CombinedError::Graphql(vec![GraphqlError::new("denied")]))
        );
    }

    #[tokio::test]
    async fn transport_failure_is_a_network_error() {
        let transport = MockTransport::replying(Err(TransportError::Connect("refused".into())));
        let (fetch, next) = setup(transport);
        let (ops, results) = register(&fetch, Arc::new(MockClient::default()), next.io());
        let recorder = Recorder::attach(&results);

        ops.next(query("{ a }"));
        settle().await;

        let values = recorder.values();
        assert_eq!(
            values[0].error,
            Some(CombinedError::Network(TransportError::Connect("refused".into())))
        );
        assert_eq!(values[0].data, None);
    }

    #[tokio::test]
    async fn undecodable_body_is_an_unknown_error() {
        let transport = MockTransport::replying(Ok(FetchResponse::ok("<html>")));
        let (fetch, next) = setup(transport);
        let (ops, results) = register(&fetch, Arc::new(MockClient::default()), next.io());
        let recorder = Recorder::attach(&results);

        ops.next(query("{ a }"));
        settle().await;

        assert!(matches!(
            recorder.values()[0].error,
            Some(CombinedError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn non_graphql_error_status_is_an_http_error() {
        let transport = MockTransport::replying(Ok(FetchResponse {
            status: 502,
            headers: http::HeaderMap::new(),
            body: "bad gateway".into(),
        }));
        let (fetch, next) = setup(transport);
        let (ops, results) = register(&fetch, Arc::new(MockClient::default()), next.io());
        let recorder = Recorder::attach(&results);

        ops.next(query("{ a }"));
        settle().await;

        assert_eq!(
            recorder.values()[0].error,
            Some(CombinedError::Network(TransportError::Http {
                status: 502,
                body: "bad gateway".to_string(),
            }))
        );
    }

    #[tokio::test]
    async fn teardown_before_response_suppresses_the_result() {
        let gate = Arc::new(Notify::new());
        let transport = MockTransport::gated(r#"{"data":1}"#, Arc::clone(&gate));
        let (fetch, next) = setup(Arc::clone(&transport));
        let (ops, results) = register(&fetch, Arc::new(MockClient::default()), next.io());
        let recorder = Recorder::attach(&results);

        let op = query("{ slow }");
        ops.next(op.clone());
        settle().await;
        assert_eq!(transport.calls.lock().len(), 1);

        ops.next(op.teardown());
        gate.notify_waiters();
        settle().await;

        assert!(recorder.values().is_empty());
    }

    #[tokio::test]
    async fn synchronous_teardown_never_reaches_the_transport() {
        let gate = Arc::new(Notify::new());
        let transport = MockTransport::gated(r#"{"data":1}"#, gate);
        let (fetch, next) = setup(Arc::clone(&transport));
        let (ops, results) = register(&fetch, Arc::new(MockClient::default()), next.io());
        let recorder = Recorder::attach(&results);

        let op = query("{ slow }");
        ops.next(op.clone());
        ops.next(op.teardown());
        settle().await;

        assert!(transport.calls.lock().is_empty());
        assert!(recorder.values().is_empty());
    }

    #[tokio::test]
    async fn unclaimed_operations_continue_down_the_chain() {
        let transport = MockTransport::replying(Ok(FetchResponse::ok(r#"{"data":1}"#)));
        let (fetch, next) = setup(Arc::clone(&transport));
        let (ops, results) = register(&fetch, Arc::new(MockClient::default()), next.io());
        let recorder = Recorder::attach(&results);

        let sub = subscription("subscription { ticks }");
        ops.next(sub.clone());
        ops.next(sub.teardown());
        next.results.next(OperationResult::data(sub, json!({ "ticks": 1 })));
        settle().await;

        assert!(transport.calls.lock().is_empty());
        assert_eq!(
            next.forwarded_kinds().iter().map(|(kind, _)| *kind).collect::<Vec<_>>(),
            vec![OperationKind::Subscription, OperationKind::Teardown]
        );
        assert_eq!(recorder.values().len(), 1);
    }
}
