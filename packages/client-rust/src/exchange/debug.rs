//! Logs traffic through the chain without altering it.

use std::sync::Arc;

use switchboard_core::{Operation, OperationResult};

use super::{Exchange, ExchangeClient, ExchangeIO};
use crate::stream::Source;

/// Emits a `tracing` debug event for every operation and every result.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugExchange;

impl Exchange for DebugExchange {
    fn register(
        &self,
        _client: Arc<dyn ExchangeClient>,
        operations: Source<Operation>,
        next: ExchangeIO,
    ) -> Source<OperationResult> {
        let operations = operations.tap(|operation| {
            tracing::debug!(
                operation_id = %operation.id,
                kind = %operation.kind,
                policy = %operation.policy,
                url = %operation.request.url,
                "operation"
            );
        });

        next(operations).tap(|result| {
            tracing::debug!(
                operation_id = %result.operation.id,
                kind = %result.operation.kind,
                stale = result.stale,
                has_next = result.has_next,
                error = ?result.error,
                "result"
            );
        })
    }
}
