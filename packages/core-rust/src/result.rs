//! Result events flowing back up the pipeline.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::CombinedError;
use crate::operation::Operation;
use crate::wire::ExecutionResult;

/// One response event for an operation.
///
/// Carries the full triggering operation rather than its id so that upstream
/// exchanges can read its kind, policy and types without a lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub operation: Operation,
    /// Raw payload. Absent on pure-error results.
    pub data: Option<Value>,
    pub error: Option<CombinedError>,
    /// Set by the cache when a previously emitted value is being refreshed.
    pub stale: bool,
    /// More incremental payloads will follow for this operation.
    pub has_next: bool,
    pub extensions: Option<Value>,
}

impl OperationResult {
    /// A successful result carrying `data`.
    #[must_use]
    pub fn data(operation: Operation, data: Value) -> Self {
        Self {
            operation,
            data: Some(data),
            error: None,
            stale: false,
            has_next: false,
            extensions: None,
        }
    }

    /// A result carrying only an error.
    #[must_use]
    pub fn error(operation: Operation, error: CombinedError) -> Self {
        Self {
            operation,
            data: None,
            error: Some(error),
            stale: false,
            has_next: false,
            extensions: None,
        }
    }

    /// Maps a decoded server response onto a result.
    ///
    /// A non-empty `errors` array becomes `CombinedError::Graphql`; any `data`
    /// sent alongside the errors is kept.
    #[must_use]
    pub fn from_execution(operation: Operation, response: ExecutionResult) -> Self {
        let error = response
            .graphql_errors()
            .map(|errors| CombinedError::Graphql(errors.to_vec()));
        Self {
            operation,
            data: response.data,
            error,
            stale: false,
            has_next: response.has_next.unwrap_or(false),
            extensions: response.extensions,
        }
    }

    #[must_use]
    pub fn with_stale(mut self, stale: bool) -> Self {
        self.stale = stale;
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Decodes `data` into a caller type.
    ///
    /// # Errors
    ///
    /// Returns the result's own error if it carries one, and
    /// `CombinedError::Unknown` when `data` is absent or does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CombinedError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        let data = self
            .data
            .clone()
            .ok_or_else(|| CombinedError::Unknown("result carries no data".to_string()))?;
        serde_json::from_value(data).map_err(|err| CombinedError::Unknown(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::operation::RequestTarget;
    use crate::wire::{ExecutionArgs, GraphqlError};

    fn make_op() -> Operation {
        Operation::query(ExecutionArgs::new("{ viewer { id } }"), RequestTarget::default())
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Viewer {
        id: String,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct ViewerData {
        viewer: Viewer,
    }

    #[test]
    fn from_execution_wraps_errors() {
        let response = ExecutionResult {
            data: Some(json!({ "viewer": null })),
            errors: Some(vec![GraphqlError::new("forbidden")]),
            has_next: None,
            extensions: None,
        };
        let result = OperationResult::from_execution(make_op(), response);

        assert_eq!(result.data, Some(json!({ "viewer": null })));
        assert_eq!(
            result.error,
            Some(CombinedError::Graphql(vec![GraphqlError::new("forbidden")]))
        );
        assert!(!result.stale);
    }

    #[test]
    fn from_execution_without_errors_is_ok() {
        let response: ExecutionResult = serde_json::from_str(r#"{"data":"hello"}"#).unwrap();
        let result = OperationResult::from_execution(make_op(), response);
        assert!(result.is_ok());
        assert_eq!(result.data, Some(json!("hello")));
    }

    #[test]
    fn decode_returns_typed_data() {
        let result = OperationResult::data(make_op(), json!({ "viewer": { "id": "u1" } }));
        let decoded: ViewerData = result.decode().unwrap();
        assert_eq!(decoded.viewer.id, "u1");
    }

    #[test]
    fn decode_prefers_the_result_error() {
        let result = OperationResult::error(
            make_op(),
            CombinedError::Unknown("boom".to_string()),
        );
        let err = result.decode::<ViewerData>().unwrap_err();
        assert_eq!(err, CombinedError::Unknown("boom".to_string()));
    }

    #[test]
    fn decode_reports_missing_data() {
        let mut result = OperationResult::data(make_op(), json!(null));
        result.data = None;
        assert!(matches!(
            result.decode::<ViewerData>(),
            Err(CombinedError::Unknown(_))
        ));
    }
}
