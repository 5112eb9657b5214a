//! Errors surfaced by the client's async API and builder.
//!
//! Result streams never fail; these errors exist only where a stream is
//! collapsed into a single `Result`.

use switchboard_core::{CombinedError, OperationId, TransportError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// The first result for the operation carried an error.
    #[error("operation failed: {0}")]
    Operation(#[from] CombinedError),
    /// The result source completed without emitting anything.
    #[error("no result for operation {id}")]
    NoResult { id: OperationId },
    #[error("could not encode request: {0}")]
    Encode(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A default transport could not be constructed.
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_error_wraps_combined_error() {
        let err: ClientError = CombinedError::Unknown("boom".to_string()).into();
        assert_eq!(err.to_string(), "operation failed: unknown error: boom");
    }

    #[test]
    fn no_result_names_the_operation() {
        let err = ClientError::NoResult {
            id: OperationId::new("abc"),
        };
        assert_eq!(err.to_string(), "no result for operation abc");
    }
}
