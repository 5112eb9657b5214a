//! Error taxonomy shared by every exchange.
//!
//! Errors travel through the pipeline as data on an `OperationResult`;
//! nothing here is ever used to fail a result stream.

use crate::wire::GraphqlError;

/// Failure of a transport before a GraphQL response was obtained.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("i/o error: {0}")]
    Io(String),
}

/// The error half of an `OperationResult`.
///
/// Equality compares within a variant only: two `Network` errors are equal
/// when their transport errors are, never equal to a `Graphql` or `Unknown`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CombinedError {
    /// The transport failed before a response arrived.
    #[error("network error: {0}")]
    Network(TransportError),
    /// The server answered with protocol-level errors.
    #[error("graphql errors: {}", join_messages(.0))]
    Graphql(Vec<GraphqlError>),
    /// Anything else, including undecodable response bodies.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl CombinedError {
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Returns the server errors when this is a `Graphql` error.
    #[must_use]
    pub fn graphql_errors(&self) -> Option<&[GraphqlError]> {
        match self {
            Self::Graphql(errors) => Some(errors),
            _ => None,
        }
    }
}

impl From<TransportError> for CombinedError {
    fn from(err: TransportError) -> Self {
        Self::Network(err)
    }
}

fn join_messages(errors: &[GraphqlError]) -> String {
    errors
        .iter()
        .map(|err| err.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_within_variant() {
        let network = CombinedError::Network(TransportError::Timeout);
        let unknown = CombinedError::Unknown("request timed out".to_string());

        assert_eq!(network, CombinedError::Network(TransportError::Timeout));
        assert_ne!(network, CombinedError::Network(TransportError::Closed));
        assert_ne!(network, unknown);
    }

    #[test]
    fn graphql_display_joins_messages() {
        let err = CombinedError::Graphql(vec![GraphqlError::new("a"), GraphqlError::new("b")]);
        assert_eq!(err.to_string(), "graphql errors: a; b");
        assert_eq!(err.graphql_errors().map(<[_]>::len), Some(2));
    }

    #[test]
    fn transport_error_converts_to_network() {
        let err: CombinedError = TransportError::Connect("refused".to_string()).into();
        assert!(err.is_network());
        assert_eq!(err.to_string(), "network error: connection failed: refused");
    }
}
