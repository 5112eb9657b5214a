//! Transport collaborators used by the terminal exchanges.
//!
//! Exchanges depend only on the [`FetchTransport`] and
//! [`SubscriptionTransport`] traits; [`HttpTransport`] and [`WsTransport`] are
//! the defaults the client builder wires in.

pub mod http;
pub mod ws;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use switchboard_core::{ExecutionArgs, ExecutionResult, RequestTarget, TransportError};

pub use self::http::HttpTransport;
pub use self::ws::WsTransport;

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: ::http::HeaderMap,
    pub body: Bytes,
}

impl FetchResponse {
    /// A 200 response with no headers.
    #[must_use]
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: ::http::HeaderMap::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one encoded GraphQL request and returns the raw response.
///
/// Implementations do not retry and do not interpret the body.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn fetch(
        &self,
        request: &RequestTarget,
        body: Vec<u8>,
    ) -> Result<FetchResponse, TransportError>;
}

/// Opens one logical subscription on a multiplexed connection.
///
/// The returned stream yields each execution result the server pushes. It
/// ends when the server completes the subscription; a transport failure is
/// delivered as a final `Err`. Dropping the stream cancels the subscription.
pub trait SubscriptionTransport: Send + Sync {
    fn subscribe(
        &self,
        request: &RequestTarget,
        args: &ExecutionArgs,
    ) -> BoxStream<'static, Result<ExecutionResult, TransportError>>;
}
