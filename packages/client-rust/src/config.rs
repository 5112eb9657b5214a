//! Configuration types for the client and its default transports.

use std::time::Duration;

use http::HeaderMap;
use serde_json::Value;
use switchboard_core::{RequestPolicy, RequestTarget};

use crate::exchange::cache::DEFAULT_CACHE_CAPACITY;

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// GraphQL-over-HTTP endpoint.
    pub url: String,
    /// Headers sent with every operation unless an exchange rewrites them.
    pub headers: HeaderMap,
    /// Policy given to operations built through the client's convenience API.
    pub default_policy: RequestPolicy,
    /// Maximum number of results kept by the default document cache.
    pub cache_capacity: usize,
    /// Route queries and mutations over the WebSocket transport too.
    pub subscriptions_for_all_operations: bool,
    /// Timeout applied to each HTTP request by the default transport.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:4000/graphql".to_string(),
            headers: HeaderMap::new(),
            default_policy: RequestPolicy::CacheFirst,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            subscriptions_for_all_operations: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// The request target operations are created with.
    #[must_use]
    pub fn request_target(&self) -> RequestTarget {
        RequestTarget::new(self.url.clone()).with_headers(self.headers.clone())
    }

    #[must_use]
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout: self.request_timeout,
        }
    }
}

/// Settings for the reqwest-based [`HttpTransport`](crate::transport::HttpTransport).
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Whole-request timeout, connect through body.
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Settings for the `graphql-transport-ws` [`WsTransport`](crate::transport::WsTransport).
///
/// One connection is shared by every subscription, so the endpoint and
/// handshake headers come from here rather than from individual operations.
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// WebSocket endpoint, `ws://` or `wss://`.
    pub url: String,
    /// Extra headers for the upgrade request.
    pub headers: HeaderMap,
    /// Payload of the `connection_init` message.
    pub connection_init_payload: Option<Value>,
    /// Maximum time to wait for `connection_ack`.
    pub ack_timeout: Duration,
    /// Maximum time to wait for the TCP and upgrade handshake.
    pub connect_timeout: Duration,
    /// Bounded channel capacity for messages per subscription.
    pub channel_capacity: usize,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:4000/graphql".to_string(),
            headers: HeaderMap::new(),
            connection_init_payload: None,
            ack_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 64,
        }
    }
}

impl WsTransportConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}
