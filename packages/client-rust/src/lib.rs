//! `Switchboard` Client: composable exchange pipeline for GraphQL operations.
//!
//! A [`Client`] dispatches [`Operation`]s through a chain of [`Exchange`]s
//! (deduplication, document caching, HTTP fetch, `WebSocket` subscriptions)
//! and hands back push-based [`Source`]s of [`OperationResult`]s.

pub mod client;
pub mod config;
pub mod error;
pub mod exchange;
pub mod stream;
pub mod transport;

pub use client::{encode_args, Client, ClientBuilder};
pub use config::{ClientConfig, FetchConfig, WsTransportConfig};
pub use error::ClientError;
pub use exchange::{
    compose_exchanges, CacheExchange, ComposeExchange, DebugExchange, DedupExchange, Exchange,
    ExchangeClient, ExchangeIO, FallbackExchange, FetchExchange, MapExchange, WebSocketExchange,
};
pub use stream::{ResultStream, Signal, Sink, Source, Subject, Subscription};
pub use switchboard_core::{
    CombinedError, ExecutionArgs, ExecutionResult, GraphqlError, Operation, OperationId,
    OperationKind, OperationResult, RequestPolicy, RequestTarget, TransportError,
};
pub use transport::{
    FetchResponse, FetchTransport, HttpTransport, SubscriptionTransport, WsTransport,
};
