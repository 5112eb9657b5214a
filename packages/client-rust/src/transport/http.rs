//! GraphQL-over-HTTP transport backed by `reqwest`.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use switchboard_core::{RequestTarget, TransportError};

use super::{FetchResponse, FetchTransport};
use crate::config::FetchConfig;

const ACCEPT_GRAPHQL: &str = "application/graphql-response+json, application/json";

/// POSTs JSON-encoded execution arguments to the operation's URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds a transport with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connect` if the TLS backend cannot be
    /// initialised.
    pub fn new(config: &FetchConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(Self { client })
    }

    /// Wraps an existing `reqwest` client, sharing its pool and settings.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FetchTransport for HttpTransport {
    async fn fetch(
        &self,
        request: &RequestTarget,
        body: Vec<u8>,
    ) -> Result<FetchResponse, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_GRAPHQL));
        for name in request.headers.keys() {
            headers.remove(name);
        }
        for (name, value) in &request.headers {
            headers.append(name.clone(), value.clone());
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let response = self
            .client
            .post(&request.url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        tracing::debug!(
            url = %request.url,
            status,
            bytes = body.len(),
            "graphql http response"
        );

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn unreachable_host_is_a_connect_error() {
        let transport = HttpTransport::new(&FetchConfig {
            timeout: Duration::from_secs(2),
        })
        .unwrap();

        // Port 9 (discard) on localhost is closed in test environments.
        let err = transport
            .fetch(&RequestTarget::new("http://127.0.0.1:9/graphql"), b"{}".to_vec())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransportError::Connect(_) | TransportError::Io(_) | TransportError::Timeout
        ));
    }
}
