//! Source constructors.
//!
//! `from_future` and `from_stream` spawn onto the current Tokio runtime and
//! must be subscribed from within one.

use std::future::Future;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use super::{Source, Subscription};

impl<T: Clone + Send + Sync + 'static> Source<T> {
    /// Ends immediately without emitting.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(|sink| {
            sink.end();
            Subscription::new()
        })
    }

    /// Never emits and never ends.
    #[must_use]
    pub fn never() -> Self {
        Self::new(|_| Subscription::new())
    }

    /// Emits `value` once, then ends.
    #[must_use]
    pub fn from_value(value: T) -> Self {
        Self::new(move |sink| {
            sink.next(value.clone());
            sink.end();
            Subscription::new()
        })
    }

    /// Emits every element of `values` in order, then ends.
    #[must_use]
    pub fn from_values(values: Vec<T>) -> Self {
        let values = Arc::new(values);
        Self::new(move |sink| {
            for value in values.iter() {
                sink.next(value.clone());
            }
            sink.end();
            Subscription::new()
        })
    }

    /// Runs the future built by `make` once per subscription and emits its
    /// output. Cancelling the subscription aborts the task.
    ///
    /// # Panics
    ///
    /// Panics if subscribed outside a Tokio runtime.
    #[must_use]
    pub fn from_future<F, Fut>(make: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::new(move |sink| {
            let future = make();
            let task = tokio::spawn(async move {
                let value = future.await;
                sink.next(value);
                sink.end();
            });
            Subscription::from_fn(move || task.abort())
        })
    }

    /// Forwards every item of the stream built by `make`, ending when the
    /// stream is exhausted. Cancelling the subscription drops the stream.
    ///
    /// # Panics
    ///
    /// Panics if subscribed outside a Tokio runtime.
    #[must_use]
    pub fn from_stream<F>(make: F) -> Self
    where
        F: Fn() -> BoxStream<'static, T> + Send + Sync + 'static,
    {
        Self::new(move |sink| {
            let mut stream = make();
            let task = tokio::spawn(async move {
                while let Some(value) = stream.next().await {
                    sink.next(value);
                }
                sink.end();
            });
            Subscription::from_fn(move || task.abort())
        })
    }
}
