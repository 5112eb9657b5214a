//! Bridge from [`Source`] to `futures::Stream`.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Signal, Sink, Source, Subscription};

/// A [`Source`] consumed as an async stream.
///
/// Values are buffered until polled. The stream yields `None` once the source
/// has ended. Dropping it cancels the subscription.
pub struct ResultStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    subscription: Subscription,
}

impl<T> fmt::Debug for ResultStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

impl<T> ResultStream<T> {
    /// Stops the underlying subscription; buffered values are still yielded.
    pub fn cancel(&self) {
        self.subscription.unsubscribe();
    }
}

impl<T> Stream for ResultStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for ResultStream<T> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl<T: Clone + Send + Sync + 'static> Source<T> {
    /// Subscribes and returns the values as an async stream.
    #[must_use]
    pub fn into_stream(&self) -> ResultStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.subscribe(Sink::new(move |signal| match signal {
            Signal::Next(value) => {
                if let Some(tx) = tx.lock().as_ref() {
                    let _ = tx.send(value);
                }
            }
            Signal::End => {
                tx.lock().take();
            }
        }));
        ResultStream { rx, subscription }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::stream::Subject;

    #[tokio::test]
    async fn yields_values_until_end() {
        let mut stream = Source::from_values(vec![1u32, 2]).into_stream();
        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let subject = Subject::<u32>::new();
        let stream = subject.source().into_stream();
        assert_eq!(subject.listener_count(), 1);

        drop(stream);
        assert_eq!(subject.listener_count(), 0);
    }

    #[tokio::test]
    async fn values_pushed_later_are_received() {
        let subject = Subject::<u32>::new();
        let mut stream = subject.source().into_stream();

        let producer = subject.clone();
        tokio::spawn(async move {
            producer.next(9);
            producer.end();
        });

        assert_eq!(stream.next().await, Some(9));
        assert_eq!(stream.next().await, None);
    }
}
