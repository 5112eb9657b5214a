//! Push-based streams with synchronous delivery.
//!
//! The exchange pipeline needs ordering guarantees that a polled async stream
//! cannot give: a cache hit must reach its subscribers in the same call that
//! dispatched the operation, before any other operation is looked at. These
//! primitives deliver every value synchronously on the emitting thread:
//!
//! - [`Sink`]: receives `Next(value)` and `End` signals
//! - [`Source`]: a cold stream; every `subscribe` runs its producer again
//! - [`Subscription`]: cancellation handle with attached teardown callbacks
//! - [`Subject`]: a hot multicast source driven imperatively
//!
//! Operators live in [`operators`], constructors in [`sources`], and the bridge
//! to `futures::Stream` in [`adapter`].
//!
//! No lock is ever held while a sink is called, so sinks may freely emit into
//! other subjects, subscribe, or unsubscribe re-entrantly.

pub mod adapter;
pub mod operators;
pub mod sources;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

pub use adapter::ResultStream;

// ---------------------------------------------------------------------------
// Signal / Sink
// ---------------------------------------------------------------------------

/// A single event delivered to a [`Sink`].
#[derive(Debug, Clone, PartialEq)]
pub enum Signal<T> {
    Next(T),
    End,
}

/// Receiver of stream signals.
pub struct Sink<T> {
    inner: Arc<dyn Fn(Signal<T>) + Send + Sync>,
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Sink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink").finish_non_exhaustive()
    }
}

impl<T> Sink<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Signal<T>) + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    pub fn signal(&self, signal: Signal<T>) {
        (self.inner)(signal);
    }

    pub fn next(&self, value: T) {
        self.signal(Signal::Next(value));
    }

    pub fn end(&self) {
        self.signal(Signal::End);
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

type Teardown = Box<dyn FnOnce() + Send>;

/// Cancellation handle for a subscribed [`Source`].
///
/// Cloning yields another handle to the same subscription. Teardown callbacks
/// run exactly once, on the first `unsubscribe`; callbacks added after that
/// run immediately. Dropping a handle does not cancel anything.
#[derive(Clone)]
pub struct Subscription {
    // `None` once closed.
    teardowns: Arc<Mutex<Option<Vec<Teardown>>>>,
}

impl Subscription {
    /// Creates an open subscription with no teardown callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            teardowns: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Creates an open subscription that runs `f` when cancelled.
    #[must_use]
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let subscription = Self::new();
        subscription.add_teardown(f);
        subscription
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.teardowns.lock().is_none()
    }

    /// Registers `f` to run on cancellation, or runs it now if already closed.
    pub fn add_teardown<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self.teardowns.lock();
        if let Some(list) = guard.as_mut() {
            list.push(Box::new(f));
            return;
        }
        drop(guard);
        f();
    }

    /// Cancels `other` together with this subscription.
    pub fn add(&self, other: Subscription) {
        if Arc::ptr_eq(&self.teardowns, &other.teardowns) {
            return;
        }
        self.add_teardown(move || other.unsubscribe());
    }

    /// Closes the subscription and runs its teardown callbacks in order.
    pub fn unsubscribe(&self) {
        let teardowns = self.teardowns.lock().take();
        for teardown in teardowns.into_iter().flatten() {
            teardown();
        }
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

type Producer<T> = dyn Fn(Sink<T>) -> Subscription + Send + Sync;

/// A cold, push-based stream.
///
/// The producer runs once per `subscribe`. It must deliver signals to the sink
/// it is given and return a subscription that stops delivery when cancelled.
pub struct Source<T> {
    producer: Arc<Producer<T>>,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
        }
    }
}

impl<T> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Source<T> {
    pub fn new<F>(producer: F) -> Self
    where
        F: Fn(Sink<T>) -> Subscription + Send + Sync + 'static,
    {
        Self {
            producer: Arc::new(producer),
        }
    }

    /// Starts the stream, delivering its signals to `sink`.
    ///
    /// The sink sees nothing after `End`, and nothing after the returned
    /// subscription is cancelled. Receiving `End` cancels the subscription so
    /// that upstream resources are released.
    pub fn subscribe(&self, sink: Sink<T>) -> Subscription {
        let subscription = Subscription::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let guard = subscription.clone();
        let guarded = Sink::new(move |signal| {
            if stopped.load(Ordering::Acquire) || guard.is_closed() {
                return;
            }
            match signal {
                Signal::Next(value) => sink.next(value),
                Signal::End => {
                    if stopped.swap(true, Ordering::AcqRel) {
                        return;
                    }
                    sink.end();
                    guard.unsubscribe();
                }
            }
        });
        let upstream = (self.producer)(guarded);
        subscription.add(upstream);
        subscription
    }

    /// Subscribes with a callback for values only.
    pub fn for_each<F>(&self, f: F) -> Subscription
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe(Sink::new(move |signal| {
            if let Signal::Next(value) = signal {
                f(value);
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// Subject
// ---------------------------------------------------------------------------

struct SubjectInner<T> {
    listeners: Mutex<Vec<(u64, Sink<T>)>>,
    next_id: AtomicU64,
    ended: AtomicBool,
}

/// A hot source fed through [`Subject::next`].
///
/// Values reach the listeners registered at the moment of the call, in
/// registration order. Listeners added while a value is being delivered only
/// see later values.
pub struct Subject<T> {
    inner: Arc<SubjectInner<T>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("listeners", &self.inner.listeners.lock().len())
            .field("ended", &self.inner.ended.load(Ordering::Acquire))
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Subject<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SubjectInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                ended: AtomicBool::new(false),
            }),
        }
    }

    /// Delivers `value` to every current listener.
    pub fn next(&self, value: T) {
        let listeners: Vec<Sink<T>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, sink)| sink.clone())
            .collect();
        for sink in listeners {
            sink.next(value.clone());
        }
    }

    /// Ends every current listener; later subscribers end immediately.
    pub fn end(&self) {
        self.inner.ended.store(true, Ordering::Release);
        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        for (_, sink) in listeners {
            sink.end();
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// A source that registers a listener on this subject per subscription.
    #[must_use]
    pub fn source(&self) -> Source<T> {
        let weak: Weak<SubjectInner<T>> = Arc::downgrade(&self.inner);
        Source::new(move |sink| {
            let Some(inner) = weak.upgrade() else {
                sink.end();
                return Subscription::new();
            };
            if inner.ended.load(Ordering::Acquire) {
                sink.end();
                return Subscription::new();
            }
            let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
            inner.listeners.lock().push((id, sink));

            let weak = Arc::downgrade(&inner);
            Subscription::from_fn(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.listeners.lock().retain(|(listener, _)| *listener != id);
                }
            })
        })
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Collects every signal a source emits, for synchronous assertions.
#[cfg(test)]
pub(crate) struct Recorder<T> {
    pub(crate) values: Arc<Mutex<Vec<T>>>,
    pub(crate) ended: Arc<AtomicBool>,
    pub(crate) subscription: Subscription,
}

#[cfg(test)]
impl<T: Clone + Send + Sync + 'static> Recorder<T> {
    pub(crate) fn attach(source: &Source<T>) -> Self {
        let values = Arc::new(Mutex::new(Vec::new()));
        let ended = Arc::new(AtomicBool::new(false));
        let (sink_values, sink_ended) = (Arc::clone(&values), Arc::clone(&ended));
        let subscription = source.subscribe(Sink::new(move |signal| match signal {
            Signal::Next(value) => sink_values.lock().push(value),
            Signal::End => sink_ended.store(true, Ordering::SeqCst),
        }));
        Self {
            values,
            ended,
            subscription,
        }
    }

    pub(crate) fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }

    pub(crate) fn has_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
