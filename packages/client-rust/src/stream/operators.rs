//! Operators over [`Source`].
//!
//! Only the operators the pipeline needs: `map`, `filter`, `filter_map`,
//! `tap`, `on_start`, `on_end`, `on_dispose`, `take`, `take_until`, `merge`,
//! `merge_map`, `switch_map` and `share`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Signal, Sink, Source, Subscription};

impl<T: Clone + Send + Sync + 'static> Source<T> {
    // -----------------------------------------------------------------------
    // Element-wise
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn map<U, F>(&self, f: F) -> Source<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Source::new(move |sink: Sink<U>| {
            let f = Arc::clone(&f);
            source.subscribe(Sink::new(move |signal| match signal {
                Signal::Next(value) => sink.next(f(value)),
                Signal::End => sink.end(),
            }))
        })
    }

    #[must_use]
    pub fn filter<F>(&self, predicate: F) -> Source<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.filter_map(move |value| predicate(&value).then_some(value))
    }

    #[must_use]
    pub fn filter_map<U, F>(&self, f: F) -> Source<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> Option<U> + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Source::new(move |sink: Sink<U>| {
            let f = Arc::clone(&f);
            source.subscribe(Sink::new(move |signal| match signal {
                Signal::Next(value) => {
                    if let Some(mapped) = f(value) {
                        sink.next(mapped);
                    }
                }
                Signal::End => sink.end(),
            }))
        })
    }

    /// Runs `f` on every value before passing it on.
    #[must_use]
    pub fn tap<F>(&self, f: F) -> Source<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Source::new(move |sink| {
            let f = Arc::clone(&f);
            source.subscribe(Sink::new(move |signal| {
                if let Signal::Next(value) = &signal {
                    f(value);
                }
                sink.signal(signal);
            }))
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle hooks
    // -----------------------------------------------------------------------

    /// Runs `f` once per subscription, after the upstream is attached.
    ///
    /// Values the upstream emits synchronously in response to `f` therefore
    /// reach the subscriber.
    #[must_use]
    pub fn on_start<F>(&self, f: F) -> Source<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let source = self.clone();
        Source::new(move |sink| {
            let subscription = source.subscribe(sink);
            f();
            subscription
        })
    }

    /// Runs `f` when the upstream ends, before `End` is passed on.
    #[must_use]
    pub fn on_end<F>(&self, f: F) -> Source<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Source::new(move |sink| {
            let f = Arc::clone(&f);
            source.subscribe(Sink::new(move |signal| {
                if matches!(signal, Signal::End) {
                    f();
                }
                sink.signal(signal);
            }))
        })
    }

    /// Runs `f` when the subscriber cancels before the upstream ended.
    #[must_use]
    pub fn on_dispose<F>(&self, f: F) -> Source<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Source::new(move |sink| {
            let ended = Arc::new(AtomicBool::new(false));
            let upstream_ended = Arc::clone(&ended);
            let upstream = source.subscribe(Sink::new(move |signal| {
                if matches!(signal, Signal::End) {
                    upstream_ended.store(true, Ordering::Release);
                }
                sink.signal(signal);
            }));

            let subscription = Subscription::new();
            subscription.add(upstream);
            let f = Arc::clone(&f);
            subscription.add_teardown(move || {
                if !ended.load(Ordering::Acquire) {
                    f();
                }
            });
            subscription
        })
    }

    // -----------------------------------------------------------------------
    // Truncation
    // -----------------------------------------------------------------------

    /// Passes on the first `count` values, then ends.
    #[must_use]
    pub fn take(&self, count: usize) -> Source<T> {
        let source = self.clone();
        Source::new(move |sink| {
            if count == 0 {
                sink.end();
                return Subscription::new();
            }
            let taken = AtomicUsize::new(0);
            source.subscribe(Sink::new(move |signal| match signal {
                Signal::Next(value) => {
                    let seen = taken.fetch_add(1, Ordering::AcqRel) + 1;
                    if seen <= count {
                        sink.next(value);
                        if seen == count {
                            sink.end();
                        }
                    }
                }
                Signal::End => {
                    if taken.load(Ordering::Acquire) < count {
                        sink.end();
                    }
                }
            }))
        })
    }

    /// Mirrors the source until `notifier` emits its first value, then ends
    /// and cancels both.
    #[must_use]
    pub fn take_until<U>(&self, notifier: Source<U>) -> Source<T>
    where
        U: Clone + Send + Sync + 'static,
    {
        let source = self.clone();
        Source::new(move |sink| {
            let subscription = Subscription::new();
            let done = Arc::new(AtomicBool::new(false));

            let notifier_sub = {
                let (sink, done, subscription) =
                    (sink.clone(), Arc::clone(&done), subscription.clone());
                notifier.subscribe(Sink::new(move |signal| {
                    if matches!(signal, Signal::Next(_)) && !done.swap(true, Ordering::AcqRel) {
                        subscription.unsubscribe();
                        sink.end();
                    }
                }))
            };
            subscription.add(notifier_sub);
            if done.load(Ordering::Acquire) {
                return subscription;
            }

            let upstream_done = Arc::clone(&done);
            let upstream = source.subscribe(Sink::new(move |signal| {
                if upstream_done.load(Ordering::Acquire) {
                    return;
                }
                match signal {
                    Signal::Next(value) => sink.next(value),
                    Signal::End => {
                        upstream_done.store(true, Ordering::Release);
                        sink.end();
                    }
                }
            }));
            subscription.add(upstream);
            subscription
        })
    }

    // -----------------------------------------------------------------------
    // Combination
    // -----------------------------------------------------------------------

    /// Interleaves several sources; ends once all of them have ended.
    ///
    /// Sources are subscribed in list order, so for a value that triggers
    /// synchronous emissions in several of them, earlier sources emit first.
    #[must_use]
    pub fn merge(sources: Vec<Source<T>>) -> Source<T> {
        let sources = Arc::new(sources);
        Source::new(move |sink| {
            let subscription = Subscription::new();
            if sources.is_empty() {
                sink.end();
                return subscription;
            }
            let remaining = Arc::new(AtomicUsize::new(sources.len()));
            for source in sources.iter() {
                let (sink, remaining) = (sink.clone(), Arc::clone(&remaining));
                let inner = source.subscribe(Sink::new(move |signal| match signal {
                    Signal::Next(value) => sink.next(value),
                    Signal::End => {
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            sink.end();
                        }
                    }
                }));
                subscription.add(inner);
            }
            subscription
        })
    }

    /// Maps every value to an inner source and merges all inner sources.
    ///
    /// Ends once the outer source and every inner source have ended. Inner
    /// subscriptions are released as soon as they end.
    #[must_use]
    pub fn merge_map<U, F>(&self, f: F) -> Source<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> Source<U> + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Source::new(move |sink: Sink<U>| {
            let state = Arc::new(Mutex::new(MergeState::default()));
            let subscription = Subscription::new();

            let outer = {
                let (f, sink, state) = (Arc::clone(&f), sink.clone(), Arc::clone(&state));
                source.subscribe(Sink::new(move |signal| match signal {
                    Signal::Next(value) => {
                        let key = {
                            let mut state = state.lock();
                            state.next_key += 1;
                            state.active += 1;
                            state.next_key
                        };
                        let inner_ended = Arc::new(AtomicBool::new(false));
                        let inner = {
                            let (sink, state, inner_ended) =
                                (sink.clone(), Arc::clone(&state), Arc::clone(&inner_ended));
                            f(value).subscribe(Sink::new(move |signal| match signal {
                                Signal::Next(value) => sink.next(value),
                                Signal::End => {
                                    let finished = {
                                        let mut state = state.lock();
                                        inner_ended.store(true, Ordering::Release);
                                        state.inners.remove(&key);
                                        state.active -= 1;
                                        state.outer_ended && state.active == 0
                                    };
                                    if finished {
                                        sink.end();
                                    }
                                }
                            }))
                        };
                        let mut state = state.lock();
                        if !inner_ended.load(Ordering::Acquire) {
                            state.inners.insert(key, inner);
                        }
                    }
                    Signal::End => {
                        let finished = {
                            let mut state = state.lock();
                            state.outer_ended = true;
                            state.active == 0
                        };
                        if finished {
                            sink.end();
                        }
                    }
                }))
            };
            subscription.add(outer);
            subscription.add_teardown(move || {
                let inners: Vec<Subscription> =
                    state.lock().inners.drain().map(|(_, inner)| inner).collect();
                for inner in inners {
                    inner.unsubscribe();
                }
            });
            subscription
        })
    }

    /// Maps every value to an inner source, keeping only the newest one.
    ///
    /// A new value cancels the previous inner source before subscribing the
    /// next. Ends once the outer source has ended and the current inner has
    /// ended too.
    #[must_use]
    pub fn switch_map<U, F>(&self, f: F) -> Source<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> Source<U> + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Source::new(move |sink: Sink<U>| {
            let state = Arc::new(Mutex::new(SwitchState::default()));
            let subscription = Subscription::new();

            let outer = {
                let (f, sink, state) = (Arc::clone(&f), sink.clone(), Arc::clone(&state));
                source.subscribe(Sink::new(move |signal| match signal {
                    Signal::Next(value) => {
                        let (key, previous) = {
                            let mut state = state.lock();
                            state.current_key += 1;
                            state.inner_active = true;
                            (state.current_key, state.current.take())
                        };
                        if let Some(previous) = previous {
                            previous.unsubscribe();
                        }

                        let inner = {
                            let (sink, state) = (sink.clone(), Arc::clone(&state));
                            f(value).subscribe(Sink::new(move |signal| match signal {
                                Signal::Next(value) => sink.next(value),
                                Signal::End => {
                                    let finished = {
                                        let mut state = state.lock();
                                        if state.current_key != key {
                                            return;
                                        }
                                        state.inner_active = false;
                                        state.current = None;
                                        state.outer_ended
                                    };
                                    if finished {
                                        sink.end();
                                    }
                                }
                            }))
                        };

                        let stale = {
                            let mut state = state.lock();
                            if state.current_key == key && state.inner_active {
                                state.current = Some(inner);
                                None
                            } else {
                                Some(inner)
                            }
                        };
                        if let Some(stale) = stale {
                            stale.unsubscribe();
                        }
                    }
                    Signal::End => {
                        let finished = {
                            let mut state = state.lock();
                            state.outer_ended = true;
                            !state.inner_active
                        };
                        if finished {
                            sink.end();
                        }
                    }
                }))
            };
            subscription.add(outer);
            subscription.add_teardown(move || {
                let current = state.lock().current.take();
                if let Some(current) = current {
                    current.unsubscribe();
                }
            });
            subscription
        })
    }

    // -----------------------------------------------------------------------
    // Multicast
    // -----------------------------------------------------------------------

    /// Shares one upstream subscription among all current subscribers.
    ///
    /// The first subscriber connects the upstream; the last one to leave
    /// disconnects it. After the upstream ends, the next subscriber starts a
    /// new connection. Late subscribers only see values emitted after they
    /// joined.
    #[must_use]
    pub fn share(&self) -> Source<T> {
        let source = self.clone();
        let state = Arc::new(Mutex::new(ShareState::<T>::default()));
        Source::new(move |sink| {
            let (id, connect, generation) = {
                let mut state = state.lock();
                state.next_id += 1;
                let id = state.next_id;
                state.sinks.push((id, sink));
                let connect = state.upstream.is_none() && !state.connecting;
                if connect {
                    state.connecting = true;
                }
                (id, connect, state.generation)
            };

            if connect {
                let upstream_state = Arc::clone(&state);
                let upstream = source.subscribe(Sink::new(move |signal: Signal<T>| match signal {
                    Signal::Next(value) => {
                        let sinks: Vec<Sink<T>> = upstream_state
                            .lock()
                            .sinks
                            .iter()
                            .map(|(_, sink)| sink.clone())
                            .collect();
                        for sink in sinks {
                            sink.next(value.clone());
                        }
                    }
                    Signal::End => {
                        let sinks = {
                            let mut state = upstream_state.lock();
                            state.generation += 1;
                            state.upstream = None;
                            state.connecting = false;
                            std::mem::take(&mut state.sinks)
                        };
                        for (_, sink) in sinks {
                            sink.end();
                        }
                    }
                }));

                let orphaned = {
                    let mut state = state.lock();
                    if state.generation != generation {
                        // Ended while connecting; nothing to keep.
                        None
                    } else if state.sinks.is_empty() {
                        state.connecting = false;
                        Some(upstream)
                    } else {
                        state.connecting = false;
                        state.upstream = Some(upstream);
                        None
                    }
                };
                if let Some(orphaned) = orphaned {
                    orphaned.unsubscribe();
                }
            }

            let state = Arc::clone(&state);
            Subscription::from_fn(move || {
                let upstream = {
                    let mut state = state.lock();
                    state.sinks.retain(|(sink_id, _)| *sink_id != id);
                    if state.sinks.is_empty() {
                        state.upstream.take()
                    } else {
                        None
                    }
                };
                if let Some(upstream) = upstream {
                    upstream.unsubscribe();
                }
            })
        })
    }
}

#[derive(Default)]
struct MergeState {
    next_key: u64,
    active: usize,
    outer_ended: bool,
    inners: HashMap<u64, Subscription>,
}

#[derive(Default)]
struct SwitchState {
    current_key: u64,
    inner_active: bool,
    outer_ended: bool,
    current: Option<Subscription>,
}

struct ShareState<T> {
    sinks: Vec<(u64, Sink<T>)>,
    upstream: Option<Subscription>,
    connecting: bool,
    generation: u64,
    next_id: u64,
}

impl<T> Default for ShareState<T> {
    fn default() -> Self {
        Self {
            sinks: Vec::new(),
            upstream: None,
            connecting: false,
            generation: 0,
            next_id: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Recorder, Subject};

    #[test]
    fn map_and_filter_compose() {
        let subject = Subject::<u32>::new();
        let recorder = Recorder::attach(&subject.source().filter(|v| v % 2 == 0).map(|v| v * 10));

        for v in 0..5 {
            subject.next(v);
        }
        assert_eq!(recorder.values(), vec![0, 20, 40]);
    }

    #[test]
    fn take_ends_after_count() {
        let subject = Subject::<u32>::new();
        let recorder = Recorder::attach(&subject.source().take(2));

        subject.next(1);
        subject.next(2);
        subject.next(3);

        assert_eq!(recorder.values(), vec![1, 2]);
        assert!(recorder.has_ended());
        assert_eq!(subject.listener_count(), 0);
    }

    #[test]
    fn take_until_stops_on_first_notification() {
        let values = Subject::<u32>::new();
        let stop = Subject::<()>::new();
        let recorder = Recorder::attach(&values.source().take_until(stop.source()));

        values.next(1);
        stop.next(());
        values.next(2);

        assert_eq!(recorder.values(), vec![1]);
        assert!(recorder.has_ended());
        assert_eq!(values.listener_count(), 0);
        assert_eq!(stop.listener_count(), 0);
    }

    #[test]
    fn on_start_runs_after_upstream_is_attached() {
        let subject = Subject::<u32>::new();
        let trigger = subject.clone();
        let recorder = Recorder::attach(&subject.source().on_start(move || trigger.next(7)));
        assert_eq!(recorder.values(), vec![7]);
    }

    #[test]
    fn on_dispose_fires_only_on_cancellation() {
        let disposed = Arc::new(AtomicUsize::new(0));

        let subject = Subject::<u32>::new();
        let counter = Arc::clone(&disposed);
        let cancelled = Recorder::attach(&subject.source().on_dispose(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        cancelled.subscription.unsubscribe();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&disposed);
        let finished = Recorder::attach(&Source::from_value(1u32).on_dispose(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(finished.has_ended());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn merge_ends_when_all_sources_end() {
        let a = Subject::<u32>::new();
        let b = Subject::<u32>::new();
        let recorder = Recorder::attach(&Source::merge(vec![a.source(), b.source()]));

        a.next(1);
        b.next(2);
        a.end();
        assert!(!recorder.has_ended());
        b.end();

        assert_eq!(recorder.values(), vec![1, 2]);
        assert!(recorder.has_ended());
    }

    #[test]
    fn merge_map_keeps_inners_running_concurrently() {
        let outer = Subject::<u32>::new();
        let inner = Subject::<u32>::new();
        let inner_source = inner.source();
        let recorder = Recorder::attach(
            &outer
                .source()
                .merge_map(move |base| inner_source.map(move |v| base * 100 + v)),
        );

        outer.next(1);
        outer.next(2);
        inner.next(5);

        assert_eq!(recorder.values(), vec![105, 205]);
    }

    #[test]
    fn merge_map_releases_finished_inners() {
        let outer = Subject::<u32>::new();
        let recorder = Recorder::attach(&outer.source().merge_map(Source::from_value));

        outer.next(1);
        outer.next(2);
        assert_eq!(recorder.values(), vec![1, 2]);
        assert!(!recorder.has_ended());

        outer.end();
        assert!(recorder.has_ended());
    }

    #[test]
    fn switch_map_cancels_previous_inner() {
        let outer = Subject::<u32>::new();
        let inner = Subject::<u32>::new();
        let inner_source = inner.source();
        let recorder = Recorder::attach(
            &outer
                .source()
                .switch_map(move |base| inner_source.map(move |v| base * 100 + v)),
        );

        outer.next(1);
        outer.next(2);
        inner.next(5);

        assert_eq!(recorder.values(), vec![205]);
        assert_eq!(inner.listener_count(), 1);
    }

    #[test]
    fn share_connects_once_and_disconnects_with_last_subscriber() {
        let subject = Subject::<u32>::new();
        let connects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connects);
        let shared = subject
            .source()
            .on_start(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .share();

        let first = Recorder::attach(&shared);
        let second = Recorder::attach(&shared);
        subject.next(1);

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(first.values(), vec![1]);
        assert_eq!(second.values(), vec![1]);

        first.subscription.unsubscribe();
        assert_eq!(subject.listener_count(), 1);
        second.subscription.unsubscribe();
        assert_eq!(subject.listener_count(), 0);
    }

    #[test]
    fn share_reconnects_after_end() {
        let shared = Source::from_value(3u32).share();
        let first = Recorder::attach(&shared);
        let second = Recorder::attach(&shared);

        assert_eq!(first.values(), vec![3]);
        assert!(first.has_ended());
        assert_eq!(second.values(), vec![3]);
    }
}
