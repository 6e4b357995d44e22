// fan-in which forgets what it pulls, with a single live iterator.

use super::{Delivery, SourceSet};
use crate::{
    config::FanInConfig,
    error::{FanInError, InUseError},
    local::LocalSequence,
    pull::{PullChannel, Timeout},
    source::{Closer, Source},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};


/// Fan-in which does not retain elements pulled from its sources
///
/// Only one iterator may be live at a time, and draining is destructive: an element pulled from a
/// source is handed to that iterator and then forgotten. Explicitly added elements are kept and
/// replayed first by every iterator.
///
/// This is a handle: clones refer to the same fan-in, so it may be stopped from another thread
/// while its iterator is draining it.
pub struct UncachedFanIn<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    chan: PullChannel<Delivery<T>>,
    config: FanInConfig,
}

struct State<T> {
    items: LocalSequence<T>,
    sources: SourceSet<T>,
    phase: Phase,
    // whether an UncachedIter currently exists.
    in_use: bool,
}

/// Lifecycle of an [`UncachedFanIn`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    /// No source has been activated yet
    Idle,
    /// Sources have been activated
    Draining,
    /// Stopped. Terminal.
    Stopped,
}

impl<T: Clone + Send + 'static> UncachedFanIn<T> {
    /// Construct empty and idle, with default configuration
    pub fn new() -> Self {
        Self::with_config(FanInConfig::default())
    }

    /// Construct empty and idle
    pub fn with_config(config: FanInConfig) -> Self {
        UncachedFanIn {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: LocalSequence::new(),
                    sources: SourceSet::new(),
                    phase: Phase::Idle,
                    in_use: false,
                }),
                chan: PullChannel::new(),
                config,
            }),
        }
    }

    /// Add a pre-known element
    pub fn add(&self, item: T) {
        self.inner.lock().items.add(item);
    }

    /// Remove the first pre-known element equal to `item`, returning whether one was found
    pub fn remove(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        self.inner.lock().items.remove(item)
    }

    /// Register a source
    ///
    /// If the fan-in is already stopped, the source is closed and dropped immediately.
    pub fn add_source<S: Source<T> + 'static>(&self, source: S) {
        let mut state = self.inner.lock();
        if state.phase == Phase::Stopped {
            drop(state);
            debug!("source added to stopped uncached fan-in, closing it");
            source.closer().close();
            return;
        }
        state.sources.add(Box::new(source));
    }

    /// Get the one live iterator
    ///
    /// Errors if another iterator from this fan-in is still alive.
    pub fn iter(&self) -> Result<UncachedIter<T>, InUseError> {
        let mut state = self.inner.lock();
        if state.in_use {
            return Err(InUseError);
        }
        state.in_use = true;
        Ok(UncachedIter {
            fan_in: Arc::clone(&self.inner),
            idx: 0,
            current: None,
            error: None,
        })
    }

    /// Stop: close every source and cancel every worker
    ///
    /// Workers are cancelled cooperatively, never killed. Returns once every worker thread has
    /// exited. The live iterator, if any, finishes after the element it may currently hold.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Alias for [`stop`](Self::stop)
    pub fn close(&self) {
        self.inner.stop();
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    /// Whether an iterator is currently live
    pub fn in_use(&self) -> bool {
        self.inner.lock().in_use
    }

    /// Number of started sources which have not yet finished
    pub fn active_sources(&self) -> usize {
        self.inner.chan.producers()
    }

    /// Number of source worker threads which have not yet exited
    pub fn running_workers(&self) -> usize {
        self.inner.lock().sources.running_workers()
    }
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + 'static> Inner<T> {
    fn stop(&self) {
        let teardown = {
            let mut state = self.lock();
            state.phase = Phase::Stopped;
            self.chan.close();
            state.sources.take_all()
        };
        teardown.run();
        debug!("uncached fan-in stopped");
    }
}

impl<T: Clone + Send + 'static> Default for UncachedFanIn<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for UncachedFanIn<T> {
    fn clone(&self) -> Self {
        UncachedFanIn { inner: Arc::clone(&self.inner) }
    }
}


/// The single live iterator over an [`UncachedFanIn`]
///
/// Use either the [`has_next`](Self::has_next) / [`next_value`](Self::next_value) pair or the
/// [`Iterator`] implementation. Dropping the iterator lets the fan-in hand out a new one.
pub struct UncachedIter<T> {
    fan_in: Arc<Inner<T>>,
    // index of the next pre-known element to replay.
    idx: usize,
    // element fetched by has_next, not yet taken by next_value.
    current: Option<T>,
    error: Option<FanInError>,
}

impl<T: Clone + Send + 'static> UncachedIter<T> {
    /// Make sure an element is ready for [`next_value`](Self::next_value), returning whether there
    /// is one
    ///
    /// Replays pre-known elements first, then activates sources and pulls. Calling this repeatedly
    /// without `next_value` does not skip elements.
    pub fn has_next(&mut self) -> Result<bool, FanInError> {
        if self.current.is_some() {
            return Ok(true);
        }
        loop {
            {
                let mut state = self.fan_in.lock();
                if let Some(item) = state.items.get(self.idx) {
                    self.idx += 1;
                    self.current = Some(item.clone());
                    return Ok(true);
                }
                if state.phase == Phase::Stopped {
                    return Ok(false);
                }
                if state.sources.has_pending() {
                    state.sources.start_pending(&self.fan_in.chan, &self.fan_in.config);
                    state.phase = Phase::Draining;
                }
            }

            let timeout = Timeout::after(self.fan_in.config.request_timeout);
            match self.fan_in.chan.request_next(timeout)? {
                Some(Ok(item)) => {
                    trace!("uncached fan-in pulled element");
                    self.current = Some(item);
                    return Ok(true);
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    let state = self.fan_in.lock();
                    if self.idx >= state.items.len() && !state.sources.has_pending() {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Take the element made ready by the last successful [`has_next`](Self::has_next)
    ///
    /// # Panics
    ///
    /// If not preceded by a `has_next` which returned `Ok(true)`.
    pub fn next_value(&mut self) -> T {
        self.current.take()
            .expect("UncachedIter.next_value called without a preceding successful has_next")
    }

    /// The failure which ended this iterator, if any
    pub fn terminal_error(&self) -> Option<&FanInError> {
        self.error.as_ref()
    }
}

impl<T: Clone + Send + 'static> Iterator for UncachedIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.error.is_some() {
            return None;
        }
        match self.has_next() {
            Ok(true) => Some(self.next_value()),
            Ok(false) => None,
            Err(e) => {
                debug!(error = %e, "uncached fan-in iterator failed");
                self.error = Some(e);
                None
            }
        }
    }
}

impl<T: Clone + Send + 'static> Source<T> for UncachedIter<T> {
    fn pull(&mut self) -> anyhow::Result<Option<T>> {
        Ok(if self.has_next()? { Some(self.next_value()) } else { None })
    }

    // closing the iterator used as a source stops the fan-in behind it
    fn closer(&self) -> Closer {
        let fan_in = Arc::clone(&self.fan_in);
        Closer::new(move || fan_in.stop())
    }
}

impl<T> Drop for UncachedIter<T> {
    fn drop(&mut self) {
        self.fan_in.lock().in_use = false;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SourceErrorPolicy,
        source::from_iter,
    };
    use std::{
        thread,
        time::{Duration, Instant},
    };

    fn sorted<T: Ord>(mut v: Vec<T>) -> Vec<T> {
        v.sort();
        v
    }

    #[test]
    fn replays_items_then_drains_sources() {
        let fan_in = UncachedFanIn::new();
        fan_in.add(-1);
        fan_in.add(-2);
        fan_in.add_source(from_iter(0..20));
        fan_in.add_source(from_iter(20..30));
        assert_eq!(fan_in.phase(), Phase::Idle);

        let mut iter = fan_in.iter().unwrap();
        assert!(iter.has_next().unwrap());
        assert_eq!(iter.next_value(), -1);
        assert!(iter.has_next().unwrap());
        // has_next is idempotent until the element is taken
        assert!(iter.has_next().unwrap());
        assert_eq!(iter.next_value(), -2);
        assert_eq!(fan_in.phase(), Phase::Idle);

        let rest = iter.by_ref().collect::<Vec<_>>();
        assert_eq!(fan_in.phase(), Phase::Draining);
        assert_eq!(sorted(rest), (0..30).collect::<Vec<_>>());
        assert!(!iter.has_next().unwrap());
    }

    #[test]
    fn second_live_iterator_is_rejected() {
        let fan_in = UncachedFanIn::<u8>::new();
        let iter = fan_in.iter().unwrap();
        assert!(fan_in.in_use());
        assert_eq!(fan_in.iter().err(), Some(InUseError));
        drop(iter);
        assert!(!fan_in.in_use());
        assert!(fan_in.iter().is_ok());
    }

    #[test]
    fn draining_is_destructive() {
        let fan_in = UncachedFanIn::new();
        fan_in.add(100);
        fan_in.add_source(from_iter(vec![1, 2, 3]));
        assert_eq!(sorted(fan_in.iter().unwrap().collect()), vec![1, 2, 3, 100]);
        // pre-known elements are replayed, source elements are gone
        assert_eq!(fan_in.iter().unwrap().collect::<Vec<_>>(), vec![100]);
    }

    #[test]
    #[should_panic(expected = "without a preceding successful has_next")]
    fn next_value_without_has_next_panics() {
        let fan_in = UncachedFanIn::<u8>::new();
        fan_in.add(1);
        let mut iter = fan_in.iter().unwrap();
        iter.next_value();
    }

    #[test]
    fn stop_mid_drain_stops_everything() {
        let fan_in = UncachedFanIn::new();
        fan_in.add_source(from_iter(0u32..));
        fan_in.add_source(from_iter(0u32..));
        fan_in.add_source(from_iter(0u32..));

        let consumer = {
            let fan_in = fan_in.clone();
            thread::spawn(move || {
                let mut iter = fan_in.iter().unwrap();
                let mut n = 0;
                while iter.has_next().unwrap() {
                    iter.next_value();
                    n += 1;
                    thread::sleep(Duration::from_millis(1));
                }
                n
            })
        };
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        fan_in.stop();
        assert!(consumer.join().unwrap() > 0);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(fan_in.phase(), Phase::Stopped);
        assert_eq!(fan_in.active_sources(), 0);
        assert_eq!(fan_in.running_workers(), 0);
    }

    #[test]
    fn propagated_source_failure_ends_iterator() {
        struct Failing(u32);

        impl Source<u32> for Failing {
            fn pull(&mut self) -> anyhow::Result<Option<u32>> {
                if self.0 == 0 {
                    anyhow::bail!("disk on fire");
                }
                self.0 -= 1;
                Ok(Some(self.0))
            }
        }

        let fan_in = UncachedFanIn::with_config(
            FanInConfig::default().with_source_error_policy(SourceErrorPolicy::Propagate),
        );
        fan_in.add_source(Failing(2));
        let mut iter = fan_in.iter().unwrap();
        assert!(iter.has_next().unwrap());
        assert_eq!(iter.next_value(), 1);
        assert!(iter.has_next().unwrap());
        assert_eq!(iter.next_value(), 0);
        assert!(matches!(iter.has_next(), Err(FanInError::Source(_))));
    }

    #[test]
    fn request_timeout() {
        struct Stalled;

        impl Source<u32> for Stalled {
            fn pull(&mut self) -> anyhow::Result<Option<u32>> {
                thread::sleep(Duration::from_millis(200));
                Ok(None)
            }
        }

        let fan_in = UncachedFanIn::with_config(
            FanInConfig::default().with_request_timeout(Duration::from_millis(20)),
        );
        fan_in.add_source(Stalled);
        let mut iter = fan_in.iter().unwrap();
        assert!(matches!(iter.has_next(), Err(FanInError::Timeout(_))));
        drop(iter);
        fan_in.stop();
        assert_eq!(fan_in.phase(), Phase::Stopped);
    }

    #[test]
    fn source_added_after_stop_is_closed() {
        let fan_in = UncachedFanIn::new();
        fan_in.stop();
        let source = from_iter(0..3);
        let closer = source.closer();
        fan_in.add_source(source);
        assert!(closer.is_closed());
        assert_eq!(fan_in.iter().unwrap().count(), 0);
    }
}
