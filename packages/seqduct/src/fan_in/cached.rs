// fan-in which keeps everything it has ever pulled.

use super::{Delivery, SourceSet};
use crate::{
    config::FanInConfig,
    error::FanInError,
    local::LocalSequence,
    pull::{PullChannel, Timeout},
    source::{Closer, Source},
};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};


/// Fan-in which retains every element pulled from its sources
///
/// Explicitly added elements and elements pulled from sources are appended to one cache, in the
/// order in which they arrived. Every cursor from [`iter`](Self::iter) first replays the cache and
/// then, once it reaches the live edge, pulls fresh elements from the sources and appends them. So
/// multiple traversals each see every element exactly once, and sources are only ever drained
/// once.
///
/// Sources are activated lazily: nothing is pulled until a cursor needs an element that is not in
/// the cache yet. Across sources, the order of pulled elements is unspecified. Within one source,
/// it is preserved.
///
/// This is a handle: clones refer to the same fan-in, so it may be closed from another thread
/// while a cursor is draining it.
pub struct CachedFanIn<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    // notified whenever a cursor finishes a request, so in_flight or items changed.
    settled: Condvar,
    chan: PullChannel<Delivery<T>>,
    config: FanInConfig,
}

struct State<T> {
    // append-only while open. entries never move once written.
    items: LocalSequence<T>,
    sources: SourceSet<T>,
    // cursors between arming a request and appending what it delivered.
    in_flight: usize,
    closed: bool,
}

impl<T: Clone + Send + 'static> CachedFanIn<T> {
    /// Construct empty and open, with default configuration
    pub fn new() -> Self {
        Self::with_config(FanInConfig::default())
    }

    /// Construct empty and open
    pub fn with_config(config: FanInConfig) -> Self {
        CachedFanIn {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: LocalSequence::new(),
                    sources: SourceSet::new(),
                    in_flight: 0,
                    closed: false,
                }),
                settled: Condvar::new(),
                chan: PullChannel::new(),
                config,
            }),
        }
    }

    /// Append an element to the cache
    pub fn add(&self, item: T) {
        self.inner.lock().items.add(item);
    }

    /// Register a source
    ///
    /// The source is not pulled from until a cursor reaches the live edge.
    pub fn add_source<S: Source<T> + 'static>(&self, source: S) {
        self.inner.lock().sources.add(Box::new(source));
    }

    /// Start a traversal from the beginning of the cache
    pub fn iter(&self) -> CachedIter<T> {
        CachedIter {
            fan_in: Arc::clone(&self.inner),
            idx: 0,
            error: None,
        }
    }

    /// Close every source, stop every worker, and mark closed
    ///
    /// The cache is kept. Cursors finish once they have replayed it. Returns once every worker
    /// thread has exited.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Re-open after [`close`](Self::close), so sources registered from now on can be pulled
    ///
    /// The cache is kept.
    pub fn reopen(&self) {
        let mut state = self.inner.lock();
        state.closed = false;
        self.inner.chan.reopen();
        debug!("cached fan-in reopened");
    }

    /// [`close`](Self::close), then drop the cache
    pub fn clear(&self) {
        self.inner.close();
        self.inner.lock().items.clear();
    }

    /// Copy of the cache as it is now
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().items.iter().cloned().collect()
    }

    /// Number of cached elements
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`close`](Self::close) has been called since construction or the last
    /// [`reopen`](Self::reopen)
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
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
    fn close(&self) {
        let teardown = {
            let mut state = self.lock();
            state.closed = true;
            self.chan.close();
            self.settled.notify_all();
            state.sources.take_all()
        };
        teardown.run();
        debug!("cached fan-in closed");
    }
}

impl<T: Clone + Send + 'static> Default for CachedFanIn<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CachedFanIn<T> {
    fn clone(&self) -> Self {
        CachedFanIn { inner: Arc::clone(&self.inner) }
    }
}


/// Cursor over a [`CachedFanIn`]
///
/// Iterating yields cached elements first, then freshly pulled ones. If pulling fails (a request
/// timeout, or a source failure under [`SourceErrorPolicy::Propagate`][1]), iteration ends and the
/// failure is kept as the cursor's [`terminal_error`](Self::terminal_error).
///
/// [1]: crate::config::SourceErrorPolicy::Propagate
pub struct CachedIter<T> {
    fan_in: Arc<Inner<T>>,
    // index of the next cache entry this cursor will yield.
    idx: usize,
    error: Option<FanInError>,
}

impl<T: Clone + Send + 'static> CachedIter<T> {
    /// Get the next element, pulling from the sources if the cache is exhausted
    ///
    /// `Ok(None)` means the end of the sequence: the cache has been fully replayed and no source
    /// remains (or the fan-in is closed).
    pub fn try_next(&mut self) -> Result<Option<T>, FanInError> {
        loop {
            {
                let mut state = self.fan_in.lock();
                if let Some(item) = state.items.get(self.idx) {
                    self.idx += 1;
                    return Ok(Some(item.clone()));
                }
                if state.closed {
                    return Ok(None);
                }
                if state.sources.has_pending() {
                    state.sources.start_pending(&self.fan_in.chan, &self.fan_in.config);
                }
                state.in_flight += 1;
            }

            let timeout = Timeout::after(self.fan_in.config.request_timeout);
            let delivery = self.fan_in.chan.request_next(timeout);

            let mut state = self.fan_in.lock();
            state.in_flight -= 1;
            self.fan_in.settled.notify_all();
            match delivery? {
                Some(Ok(item)) => {
                    // append, then loop around to yield by index, since another cursor may have
                    // appended ahead of us
                    trace!("cached fan-in pulled element");
                    state.items.add(item);
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    // another cursor may hold the last delivery without having appended it yet
                    while self.idx >= state.items.len() && state.in_flight > 0 && !state.closed {
                        state = self.fan_in.settled
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    if self.idx >= state.items.len() && !state.sources.has_pending() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// The failure which ended this cursor, if any
    pub fn terminal_error(&self) -> Option<&FanInError> {
        self.error.as_ref()
    }

    /// Number of elements this cursor has yielded so far
    pub fn position(&self) -> usize {
        self.idx
    }
}

impl<T: Clone + Send + 'static> Iterator for CachedIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.error.is_some() {
            return None;
        }
        match self.try_next() {
            Ok(item) => item,
            Err(e) => {
                debug!(error = %e, "cached fan-in cursor failed");
                self.error = Some(e);
                None
            }
        }
    }
}

impl<T: Clone + Send + 'static> Source<T> for CachedIter<T> {
    fn pull(&mut self) -> anyhow::Result<Option<T>> {
        Ok(self.try_next()?)
    }

    // closing a cursor used as a source closes the fan-in behind it
    fn closer(&self) -> Closer {
        let fan_in = Arc::clone(&self.fan_in);
        Closer::new(move || fan_in.close())
    }
}
