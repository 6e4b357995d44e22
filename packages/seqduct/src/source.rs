//! Lazy single-pass sequences that feed fan-ins and socket senders.

use std::{
    fmt::{self, Formatter, Debug},
    marker::PhantomData,
    sync::{
        atomic::{
            Ordering::{AcqRel, Acquire},
            AtomicBool,
        },
        Arc,
        Mutex,
    },
};


/// A lazily-produced, single-pass sequence of `T`
///
/// Elements are only produced when [`pull`](Self::pull) is called. Whoever registers a source with
/// a fan-in (or hands it to [`send`](crate::socket::send)) gives up ownership of it, and the
/// receiving side is responsible for closing it once it is exhausted or torn down.
pub trait Source<T>: Send {
    /// Produce the next element
    ///
    /// `Ok(None)` means the source is exhausted and will not be pulled again. An error ends the
    /// source as well; what happens to the error is up to whoever is pulling.
    fn pull(&mut self) -> anyhow::Result<Option<T>>;

    /// Get a handle that can close this source from another thread
    ///
    /// Closing must make a `pull` that is blocked on an OS resource return. Sources with nothing
    /// to release keep the default no-op closer.
    fn closer(&self) -> Closer {
        Closer::noop()
    }
}

impl<T, S: Source<T> + ?Sized> Source<T> for Box<S> {
    fn pull(&mut self) -> anyhow::Result<Option<T>> {
        (**self).pull()
    }

    fn closer(&self) -> Closer {
        (**self).closer()
    }
}

/// Boxed source, as stored by fan-ins
pub type BoxSource<T> = Box<dyn Source<T> + 'static>;


// ==== closer ====


/// Thread-safe handle which closes a [`Source`]
///
/// Cloning yields another handle to the same source. The close action runs at most once no matter
/// how many handles call [`close`](Self::close).
#[derive(Clone)]
pub struct Closer(Arc<CloseCell>);

struct CloseCell {
    closed: AtomicBool,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Closer {
    /// Closer which runs `action` the first time it is closed
    pub fn new<F: FnOnce() + Send + 'static>(action: F) -> Self {
        Closer(Arc::new(CloseCell {
            closed: AtomicBool::new(false),
            action: Mutex::new(Some(Box::new(action))),
        }))
    }

    /// Closer with nothing to release, which only records that it was closed
    pub fn noop() -> Self {
        Closer(Arc::new(CloseCell {
            closed: AtomicBool::new(false),
            action: Mutex::new(None),
        }))
    }

    /// Close the source, if not already closed
    pub fn close(&self) {
        if self.0.closed.swap(true, AcqRel) {
            return;
        }
        // a poisoned lock just means a previous action panicked, which we treat as done
        let action = match self.0.action.lock() {
            Ok(mut lock) => lock.take(),
            Err(_) => None,
        };
        if let Some(action) = action {
            action();
        }
    }

    /// Whether [`close`](Self::close) has been called on any handle
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Acquire)
    }
}

impl Debug for Closer {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Closer").field("closed", &self.is_closed()).finish()
    }
}


// ==== adapters ====


/// [`Source`] over an iterator, see [`from_iter`]
pub struct IterSource<I> {
    iter: I,
    closer: Closer,
}

/// Wrap any iterator as a [`Source`]
///
/// Once closed, the source reports exhaustion on its next pull.
pub fn from_iter<I>(iter: I) -> IterSource<I::IntoIter>
where
    I: IntoIterator,
    I::IntoIter: Send,
{
    IterSource {
        iter: iter.into_iter(),
        closer: Closer::noop(),
    }
}

impl<I> Source<I::Item> for IterSource<I>
where
    I: Iterator + Send,
{
    fn pull(&mut self) -> anyhow::Result<Option<I::Item>> {
        if self.closer.is_closed() {
            return Ok(None);
        }
        Ok(self.iter.next())
    }

    fn closer(&self) -> Closer {
        self.closer.clone()
    }
}

/// [`Source`] which applies a function to each element of another source, see [`map`]
pub struct Map<S, F, T> {
    inner: S,
    f: F,
    _input: PhantomData<fn(T)>,
}

/// Lazily apply `f` to every element pulled from `source`
pub fn map<T, U, S, F>(source: S, f: F) -> Map<S, F, T>
where
    S: Source<T>,
    F: FnMut(T) -> U + Send,
{
    Map { inner: source, f, _input: PhantomData }
}

impl<T, U, S, F> Source<U> for Map<S, F, T>
where
    S: Source<T>,
    F: FnMut(T) -> U + Send,
{
    fn pull(&mut self) -> anyhow::Result<Option<U>> {
        Ok(self.inner.pull()?.map(&mut self.f))
    }

    fn closer(&self) -> Closer {
        self.inner.closer()
    }
}

/// [`Source`] over a `futures` stream, see [`from_stream`]
#[cfg(feature = "futures")]
pub struct StreamSource<St: futures::Stream + Unpin> {
    inner: futures::executor::BlockingStream<St>,
    closer: Closer,
}

/// Wrap a `futures` stream as a blocking [`Source`]
///
/// Each pull blocks the pulling thread on the stream's next item.
#[cfg(feature = "futures")]
pub fn from_stream<St>(stream: St) -> StreamSource<St>
where
    St: futures::Stream + Unpin + Send,
{
    StreamSource {
        inner: futures::executor::block_on_stream(stream),
        closer: Closer::noop(),
    }
}

#[cfg(feature = "futures")]
impl<St> Source<St::Item> for StreamSource<St>
where
    St: futures::Stream + Unpin + Send,
{
    fn pull(&mut self) -> anyhow::Result<Option<St::Item>> {
        if self.closer.is_closed() {
            return Ok(None);
        }
        Ok(self.inner.next())
    }

    fn closer(&self) -> Closer {
        self.closer.clone()
    }
}
