// single-slot rendez-vous between the source workers of a fan-in and its consumer.
//
// the consumer arms a grant, and exactly one producer may answer that grant with exactly one
// value. nothing is ever buffered beyond that one value, so the consumer fully controls pacing.
//
// cancellation is by epoch: closing the channel bumps the epoch, and any producer registered under
// an older epoch gets Offer::Stop from then on, even if the channel has been reopened since.

use crate::error::WouldBlockError;
use std::{
    sync::{
        Arc,
        Condvar,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::{Duration, Instant},
};


// timeout for blocking on the channel.
#[derive(Debug, Copy, Clone)]
pub(crate) enum Timeout {
    // never time out.
    Never,
    // time out at the given deadline.
    At(Instant),
    // time out if the request cannot be answered without blocking.
    #[cfg(test)]
    NonBlocking,
}

impl Timeout {
    // deadline that far from now, or never.
    pub(crate) fn after(duration: Option<Duration>) -> Self {
        match duration {
            Some(duration) => Timeout::At(Instant::now() + duration),
            None => Timeout::Never,
        }
    }
}

// what a producer should do after offering.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[must_use]
pub(crate) enum Offer {
    // the value was delivered, keep producing.
    Continue,
    // the channel was closed, the value was dropped. stop producing.
    Stop,
}

// consumer-side handle to a channel.
pub(crate) struct PullChannel<T>(Arc<Shared<T>>);

// channel shared state.
struct Shared<T> {
    lockable: Mutex<Lockable<T>>,
    // notified on every state change. producers and consumers share it.
    cond: Condvar,
}

// channel lockable state.
struct Lockable<T> {
    // set by a consumer request, cleared by the producer that answers it.
    granted: bool,
    // invariant: at most one undelivered value.
    pending: Option<T>,
    // number of live Producer handles.
    producers: usize,
    // bumped on every close.
    epoch: u64,
    closed: bool,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Lockable<T>> {
        self.lockable.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> PullChannel<T> {
    // construct open, with no producers.
    pub(crate) fn new() -> Self {
        PullChannel(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                granted: false,
                pending: None,
                producers: 0,
                epoch: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }))
    }

    // register a producer under the current epoch.
    pub(crate) fn register(&self) -> Producer<T> {
        let mut lock = self.0.lock();
        lock.producers += 1;
        Producer {
            shared: Arc::clone(&self.0),
            epoch: lock.epoch,
        }
    }

    // number of live producers.
    pub(crate) fn producers(&self) -> usize {
        self.0.lock().producers
    }

    // request one value from whichever producer answers first.
    //
    // - Ok(Some) when a producer delivered.
    // - Ok(None) when no producers remain or the channel is closed.
    // - Err on timeout. the grant stays armed, so a late delivery goes to the next request.
    pub(crate) fn request_next(&self, timeout: Timeout) -> Result<Option<T>, WouldBlockError> {
        let mut lock = self.0.lock();
        loop {
            if lock.closed {
                return Ok(None);
            }
            if let Some(value) = lock.pending.take() {
                return Ok(Some(value));
            }
            if lock.producers == 0 {
                lock.granted = false;
                return Ok(None);
            }
            if !lock.granted {
                lock.granted = true;
                self.0.cond.notify_all();
            }

            match timeout {
                Timeout::Never => {
                    lock = self.0.cond.wait(lock).unwrap_or_else(PoisonError::into_inner);
                }
                Timeout::At(deadline) => {
                    let Some(duration) = deadline.checked_duration_since(Instant::now())
                        else { return Err(WouldBlockError) };
                    let (lock_2, _) = self.0.cond
                        .wait_timeout(lock, duration)
                        .unwrap_or_else(PoisonError::into_inner);
                    lock = lock_2;
                }
                #[cfg(test)]
                Timeout::NonBlocking => return Err(WouldBlockError),
            }
        }
    }

    // cancel every registered producer and wake everyone. drops any undelivered value.
    pub(crate) fn close(&self) {
        let mut lock = self.0.lock();
        lock.closed = true;
        lock.epoch += 1;
        lock.granted = false;
        lock.pending = None;
        self.0.cond.notify_all();
    }

    // accept requests and newly registered producers again.
    pub(crate) fn reopen(&self) {
        let mut lock = self.0.lock();
        lock.closed = false;
        lock.granted = false;
    }
}

// producer handle to a channel. one per source worker. dropping it deregisters.
pub(crate) struct Producer<T> {
    shared: Arc<Shared<T>>,
    epoch: u64,
}

impl<T> Producer<T> {
    // block until a consumer grants a request, then deliver the value.
    pub(crate) fn offer(&self, value: T) -> Offer {
        let mut lock = self.shared.lock();
        loop {
            if lock.epoch != self.epoch {
                return Offer::Stop;
            }
            if lock.granted && lock.pending.is_none() {
                lock.pending = Some(value);
                lock.granted = false;
                self.shared.cond.notify_all();
                return Offer::Continue;
            }
            lock = self.shared.cond.wait(lock).unwrap_or_else(PoisonError::into_inner);
        }
    }

    // whether the channel has been closed since this producer registered.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.shared.lock().epoch != self.epoch
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        let mut lock = self.shared.lock();
        lock.producers -= 1;
        if lock.producers == 0 {
            // wake any consumer waiting on a request that can no longer be answered
            self.shared.cond.notify_all();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering::SeqCst},
        thread,
    };

    #[test]
    fn hands_off_in_order_then_finishes() {
        let chan = PullChannel::new();
        let producer = chan.register();
        let join = thread::spawn(move || {
            for i in 1..=100 {
                assert_eq!(producer.offer(i), Offer::Continue);
            }
        });
        for i in 1..=100 {
            assert_eq!(chan.request_next(Timeout::Never), Ok(Some(i)));
        }
        assert_eq!(chan.request_next(Timeout::Never), Ok(None));
        join.join().unwrap();
        assert_eq!(chan.producers(), 0);
    }

    #[test]
    fn producer_never_runs_ahead() {
        let chan = PullChannel::new();
        let producer = chan.register();
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_2 = Arc::clone(&delivered);
        let join = thread::spawn(move || {
            for i in 0..3 {
                if producer.offer(i) == Offer::Stop {
                    break;
                }
                delivered_2.fetch_add(1, SeqCst);
            }
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(delivered.load(SeqCst), 0);
        assert_eq!(chan.request_next(Timeout::Never), Ok(Some(0)));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(delivered.load(SeqCst), 1);
        chan.close();
        join.join().unwrap();
        assert_eq!(delivered.load(SeqCst), 1);
    }

    #[test]
    fn times_out_without_delivery() {
        let chan = PullChannel::<u32>::new();
        let _producer = chan.register();
        assert_eq!(chan.request_next(Timeout::NonBlocking), Err(WouldBlockError));
        assert_eq!(
            chan.request_next(Timeout::after(Some(Duration::from_millis(20)))),
            Err(WouldBlockError),
        );
    }

    #[test]
    fn late_delivery_goes_to_next_request() {
        let chan = PullChannel::new();
        let producer = chan.register();
        assert_eq!(chan.request_next(Timeout::NonBlocking), Err(WouldBlockError));
        // grant is still armed, so this does not block
        assert_eq!(producer.offer(7), Offer::Continue);
        assert_eq!(chan.request_next(Timeout::NonBlocking), Ok(Some(7)));
    }

    #[test]
    fn close_cancels_across_reopen() {
        let chan = PullChannel::new();
        let producer = chan.register();
        chan.close();
        chan.reopen();
        assert!(producer.is_cancelled());
        assert_eq!(producer.offer(1), Offer::Stop);
        let fresh = chan.register();
        assert!(!fresh.is_cancelled());
        assert_eq!(chan.producers(), 2);
        drop(producer);
        drop(fresh);
        assert_eq!(chan.request_next(Timeout::Never), Ok(None));
    }

    #[test]
    fn many_producers_each_value_once() {
        let chan = PullChannel::new();
        let joins = (0..4)
            .map(|p| {
                let producer = chan.register();
                thread::spawn(move || {
                    for i in 0..50 {
                        if producer.offer(p * 1000 + i) == Offer::Stop {
                            break;
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        let mut got = Vec::new();
        while let Some(v) = chan.request_next(Timeout::Never).unwrap() {
            got.push(v);
        }
        for join in joins {
            join.join().unwrap();
        }
        got.sort();
        let mut expected = (0..4)
            .flat_map(|p| (0..50).map(move |i| p * 1000 + i))
            .collect::<Vec<_>>();
        expected.sort();
        assert_eq!(got, expected);
    }
}
