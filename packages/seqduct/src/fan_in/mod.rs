// fan-ins: several lazy sources merged into one logical sequence.
//
// both flavors share the same machinery:
//
//   source ---> worker thread ---\
//   source ---> worker thread ----+--> PullChannel (single slot) --> consumer cursor
//   source ---> worker thread ---/
//
// - sources sit in SourceSet.pending until a cursor reaches the live edge, at which point each
//   gets one worker thread and one Producer handle.
// - a worker pulls one element, then blocks in Producer::offer until the consumer grants a
//   request. so each source is at most one element ahead of the consumer.
// - closing bumps the channel epoch (which makes every blocked offer return Stop) and runs every
//   source's Closer (which makes every blocked pull return), then joins the workers.
//
// the flavors differ only in what happens to a delivered element: cached appends it to a
// LocalSequence that every cursor replays, uncached hands it to its one cursor and forgets it.

pub(crate) mod cached;
pub(crate) mod uncached;

use crate::{
    config::{FanInConfig, SourceErrorPolicy},
    error::SourceError,
    pull::{Offer, Producer, PullChannel},
    source::{BoxSource, Closer},
};
use smallvec::SmallVec;
use std::thread::{self, JoinHandle};


// what travels through a fan-in's channel.
pub(crate) type Delivery<T> = Result<T, SourceError>;

// most fan-ins merge a handful of sources.
const INLINE_SOURCES: usize = 4;

// registered sources of one fan-in, started or not.
pub(crate) struct SourceSet<T> {
    // registered, not yet activated.
    pending: SmallVec<[BoxSource<T>; INLINE_SOURCES]>,
    // activated. entries are reaped once their thread has finished.
    running: SmallVec<[Worker; INLINE_SOURCES]>,
    // for naming worker threads.
    next_id: u64,
}

// a started source.
struct Worker {
    closer: Closer,
    join: JoinHandle<()>,
}

// everything needed to finish closing a fan-in, taken out from under its lock.
#[must_use]
pub(crate) struct Teardown {
    closers: Vec<Closer>,
    joins: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> SourceSet<T> {
    pub(crate) fn new() -> Self {
        SourceSet {
            pending: SmallVec::new(),
            running: SmallVec::new(),
            next_id: 0,
        }
    }

    pub(crate) fn add(&mut self, source: BoxSource<T>) {
        self.pending.push(source);
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    // number of worker threads which have not yet exited.
    pub(crate) fn running_workers(&self) -> usize {
        self.running.iter().filter(|worker| !worker.join.is_finished()).count()
    }

    // give every pending source a worker thread registered on `chan`.
    pub(crate) fn start_pending(&mut self, chan: &PullChannel<Delivery<T>>, config: &FanInConfig) {
        self.reap();
        for source in self.pending.drain(..) {
            let id = self.next_id;
            self.next_id += 1;

            let closer = source.closer();
            let producer = chan.register();
            let policy = config.on_source_error;
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, id))
                .spawn(move || run_worker(source, producer, policy, id));
            match spawned {
                Ok(join) => self.running.push(Worker { closer, join }),
                Err(e) => {
                    // the closure was dropped with the source and producer inside it, so the
                    // producer is already deregistered
                    warn!(worker = id, error = %e, "failed to spawn source worker");
                    closer.close();
                }
            }
        }
    }

    // take every source out of the set, for closing outside the fan-in's lock.
    pub(crate) fn take_all(&mut self) -> Teardown {
        let mut closers = Vec::with_capacity(self.pending.len() + self.running.len());
        for source in self.pending.drain(..) {
            closers.push(source.closer());
        }
        let mut joins = Vec::with_capacity(self.running.len());
        for worker in self.running.drain(..) {
            closers.push(worker.closer);
            joins.push(worker.join);
        }
        Teardown { closers, joins }
    }

    // join and forget finished workers.
    fn reap(&mut self) {
        let mut i = 0;
        while i < self.running.len() {
            if self.running[i].join.is_finished() {
                let worker = self.running.remove(i);
                if worker.join.join().is_err() {
                    warn!("source worker panicked");
                }
            } else {
                i += 1;
            }
        }
    }
}

impl Teardown {
    // close every source, then wait for every worker to exit.
    //
    // the channel must already be closed, so workers blocked on offer are released. workers
    // blocked inside a pull are released by their source's closer.
    pub(crate) fn run(self) {
        for closer in &self.closers {
            closer.close();
        }
        for join in self.joins {
            if join.join().is_err() {
                warn!("source worker panicked");
            }
        }
    }
}

// body of a source worker thread.
fn run_worker<T>(
    mut source: BoxSource<T>,
    producer: Producer<Delivery<T>>,
    policy: SourceErrorPolicy,
    id: u64,
) {
    debug!(worker = id, "source worker started");
    let mut delivered: u64 = 0;
    loop {
        if producer.is_cancelled() {
            break;
        }
        match source.pull() {
            Ok(Some(item)) => {
                if producer.offer(Ok(item)) == Offer::Stop {
                    break;
                }
                delivered += 1;
            }
            Ok(None) => break,
            Err(e) => {
                match policy {
                    SourceErrorPolicy::EndSource => {
                        warn!(worker = id, error = %e, "source failed, ending it");
                    }
                    SourceErrorPolicy::Propagate => {
                        debug!(worker = id, error = %e, "source failed, propagating");
                        let _ = producer.offer(Err(SourceError::from(e)));
                    }
                }
                break;
            }
        }
    }
    source.closer().close();
    debug!(worker = id, delivered, "source worker finished");
    // dropping the producer deregisters it, waking the consumer if it was the last one
}
