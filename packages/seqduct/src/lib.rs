//! Lazy sequences which can be merged, cached, and moved between processes.
//!
//! - A [`Source`] is a lazily produced, possibly blocking sequence of elements.
//! - [`CachedFanIn`] and [`UncachedFanIn`] merge a list of known elements with any number of
//!   sources into one logical sequence. Sources are only started once a consumer reaches them,
//!   and each is kept at most one element ahead of the consumer.
//! - The [`socket`] module moves a sequence over TCP with credit-based flow control, so that
//!   elements are only produced on the sending side once the receiving side asks for them.
//!
//! Blocking is done on plain OS threads. With the `futures` feature (on by default), a
//! `futures::Stream` may be used as a source with [`source::from_stream`].

#[macro_use]
extern crate tracing;

pub extern crate bytes;

pub mod config;
pub mod error;
pub mod source;
pub mod socket;
mod fan_in;
mod local;
mod pull;

pub use crate::{
    config::{FanInConfig, SourceErrorPolicy, TransportConfig},
    fan_in::{
        cached::{CachedFanIn, CachedIter},
        uncached::{Phase, UncachedFanIn, UncachedIter},
    },
    local::LocalSequence,
    socket::{PushEndpoint, ReceivedSequence, RelayHandle, SendOutcome, SendReport},
    source::{BoxSource, Closer, Source},
};
