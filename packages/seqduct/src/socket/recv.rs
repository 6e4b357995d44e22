// receiving half of the socket adapter.

use super::{
    codec::{Bincode, Codec},
    frame::{write_credit, Frame, FrameReader},
};
use crate::{
    config::TransportConfig,
    error::{is_connection_lost, RecvError},
    source::{Closer, Source},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    io::BufReader,
    marker::PhantomData,
    net::{Shutdown, TcpStream},
};


/// Receive a sequence from `stream` with the default codec and configuration
pub fn receive<T>(stream: TcpStream) -> Result<ReceivedSequence<T>, RecvError>
where
    T: Serialize + DeserializeOwned,
{
    receive_with(stream, Bincode, &TransportConfig::default())
}

/// Receive a sequence from `stream`
///
/// Nothing is read or requested until the returned sequence is first asked for an element.
pub fn receive_with<T, C: Codec<T>>(
    stream: TcpStream,
    codec: C,
    config: &TransportConfig,
) -> Result<ReceivedSequence<T, C>, RecvError> {
    config.apply(&stream)?;
    let read_half = stream.try_clone()?;
    let close_half = stream.try_clone()?;
    debug!(peer = ?stream.peer_addr().ok(), "receiving sequence");
    Ok(ReceivedSequence {
        stream,
        frames: FrameReader::new(BufReader::new(read_half), config.max_frame_len),
        codec,
        current: None,
        open: true,
        received: 0,
        closer: Closer::new(move || {
            let _ = close_half.shutdown(Shutdown::Both);
        }),
        _p: PhantomData,
    })
}

/// A sequence arriving over a socket, requested one element at a time
///
/// Each [`has_next`](Self::has_next) which needs a new element writes exactly one credit byte and
/// reads exactly one frame, so the sender never gets more than one element ahead.
///
/// Any failure is fatal for the sequence: it is returned once, the connection is closed, and the
/// sequence behaves as ended afterwards.
pub struct ReceivedSequence<T, C = Bincode> {
    // credit direction, and the handle used for closing.
    stream: TcpStream,
    frames: FrameReader<BufReader<TcpStream>>,
    codec: C,
    // element fetched by has_next, not yet taken by next_value.
    current: Option<T>,
    open: bool,
    received: u64,
    closer: Closer,
    _p: PhantomData<fn() -> T>,
}

impl<T, C: Codec<T>> ReceivedSequence<T, C> {
    /// Make sure an element is ready for [`next_value`](Self::next_value), returning whether there
    /// is one
    ///
    /// Idempotent until the element is taken.
    pub fn has_next(&mut self) -> Result<bool, RecvError> {
        if self.current.is_some() {
            return Ok(true);
        }
        if !self.open {
            return Ok(false);
        }
        match self.fetch() {
            Ok(Some(item)) => {
                self.received += 1;
                self.current = Some(item);
                Ok(true)
            }
            Ok(None) => {
                debug!(received = self.received, "received sequence ended");
                self.close();
                Ok(false)
            }
            Err(e) => {
                debug!(received = self.received, error = %e, "received sequence failed");
                self.close();
                Err(e)
            }
        }
    }

    // request and read one element.
    fn fetch(&mut self) -> Result<Option<T>, RecvError> {
        match write_credit(&mut &self.stream) {
            Ok(()) => (),
            // sender already gone, which it is allowed to be once it has nothing more to send
            Err(e) if is_connection_lost(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        trace!("granted credit");
        match self.frames.read_frame()? {
            Some(Frame::Element(payload)) => {
                trace!(len = payload.len(), "received element");
                self.codec.decode(&payload).map(Some).map_err(RecvError::Decode)
            }
            Some(Frame::End) | None => Ok(None),
        }
    }

    /// Take the element made ready by the last successful [`has_next`](Self::has_next)
    ///
    /// # Panics
    ///
    /// If not preceded by a `has_next` which returned `Ok(true)`.
    pub fn next_value(&mut self) -> T {
        self.current.take()
            .expect("ReceivedSequence.next_value called without a preceding successful has_next")
    }

    /// Number of elements received so far
    pub fn received(&self) -> u64 {
        self.received
    }
}

impl<T, C> ReceivedSequence<T, C> {
    /// Close the connection. Elements not yet received are abandoned.
    pub fn close(&mut self) {
        if self.open {
            self.open = false;
            self.closer.close();
        }
    }

    /// Whether the connection is still open
    pub fn is_open(&self) -> bool {
        self.open && !self.closer.is_closed()
    }
}

impl<T, C: Codec<T>> Iterator for ReceivedSequence<T, C> {
    type Item = Result<T, RecvError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => Some(Ok(self.next_value())),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl<T: Send, C: Codec<T>> Source<T> for ReceivedSequence<T, C> {
    fn pull(&mut self) -> anyhow::Result<Option<T>> {
        Ok(if self.has_next()? { Some(self.next_value()) } else { None })
    }

    // shuts the socket down, unblocking a pull stuck reading from it
    fn closer(&self) -> Closer {
        self.closer.clone()
    }
}

impl<T, C> Drop for ReceivedSequence<T, C> {
    fn drop(&mut self) {
        // the closer may outlive us inside a fan-in, so shut down rather than rely on the fd
        // being dropped
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
