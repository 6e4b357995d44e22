// push side of a sequence connection, for producers which hand over elements one at a time.

use super::{
    codec::{Bincode, Codec},
    frame::{read_credit, FrameWriter},
};
use crate::{config::TransportConfig, error::SendError};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    marker::PhantomData,
    net::{Shutdown, TcpStream, ToSocketAddrs},
};


/// Sending endpoint which the caller pushes elements into
///
/// The counterpart of [`send`][1] for producers which are not themselves a
/// [`Source`](crate::Source). The remote side reads with [`receive`][2] as usual, and each
/// [`send`](Self::send) blocks until the remote side has asked for an element.
///
/// [1]: crate::socket::send
/// [2]: crate::socket::receive
pub struct PushEndpoint<T, C = Bincode> {
    conn: Option<TcpStream>,
    frames: FrameWriter,
    codec: C,
    config: TransportConfig,
    credits_received: u64,
    elements_sent: u64,
    _p: PhantomData<fn(&T)>,
}

impl<T: Serialize + DeserializeOwned> PushEndpoint<T> {
    /// Construct unconnected, with the default codec and configuration
    pub fn new() -> Self {
        Self::with_codec(Bincode, TransportConfig::default())
    }
}

impl<T: Serialize + DeserializeOwned> Default for PushEndpoint<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C: Codec<T>> PushEndpoint<T, C> {
    /// Construct unconnected
    pub fn with_codec(codec: C, config: TransportConfig) -> Self {
        PushEndpoint {
            conn: None,
            frames: FrameWriter::new(),
            codec,
            config,
            credits_received: 0,
            elements_sent: 0,
            _p: PhantomData,
        }
    }

    /// Connect to a receiving peer, closing any previous connection first
    pub fn connect<A: ToSocketAddrs>(&mut self, addr: A) -> Result<(), SendError> {
        self.close();
        let mut stream = TcpStream::connect(addr)?;
        self.config.apply(&stream)?;
        self.frames = FrameWriter::new();
        self.frames.version();
        self.frames.flush_to(&mut stream)?;
        debug!(peer = ?stream.peer_addr().ok(), "push endpoint connected");
        self.credits_received = 0;
        self.elements_sent = 0;
        self.conn = Some(stream);
        Ok(())
    }

    /// Send one element once the peer asks for one
    ///
    /// Returns `Ok(false)` without sending if not connected, or if the peer has gone away, in
    /// which case the connection is closed. On error the connection is closed too.
    pub fn send(&mut self, item: &T) -> Result<bool, SendError> {
        if self.conn.is_none() {
            return Ok(false);
        }
        // encode first so a bad element does not consume a credit
        let payload = self.codec.encode(item).map_err(SendError::Encode)?;

        let Some(mut stream) = self.conn.as_ref() else { return Ok(false) };
        let credited = match read_credit(&mut stream) {
            Ok(credited) => credited,
            Err(e) => {
                self.close();
                return Err(e.into());
            }
        };
        if !credited {
            debug!(sent = self.elements_sent, "push endpoint peer closed");
            self.close();
            return Ok(false);
        }
        self.credits_received += 1;

        self.frames.element(&payload);
        if let Err(e) = self.frames.flush_to(&mut stream) {
            self.close();
            return Err(e.into());
        }
        self.elements_sent += 1;
        trace!(len = payload.len(), "pushed element");
        Ok(true)
    }
}

impl<T, C> PushEndpoint<T, C> {
    /// Close the connection, if any
    ///
    /// Writes the End frame so the peer sees a clean end of sequence. Never fails: errors while
    /// closing are ignored.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.conn.take() {
            let mut frames = FrameWriter::new();
            frames.end();
            let _ = frames.flush_to(&mut stream);
            let _ = stream.shutdown(Shutdown::Both);
            debug!(
                credits = self.credits_received,
                sent = self.elements_sent,
                "push endpoint closed",
            );
        }
    }

    /// Whether there is an open connection
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Credits received on the current connection
    pub fn credits_received(&self) -> u64 {
        self.credits_received
    }

    /// Elements sent on the current connection
    pub fn elements_sent(&self) -> u64 {
        self.elements_sent
    }
}

impl<T, C> Drop for PushEndpoint<T, C> {
    fn drop(&mut self) {
        self.close();
    }
}
