// sending half of the socket adapter.

use super::{
    codec::{Bincode, Codec},
    frame::{read_credit, FrameWriter},
};
use crate::{
    config::TransportConfig,
    error::{SendError, SourceError},
    source::Source,
};
use serde::{de::DeserializeOwned, Serialize};
use std::net::{Shutdown, TcpStream};


/// Callback run once a send has finished and its connection is closed
pub type OnClose = Box<dyn FnOnce() + Send>;

/// How a completed send ended
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    /// The source was exhausted and the End frame was written
    Completed,
    /// The peer went away before the source was exhausted, so pulling stopped
    PeerClosed,
}

/// Accounting of a completed send
///
/// `elements_sent <= credits_received` always holds: an element is only pulled after a credit
/// for it has arrived.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SendReport {
    pub credits_received: u64,
    pub elements_sent: u64,
    pub outcome: SendOutcome,
}

/// Send a sequence over `stream` with the default codec and configuration
///
/// Blocks until the sequence is exhausted, the peer goes away, or something fails. See
/// [`send_with`].
pub fn send<T, S>(
    source: S,
    stream: TcpStream,
    on_close: Option<OnClose>,
) -> Result<SendReport, SendError>
where
    T: Serialize + DeserializeOwned,
    S: Source<T>,
{
    send_with(source, stream, on_close, &Bincode, &TransportConfig::default())
}

/// Send a sequence over `stream`, pulling each element only once the peer has asked for it
///
/// Writes the Version frame, then for every credit byte read pulls one element and writes it as
/// an Element frame, or writes the End frame once the source is exhausted. If the peer closes
/// the connection, pulling stops immediately.
///
/// However it ends, the source is closed, the connection is shut down and `on_close` is called
/// before this returns. Failures are returned after that cleanup.
pub fn send_with<T, S, C>(
    mut source: S,
    stream: TcpStream,
    on_close: Option<OnClose>,
    codec: &C,
    config: &TransportConfig,
) -> Result<SendReport, SendError>
where
    S: Source<T>,
    C: Codec<T> + ?Sized,
{
    let mut report = SendReport {
        credits_received: 0,
        elements_sent: 0,
        outcome: SendOutcome::PeerClosed,
    };
    let result = config.apply(&stream)
        .map_err(SendError::from)
        .and_then(|()| send_inner(&mut source, &stream, codec, &mut report));

    // cleanup runs no matter how sending ended
    source.closer().close();
    let _ = stream.shutdown(Shutdown::Both);
    if let Some(on_close) = on_close {
        on_close();
    }

    match result {
        Ok(()) => {
            debug!(
                credits = report.credits_received,
                sent = report.elements_sent,
                outcome = ?report.outcome,
                "sequence send finished",
            );
            Ok(report)
        }
        Err(e) => {
            debug!(
                credits = report.credits_received,
                sent = report.elements_sent,
                error = %e,
                "sequence send failed",
            );
            Err(e)
        }
    }
}

fn send_inner<T, S, C>(
    source: &mut S,
    mut stream: &TcpStream,
    codec: &C,
    report: &mut SendReport,
) -> Result<(), SendError>
where
    S: Source<T>,
    C: Codec<T> + ?Sized,
{
    let mut frames = FrameWriter::new();
    frames.version();
    frames.flush_to(&mut stream)?;

    loop {
        if !read_credit(&mut stream)? {
            report.outcome = SendOutcome::PeerClosed;
            return Ok(());
        }
        report.credits_received += 1;
        trace!(credits = report.credits_received, "received credit");

        match source.pull() {
            Ok(Some(item)) => {
                let payload = codec.encode(&item).map_err(SendError::Encode)?;
                frames.element(&payload);
                frames.flush_to(&mut stream)?;
                report.elements_sent += 1;
                trace!(len = payload.len(), "sent element");
            }
            Ok(None) => {
                frames.end();
                frames.flush_to(&mut stream)?;
                report.outcome = SendOutcome::Completed;
                return Ok(());
            }
            Err(e) => return Err(SourceError::from(e).into()),
        }
    }
}
