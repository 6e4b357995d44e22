// handing a sequence to a peer over an existing control connection.
//
// the offering side binds a fresh listener and tells the peer its port, as a u16 big-endian,
// over the control connection. the peer connects back and receives the sequence there.

use super::{
    codec::{Bincode, Codec},
    recv::{receive_with, ReceivedSequence},
    send::{send_with, SendReport},
};
use crate::{
    config::TransportConfig,
    error::{RecvError, SendError},
    source::Source,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    thread::{self, JoinHandle},
};


/// Offer a sequence to the peer of `control` with the default codec and configuration. See
/// [`offer_sequence_with`].
pub fn offer_sequence<T, S>(
    control: &mut TcpStream,
    source: S,
) -> io::Result<JoinHandle<Result<SendReport, SendError>>>
where
    T: Serialize + DeserializeOwned + 'static,
    S: Source<T> + 'static,
{
    offer_sequence_with(control, source, Bincode, TransportConfig::default())
}

/// Offer a sequence to the peer of `control`
///
/// Binds a listener on the control connection's local address, writes its port on `control`,
/// then on a new thread accepts one connection and sends the sequence over it. The peer is
/// expected to call [`open_sequence`].
pub fn offer_sequence_with<T, S, C>(
    control: &mut TcpStream,
    source: S,
    codec: C,
    config: TransportConfig,
) -> io::Result<JoinHandle<Result<SendReport, SendError>>>
where
    T: 'static,
    S: Source<T> + 'static,
    C: Codec<T> + 'static,
{
    let listener = TcpListener::bind((control.local_addr()?.ip(), 0))?;
    let port = listener.local_addr()?.port();
    control.write_all(&port.to_be_bytes())?;
    control.flush()?;
    debug!(port, "offered sequence");

    thread::Builder::new()
        .name("seqduct-offer".into())
        .spawn(move || {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    source.closer().close();
                    return Err(e.into());
                }
            };
            debug!(%peer, "offered sequence accepted");
            send_with(source, stream, None, &codec, &config)
        })
}

/// Open a sequence offered by the peer of `control` with the default codec and configuration
pub fn open_sequence<T>(control: &mut TcpStream) -> Result<ReceivedSequence<T>, RecvError>
where
    T: Serialize + DeserializeOwned,
{
    open_sequence_with(control, Bincode, &TransportConfig::default())
}

/// Open a sequence offered by the peer of `control` with [`offer_sequence_with`]
///
/// Blocks until the port arrives on `control`.
pub fn open_sequence_with<T, C: Codec<T>>(
    control: &mut TcpStream,
    codec: C,
    config: &TransportConfig,
) -> Result<ReceivedSequence<T, C>, RecvError> {
    let mut port = [0; 2];
    control.read_exact(&mut port)?;
    let port = u16::from_be_bytes(port);
    let stream = TcpStream::connect((control.peer_addr()?.ip(), port))?;
    debug!(port, "opened offered sequence");
    receive_with(stream, codec, config)
}
