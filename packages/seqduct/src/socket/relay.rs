// relay: receive sequences, transform them lazily, and forward them on.

use super::{
    codec::{Bincode, Codec},
    recv::receive_with,
    send::{send_with, SendReport},
};
use crate::{config::TransportConfig, source};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};


/// Relay sequences with the default codecs and configuration. See [`relay_with`].
pub fn relay<T, U, F>(
    listener: TcpListener,
    destination_port: u16,
    transform: F,
) -> io::Result<RelayHandle>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    U: Serialize + DeserializeOwned + 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    relay_with(listener, destination_port, transform, Bincode, Bincode, TransportConfig::default())
}

/// Relay every sequence sent to `listener`
///
/// For each accepted connection, a worker thread receives the incoming sequence, maps it through
/// `transform` one element at a time, connects back to the sending host at `destination_port`,
/// and sends the mapped sequence there. Elements are only pulled from upstream as the destination
/// asks for them. A failing connection is logged and does not affect the others.
///
/// Runs until [`RelayHandle::shutdown`] is called or the handle is dropped.
pub fn relay_with<T, U, F, CI, CO>(
    listener: TcpListener,
    destination_port: u16,
    transform: F,
    codec_in: CI,
    codec_out: CO,
    config: TransportConfig,
) -> io::Result<RelayHandle>
where
    T: Send + 'static,
    U: 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
    CI: Codec<T> + 'static,
    CO: Codec<U> + 'static,
{
    let local_addr = listener.local_addr()?;
    let shared = Arc::new(RelayShared {
        stop: AtomicBool::new(false),
        conns: DashMap::new(),
    });
    let pipeline = Arc::new(Pipeline {
        destination_port,
        transform,
        codec_in,
        codec_out,
        config,
        _p: std::marker::PhantomData,
    });

    let accept = {
        let shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("seqduct-relay".into())
            .spawn(move || accept_loop(listener, shared, pipeline))?
    };
    debug!(%local_addr, destination_port, "relay started");
    Ok(RelayHandle {
        local_addr,
        shared,
        accept: Some(accept),
    })
}

/// Handle to a running relay
///
/// Dropping the handle shuts the relay down and waits for its accept loop to exit.
pub struct RelayHandle {
    local_addr: SocketAddr,
    shared: Arc<RelayShared>,
    accept: Option<JoinHandle<()>>,
}

impl RelayHandle {
    /// Address the relay accepts connections on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of relayed connections currently in flight
    pub fn live_connections(&self) -> usize {
        self.shared.conns.iter().filter(|entry| entry.key().1 == Leg::Inbound).count()
    }

    /// Stop accepting, and force every live connection closed
    ///
    /// Does not wait. Use [`join`](Self::join) to wait for the relay's threads to exit.
    pub fn shutdown(&self) {
        if self.shared.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(local_addr = %self.local_addr, "relay shutting down");
        // the accept loop only notices the flag once it accepts something
        let _ = TcpStream::connect(wake_addr(self.local_addr));
        for entry in self.shared.conns.iter() {
            let _ = entry.value().shutdown(Shutdown::Both);
        }
    }

    /// Wait for the relay's accept loop and connection workers to exit
    ///
    /// Only returns after [`shutdown`](Self::shutdown) has been called.
    pub fn join(mut self) {
        self.join_accept();
    }

    fn join_accept(&mut self) {
        if let Some(accept) = self.accept.take() {
            if accept.join().is_err() {
                warn!("relay accept loop panicked");
            }
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown();
        self.join_accept();
    }
}


// ==== internals ====


struct RelayShared {
    stop: AtomicBool,
    // sockets of live connections, so shutdown can force them closed.
    conns: DashMap<(u64, Leg), TcpStream>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
enum Leg {
    Inbound,
    Outbound,
}

impl RelayShared {
    // remember a socket for forced shutdown. false if the relay is already stopping.
    fn register(&self, id: u64, leg: Leg, stream: &TcpStream) -> io::Result<bool> {
        self.conns.insert((id, leg), stream.try_clone()?);
        // checked after inserting, so a concurrent shutdown either sees the entry or we see the flag
        Ok(!self.stop.load(Ordering::Acquire))
    }

    fn deregister(&self, id: u64) {
        self.conns.remove(&(id, Leg::Inbound));
        self.conns.remove(&(id, Leg::Outbound));
    }
}

// everything a connection worker needs, shared between them.
struct Pipeline<T, U, F, CI, CO> {
    destination_port: u16,
    transform: F,
    codec_in: CI,
    codec_out: CO,
    config: TransportConfig,
    _p: std::marker::PhantomData<fn(T) -> U>,
}

// an address which reaches a listener bound to `addr`.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}

fn accept_loop<T, U, F, CI, CO>(
    listener: TcpListener,
    shared: Arc<RelayShared>,
    pipeline: Arc<Pipeline<T, U, F, CI, CO>>,
)
where
    T: Send + 'static,
    U: 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
    CI: Codec<T> + 'static,
    CO: Codec<U> + 'static,
{
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    for (id, conn) in (0u64..).zip(listener.incoming()) {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        let inbound = match conn {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "relay failed to accept connection");
                continue;
            }
        };

        workers.retain(|worker| !worker.is_finished());
        let shared = Arc::clone(&shared);
        let pipeline = Arc::clone(&pipeline);
        let spawned = thread::Builder::new()
            .name(format!("seqduct-relay-{}", id))
            .spawn(move || {
                match relay_connection(inbound, id, &shared, &pipeline) {
                    Ok(Some(report)) => debug!(
                        connection = id,
                        sent = report.elements_sent,
                        outcome = ?report.outcome,
                        "relayed sequence",
                    ),
                    Ok(None) => debug!(connection = id, "relay stopped before connection started"),
                    Err(e) => warn!(connection = id, error = %e, "relayed connection failed"),
                }
                shared.deregister(id);
            });
        match spawned {
            Ok(worker) => workers.push(worker),
            Err(e) => warn!(connection = id, error = %e, "failed to spawn relay worker"),
        }
    }

    for worker in workers {
        if worker.join().is_err() {
            warn!("relay worker panicked");
        }
    }
    debug!("relay accept loop exited");
}

// relay one connection. None if the relay stopped before it got going.
fn relay_connection<T, U, F, CI, CO>(
    inbound: TcpStream,
    id: u64,
    shared: &RelayShared,
    pipeline: &Pipeline<T, U, F, CI, CO>,
) -> anyhow::Result<Option<SendReport>>
where
    T: Send,
    F: Fn(T) -> U + Send + Sync,
    CI: Codec<T>,
    CO: Codec<U>,
{
    let peer = inbound.peer_addr()?;
    debug!(connection = id, %peer, "relay accepted connection");
    if !shared.register(id, Leg::Inbound, &inbound)? {
        return Ok(None);
    }

    let upstream = receive_with(inbound, &pipeline.codec_in, &pipeline.config)?;
    let transform = &pipeline.transform;
    let mapped = source::map(upstream, move |item| transform(item));

    let outbound = TcpStream::connect((peer.ip(), pipeline.destination_port))?;
    if !shared.register(id, Leg::Outbound, &outbound)? {
        return Ok(None);
    }
    let report = send_with(mapped, outbound, None, &pipeline.codec_out, &pipeline.config)?;
    Ok(Some(report))
}
