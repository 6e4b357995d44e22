//! Moving sequences between processes over TCP.
//!
//! A sequence is sent over a connection by [`send`] and received on the other end by
//! [`receive`]. Transfer is pull-driven: the receiver writes one credit byte for each element it
//! wants, and the sender only pulls an element out of its source once it holds a credit for it.
//! So a sender never gets ahead of its receiver, and a receiver which stops asking stops the
//! sender's source from being pulled at all.
//!
//! See [`frame`] for the wire format.

pub mod codec;
pub mod frame;
mod handoff;
mod push;
mod recv;
mod relay;
mod send;

pub use self::{
    codec::{Bincode, Codec},
    handoff::{offer_sequence, offer_sequence_with, open_sequence, open_sequence_with},
    push::PushEndpoint,
    recv::{receive, receive_with, ReceivedSequence},
    relay::{relay, relay_with, RelayHandle},
    send::{send, send_with, OnClose, SendOutcome, SendReport},
};


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::TransportConfig,
        error::{ProtocolError, RecvError, SendError},
        source::{from_iter, Closer, Source},
        CachedFanIn,
    };
    use std::{
        io::Write,
        net::{TcpListener, TcpStream},
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    fn loopback() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").unwrap()
    }

    // connected (client, server) pair.
    fn pair() -> (TcpStream, TcpStream) {
        let listener = loopback();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    // source which counts how often it was pulled.
    struct Counting {
        next: u64,
        end: u64,
        pulls: Arc<AtomicU64>,
    }

    impl Source<u64> for Counting {
        fn pull(&mut self) -> anyhow::Result<Option<u64>> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            if self.next == self.end {
                return Ok(None);
            }
            self.next += 1;
            Ok(Some(self.next - 1))
        }
    }

    #[test]
    fn round_trip() {
        let (client, server) = pair();
        let closed = Arc::new(AtomicBool::new(false));
        let sender = {
            let closed = Arc::clone(&closed);
            thread::spawn(move || {
                send(from_iter(vec![1i32, 2, 3]), client, Some(Box::new(move || {
                    closed.store(true, Ordering::SeqCst);
                })))
            })
        };

        let mut seq = receive::<i32>(server).unwrap();
        let mut got = Vec::new();
        while seq.has_next().unwrap() {
            got.push(seq.next_value());
        }
        assert_eq!(got, vec![1, 2, 3]);
        assert!(!seq.has_next().unwrap());
        assert!(!seq.is_open());

        let report = sender.join().unwrap().unwrap();
        assert_eq!(report, SendReport {
            credits_received: 4,
            elements_sent: 3,
            outcome: SendOutcome::Completed,
        });
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn empty_sequence() {
        let (client, server) = pair();
        let sender = thread::spawn(move || send(from_iter(Vec::<String>::new()), client, None));
        assert_eq!(receive::<String>(server).unwrap().count(), 0);
        let report = sender.join().unwrap().unwrap();
        assert_eq!(report.elements_sent, 0);
        assert_eq!(report.outcome, SendOutcome::Completed);
    }

    #[test]
    fn sender_never_runs_ahead_of_credit() {
        let (client, server) = pair();
        let pulls = Arc::new(AtomicU64::new(0));
        let source = Counting { next: 0, end: 1000, pulls: Arc::clone(&pulls) };
        let sender = thread::spawn(move || send(source, client, None));

        let mut seq = receive::<u64>(server).unwrap();
        for i in 0..10 {
            assert!(seq.has_next().unwrap());
            assert_eq!(seq.next_value(), i);
            // the sender can have pulled at most what was asked for
            assert!(pulls.load(Ordering::SeqCst) <= i + 1);
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pulls.load(Ordering::SeqCst), 10);
        drop(seq);

        let report = sender.join().unwrap().unwrap();
        assert!(report.elements_sent <= report.credits_received);
        assert_eq!(report.elements_sent, 10);
        assert_eq!(report.outcome, SendOutcome::PeerClosed);
        // peer going away stops pulling immediately
        assert_eq!(pulls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn sender_closes_its_source() {
        struct Closable(Closer);

        impl Source<u8> for Closable {
            fn pull(&mut self) -> anyhow::Result<Option<u8>> {
                Ok(Some(7))
            }

            fn closer(&self) -> Closer {
                self.0.clone()
            }
        }

        let (client, server) = pair();
        let closer = Closer::noop();
        let sender = {
            let source = Closable(closer.clone());
            thread::spawn(move || send(source, client, None))
        };
        let mut seq = receive::<u8>(server).unwrap();
        assert!(seq.has_next().unwrap());
        seq.close();
        sender.join().unwrap().unwrap();
        assert!(closer.is_closed());
    }

    #[test]
    fn source_failure_is_returned_after_cleanup() {
        struct Failing;

        impl Source<u8> for Failing {
            fn pull(&mut self) -> anyhow::Result<Option<u8>> {
                anyhow::bail!("disk on fire")
            }
        }

        let (client, server) = pair();
        let closed = Arc::new(AtomicBool::new(false));
        let sender = {
            let closed = Arc::clone(&closed);
            thread::spawn(move || send(Failing, client, Some(Box::new(move || {
                closed.store(true, Ordering::SeqCst);
            }))))
        };
        // the sender closes without an End frame, which reads as a clean end
        assert_eq!(receive::<u8>(server).unwrap().count(), 0);
        assert!(matches!(sender.join().unwrap(), Err(SendError::Source(_))));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn receiver_rejects_garbage() {
        let (mut client, server) = pair();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut seq = receive::<u8>(server).unwrap();
        assert!(matches!(
            seq.has_next(),
            Err(RecvError::Protocol(ProtocolError::InvalidTag(b'G'))),
        ));
        // fatal for the sequence
        assert!(!seq.has_next().unwrap());
        assert!(seq.next().is_none());
    }

    #[test]
    fn receiver_times_out_on_silent_peer() {
        let (_client, server) = pair();
        let config = TransportConfig::default().with_read_timeout(Duration::from_millis(100));
        let mut seq = receive_with::<u8, _>(server, Bincode, &config).unwrap();
        assert!(matches!(seq.has_next(), Err(RecvError::Timeout(_))));
        assert!(!seq.is_open());
    }

    #[test]
    fn receiver_reports_undecodable_element() {
        let (client, server) = pair();
        let sender = thread::spawn(move || send(from_iter(vec![u8::MAX]), client, None));
        let mut seq = receive::<String>(server).unwrap();
        assert!(matches!(seq.next(), Some(Err(RecvError::Decode(_)))));
        assert!(seq.next().is_none());
        drop(seq);
        let _ = sender.join().unwrap();
    }

    #[test]
    fn received_sequence_feeds_a_fan_in() {
        let (client_a, server_a) = pair();
        let (client_b, server_b) = pair();
        let a = thread::spawn(move || send(from_iter(0..50u32), client_a, None));
        let b = thread::spawn(move || send(from_iter(50..100u32), client_b, None));

        let fan_in = CachedFanIn::new();
        fan_in.add_source(receive::<u32>(server_a).unwrap());
        fan_in.add_source(receive::<u32>(server_b).unwrap());
        let mut got = fan_in.iter().collect::<Vec<_>>();
        got.sort();
        assert_eq!(got, (0..100).collect::<Vec<_>>());

        a.join().unwrap().unwrap();
        b.join().unwrap().unwrap();
    }

    #[test]
    fn relay_transforms_in_order() {
        let destination = loopback();
        let relay = relay(loopback(), destination.local_addr().unwrap().port(), |x: i64| x * 2)
            .unwrap();

        let client = TcpStream::connect(relay.local_addr()).unwrap();
        let sender = thread::spawn(move || send(from_iter(vec![1i64, 2, 3]), client, None));

        let (forwarded, _) = destination.accept().unwrap();
        let got = receive::<i64>(forwarded).unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(got, vec![2, 4, 6]);

        let report = sender.join().unwrap().unwrap();
        assert_eq!(report.elements_sent, 3);
        assert_eq!(report.outcome, SendOutcome::Completed);
        relay.shutdown();
        relay.join();
    }

    #[test]
    fn relay_isolates_failed_connections() {
        let destination = loopback();
        let relay = relay(loopback(), destination.local_addr().unwrap().port(), |x: u8| x + 1)
            .unwrap();

        // garbage on one connection
        let mut bad = TcpStream::connect(relay.local_addr()).unwrap();
        bad.write_all(&[0xAB; 16]).unwrap();

        // a good one still goes through
        let client = TcpStream::connect(relay.local_addr()).unwrap();
        let sender = thread::spawn(move || send(from_iter(vec![1u8, 2]), client, None));

        // the bad connection also dials the destination, and fails after its first credit
        let mut results = Vec::new();
        for _ in 0..2 {
            let (forwarded, _) = destination.accept().unwrap();
            results.push(receive::<u8>(forwarded).unwrap().collect::<Result<Vec<_>, _>>());
        }
        assert!(results.iter().any(|r| matches!(r, Ok(v) if v == &vec![2, 3])));
        sender.join().unwrap().unwrap();
        drop(relay);
    }

    #[test]
    fn relay_shutdown_closes_live_connections() {
        let destination = loopback();
        let relay = relay(loopback(), destination.local_addr().unwrap().port(), |x: u32| x)
            .unwrap();
        let client = TcpStream::connect(relay.local_addr()).unwrap();
        let sender = thread::spawn(move || send(from_iter(0u32..), client, None));

        let (forwarded, _) = destination.accept().unwrap();
        let mut seq = receive::<u32>(forwarded).unwrap();
        assert!(seq.has_next().unwrap());
        assert_eq!(relay.live_connections(), 1);

        relay.shutdown();
        relay.join();
        // whatever the upstream sender saw, it stopped
        let _ = sender.join().unwrap();
        while let Some(Ok(_)) = seq.next() {}
    }

    #[test]
    fn push_endpoint_round_trip() {
        let listener = loopback();
        let port = listener.local_addr().unwrap().port();
        let pusher = thread::spawn(move || {
            let mut push = PushEndpoint::<String>::new();
            assert!(!push.send(&"nowhere".to_owned()).unwrap());
            push.connect(("127.0.0.1", port)).unwrap();
            assert!(push.is_connected());
            for word in ["alpha", "beta", "gamma"] {
                assert!(push.send(&word.to_owned()).unwrap());
            }
            assert_eq!(push.elements_sent(), 3);
            push.close();
            assert!(!push.is_connected());
        });

        let (stream, _) = listener.accept().unwrap();
        let got = receive::<String>(stream).unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(got, vec!["alpha", "beta", "gamma"]);
        pusher.join().unwrap();
    }

    #[test]
    fn push_endpoint_sees_peer_close() {
        let listener = loopback();
        let port = listener.local_addr().unwrap().port();
        let receiver = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut seq = receive::<u16>(stream).unwrap();
            assert!(seq.has_next().unwrap());
            seq.next_value()
        });

        let mut push = PushEndpoint::<u16>::new();
        push.connect(("127.0.0.1", port)).unwrap();
        assert!(push.send(&11).unwrap());
        assert_eq!(receiver.join().unwrap(), 11);
        assert!(!push.send(&12).unwrap());
        assert!(!push.is_connected());
    }

    #[test]
    fn push_endpoint_rebinds_to_new_peer() {
        let receivers = (0..2)
            .map(|_| {
                let listener = loopback();
                let port = listener.local_addr().unwrap().port();
                let join = thread::spawn(move || {
                    let (stream, _) = listener.accept().unwrap();
                    receive::<u32>(stream).unwrap()
                        .collect::<Result<Vec<_>, _>>()
                        .unwrap()
                });
                (port, join)
            })
            .collect::<Vec<_>>();
        let (port_a, port_b) = (receivers[0].0, receivers[1].0);

        let mut push = PushEndpoint::<u32>::new();
        push.connect(("127.0.0.1", port_a)).unwrap();
        assert!(push.send(&1).unwrap());
        assert_eq!(push.elements_sent(), 1);

        push.connect(("127.0.0.1", port_b)).unwrap();
        assert!(push.is_connected());
        assert_eq!(push.credits_received(), 0);
        assert_eq!(push.elements_sent(), 0);
        assert!(push.send(&2).unwrap());
        assert!(push.send(&3).unwrap());
        assert_eq!(push.credits_received(), 2);
        assert_eq!(push.elements_sent(), 2);
        push.close();

        let got = receivers.into_iter()
            .map(|(_, join)| join.join().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(got, vec![vec![1], vec![2, 3]]);
    }

    #[test]
    fn hand_off_over_control_connection() {
        let (mut offerer, mut opener) = pair();
        let sending = offer_sequence(&mut offerer, from_iter(vec!['a', 'b', 'c'])).unwrap();
        let got = open_sequence::<char>(&mut opener).unwrap()
            .collect::<Result<String, _>>()
            .unwrap();
        assert_eq!(got, "abc");
        assert_eq!(sending.join().unwrap().unwrap().elements_sent, 3);
    }
}
