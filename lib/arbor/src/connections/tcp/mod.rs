pub mod channel;
pub mod client;
pub(crate) mod reactor;
pub mod server;
pub(crate) mod shake;

pub use self::channel::{TcpConnection, HEARTBEATS_DISABLED};
pub use self::client::TcpClient;
pub use self::server::TcpServer;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::test_support::Recorder;
    use crate::connections::{CommunicatorRef, Connection};
    use crate::core::pattern::Pattern;
    use crate::errors::ErrorCode;
    use crate::identity::Id;
    use crate::msg::{Body, Message};
    use crate::scheduling::{MultiThreadedScheduler, Scheduler};
    use crate::{MAX_IDENTIFICATION_SIZE, VERSION, VERSION_INFO_SIZE};

    use byteorder::{BigEndian, ByteOrder};

    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            if Instant::now() > deadline {
                panic!("Timed out waiting for {}", what);
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Two connected, shaken-hands endpoints over loopback.
    fn pair() -> (TcpConnection, TcpConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            TcpConnection::shake_hands(stream, b"server-side", Duration::from_secs(5)).unwrap()
        });

        let stream = TcpStream::connect(addr).unwrap();
        let client = TcpConnection::shake_hands(stream, b"client-side", Duration::from_secs(5)).unwrap();

        (client, server.join().unwrap())
    }

    fn data_msg(number: u32, payload: Vec<u8>) -> Message {
        Message::new(
            Pattern::PublishSubscribe,
            Body::Data {
                id: Id::new(number),
                payload,
            },
        )
    }

    #[test]
    fn test_handshake_exchanges_metadata() {
        let (client, server) = pair();

        assert_eq!(VERSION, client.remote_version());
        assert_eq!(VERSION, server.remote_version());
        assert_eq!(b"server-side".to_vec(), client.remote_identification());
        assert_eq!(b"client-side".to_vec(), server.remote_identification());
    }

    #[test]
    fn test_invalid_magic_prefix() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"XOGI \0").unwrap();
            stream
        });

        let stream = TcpStream::connect(addr).unwrap();
        let result = TcpConnection::shake_hands(stream, &[], Duration::from_secs(5));
        assert_eq!(ErrorCode::InvalidMagicPrefix, result.err().unwrap());

        peer.join().unwrap();
    }

    #[test]
    fn test_incompatible_version() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = Vec::new();
            header.extend_from_slice(&crate::MAGIC_PREFIX);
            let mut version = [0u8; VERSION_INFO_SIZE];
            version[..6].copy_from_slice(b"99.0.0");
            header.extend_from_slice(&version);
            header.extend_from_slice(&[0, 0, 0, 0]);
            stream.write_all(&header).unwrap();
            stream
        });

        let stream = TcpStream::connect(addr).unwrap();
        let result = TcpConnection::shake_hands(stream, &[], Duration::from_secs(5));
        assert_eq!(ErrorCode::IncompatibleVersion, result.err().unwrap());

        peer.join().unwrap();
    }

    #[test]
    fn test_identification_too_large() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = Vec::new();
            header.extend_from_slice(&crate::MAGIC_PREFIX);
            let mut version = [0u8; VERSION_INFO_SIZE];
            version[..VERSION.len()].copy_from_slice(VERSION.as_bytes());
            header.extend_from_slice(&version);
            let mut len = [0u8; 4];
            BigEndian::write_u32(&mut len, (MAX_IDENTIFICATION_SIZE + 1) as u32);
            header.extend_from_slice(&len);
            stream.write_all(&header).unwrap();
            stream
        });

        let stream = TcpStream::connect(addr).unwrap();
        let result = TcpConnection::shake_hands(stream, &[], Duration::from_secs(5));
        assert_eq!(ErrorCode::IdentificationTooLarge, result.err().unwrap());

        peer.join().unwrap();
    }

    #[test]
    fn test_handshake_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // The peer accepts but stays silent.
        let peer = thread::spawn(move || listener.accept().unwrap());

        let stream = TcpStream::connect(addr).unwrap();
        let result = TcpConnection::shake_hands(stream, &[], Duration::from_millis(5));
        assert_eq!(ErrorCode::Timeout, result.err().unwrap());

        peer.join().unwrap();
    }

    #[test]
    fn test_assign_validation() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(MultiThreadedScheduler::new(2).unwrap());
        let leaf = Recorder::new(&scheduler, false);
        let comm: CommunicatorRef = leaf.clone();

        let (client, _server) = pair();

        assert_eq!(
            ErrorCode::InvalidParam,
            client.assign(&comm, Duration::from_millis(1)).err().unwrap()
        );

        client.assign(&comm, Duration::from_secs(1)).unwrap();
        assert_eq!(
            ErrorCode::AlreadyAssigned,
            client.assign(&comm, Duration::from_secs(1)).err().unwrap()
        );
    }

    #[test]
    fn test_framed_roundtrip() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(MultiThreadedScheduler::new(2).unwrap());
        let leaf = Recorder::new(&scheduler, false);
        let node = Recorder::new(&scheduler, true);

        let (client, server) = pair();
        let leaf_comm: CommunicatorRef = leaf.clone();
        let node_comm: CommunicatorRef = node.clone();

        client.assign(&leaf_comm, Duration::from_secs(2)).unwrap();
        server.assign(&node_comm, Duration::from_secs(2)).unwrap();

        wait_for("both links ready", || {
            client.remote_is_node().is_ok() && server.remote_is_node().is_ok()
        });
        assert_eq!(true, client.remote_is_node().unwrap());
        assert_eq!(false, server.remote_is_node().unwrap());
        assert_eq!(1, leaf.started.load(Ordering::SeqCst));
        assert_eq!(1, node.started.load(Ordering::SeqCst));

        // Mixed sizes, including one frame larger than the ring capacity to
        // exercise back-pressure and mid-frame suspension.
        let mut sent = Vec::new();
        for i in 0..50u32 {
            let payload = vec![i as u8; (i as usize * 37) % 1500];
            sent.push(data_msg(i, payload));
        }
        sent.push(data_msg(999, (0..200_000u32).map(|i| i as u8).collect()));

        let sender = client.connection_ref();
        {
            let sent = sent.clone();
            thread::spawn(move || {
                for msg in &sent {
                    sender.send(msg);
                }
            });
        }

        wait_for("all frames delivered", || {
            node.received.lock().unwrap().len() == sent.len()
        });
        assert_eq!(sent, *node.received.lock().unwrap());
    }

    #[test]
    fn test_heartbeats_keep_silent_link_alive() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(MultiThreadedScheduler::new(2).unwrap());
        let a = Recorder::new(&scheduler, false);
        let b = Recorder::new(&scheduler, false);

        let (client, server) = pair();
        let a_comm: CommunicatorRef = a.clone();
        let b_comm: CommunicatorRef = b.clone();

        let deaths = Arc::new(AtomicUsize::new(0));
        let d1 = deaths.clone();
        let d2 = deaths.clone();
        client.async_await_death(move |_| {
            d1.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
        server.async_await_death(move |_| {
            d2.fetch_add(1, Ordering::SeqCst);
        }).unwrap();

        client.assign(&a_comm, Duration::from_millis(100)).unwrap();
        server.assign(&b_comm, Duration::from_millis(100)).unwrap();

        // Several multiples of the timeout with no data traffic.
        thread::sleep(Duration::from_millis(500));
        assert_eq!(0, deaths.load(Ordering::SeqCst));
        assert!(client.alive() && server.alive());
    }

    #[test]
    fn test_timeout_fires_against_dead_peer() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(MultiThreadedScheduler::new(2).unwrap());
        let a = Recorder::new(&scheduler, false);
        let b = Recorder::new(&scheduler, false);

        let (client, server) = pair();
        let a_comm: CommunicatorRef = a.clone();
        let b_comm: CommunicatorRef = b.clone();

        let cause = Arc::new(Mutex::new(None));
        let cause_in = cause.clone();
        server.async_await_death(move |code| {
            *cause_in.lock().unwrap() = Some(code);
        }).unwrap();

        // The client never heartbeats; the server expects traffic.
        client.assign(&a_comm, HEARTBEATS_DISABLED).unwrap();
        server.assign(&b_comm, Duration::from_millis(100)).unwrap();

        wait_for("server-side timeout", || cause.lock().unwrap().is_some());
        assert_eq!(Some(ErrorCode::Timeout), *cause.lock().unwrap());
        assert!(!server.alive());
    }

    #[test]
    fn test_peer_drop_reports_connection_closed() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(MultiThreadedScheduler::new(2).unwrap());
        let a = Recorder::new(&scheduler, false);
        let b = Recorder::new(&scheduler, false);

        let (client, server) = pair();
        let a_comm: CommunicatorRef = a.clone();
        let b_comm: CommunicatorRef = b.clone();

        client.assign(&a_comm, Duration::from_secs(1)).unwrap();
        server.assign(&b_comm, Duration::from_secs(1)).unwrap();

        let cause = Arc::new(Mutex::new(None));
        let cause_in = cause.clone();
        server.async_await_death(move |code| {
            *cause_in.lock().unwrap() = Some(code);
        }).unwrap();

        drop(client);

        wait_for("death notification", || cause.lock().unwrap().is_some());
        assert_eq!(Some(ErrorCode::ConnectionClosed), *cause.lock().unwrap());
        assert_eq!(1, a.deaths.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_await_death() {
        let (client, _server) = pair();

        let cause = Arc::new(Mutex::new(None));
        let cause_in = cause.clone();
        client.async_await_death(move |code| {
            *cause_in.lock().unwrap() = Some(code);
        }).unwrap();

        client.cancel_await_death();
        assert_eq!(Some(ErrorCode::Canceled), *cause.lock().unwrap());

        // Idempotent: nothing armed, nothing fires.
        client.cancel_await_death();
    }

    #[test]
    fn test_server_client_connect() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(MultiThreadedScheduler::new(2).unwrap());

        // Find a free port by briefly binding an ephemeral listener.
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let server = TcpServer::new(
            scheduler.clone(),
            "127.0.0.1",
            port,
            b"relay",
            crate::logging::discard(),
        )
        .unwrap();

        let accepted = Arc::new(Mutex::new(None));
        let accepted_in = accepted.clone();
        server
            .async_accept(Duration::from_secs(5), move |result| {
                *accepted_in.lock().unwrap() = Some(result);
            })
            .unwrap();

        let client = TcpClient::new(scheduler.clone(), b"probe", crate::logging::discard()).unwrap();
        let connected = Arc::new(Mutex::new(None));
        let connected_in = connected.clone();
        client
            .async_connect("127.0.0.1", port, Duration::from_secs(5), move |result| {
                *connected_in.lock().unwrap() = Some(result);
            })
            .unwrap();

        wait_for("accept and connect to complete", || {
            accepted.lock().unwrap().is_some() && connected.lock().unwrap().is_some()
        });

        let accepted = accepted.lock().unwrap().take().unwrap().unwrap();
        let connected = connected.lock().unwrap().take().unwrap().unwrap();
        assert_eq!(b"probe".to_vec(), accepted.remote_identification());
        assert_eq!(b"relay".to_vec(), connected.remote_identification());
    }

    #[test]
    fn test_server_validation() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(MultiThreadedScheduler::new(1).unwrap());

        assert_eq!(
            ErrorCode::InvalidPortNumber,
            TcpServer::new(scheduler.clone(), "127.0.0.1", 0, &[], crate::logging::discard())
                .err()
                .unwrap()
        );
        assert_eq!(
            ErrorCode::InvalidIpAddress,
            TcpServer::new(scheduler.clone(), "not-an-ip", 9000, &[], crate::logging::discard())
                .err()
                .unwrap()
        );
        assert_eq!(
            ErrorCode::IdentificationTooLarge,
            TcpServer::new(
                scheduler,
                "127.0.0.1",
                9000,
                &vec![0u8; MAX_IDENTIFICATION_SIZE + 1],
                crate::logging::discard()
            )
            .err()
            .unwrap()
        );
    }

    #[test]
    fn test_connect_refused() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(MultiThreadedScheduler::new(1).unwrap());

        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let client = TcpClient::new(scheduler, &[], crate::logging::discard()).unwrap();
        let result = Arc::new(Mutex::new(None));
        let result_in = result.clone();
        client
            .async_connect("127.0.0.1", port, Duration::from_secs(5), move |outcome| {
                *result_in.lock().unwrap() = Some(outcome);
            })
            .unwrap();

        wait_for("refused connect to complete", || result.lock().unwrap().is_some());
        let outcome = result.lock().unwrap().take().unwrap();
        assert_eq!(ErrorCode::ConnectionRefused, outcome.err().unwrap());
    }
}
