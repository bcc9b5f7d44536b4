//! Integration tests against real loopback TCP/UDP endpoints

use setu_net::listener::ReceiveEvent;
use setu_net::{
    Connection, EndOfPacket, Error, MediaState, MediaListener, Protocol, ReceiveParams,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Records listener callbacks for assertions
#[derive(Default)]
struct Recorder {
    states: parking_lot::Mutex<Vec<MediaState>>,
    errors: parking_lot::Mutex<Vec<String>>,
    received: parking_lot::Mutex<Vec<ReceiveEvent>>,
}

impl MediaListener for Recorder {
    fn on_media_state_change(&self, state: MediaState) {
        self.states.lock().push(state);
    }
    fn on_error(&self, error: &Error) {
        self.errors.lock().push(error.to_string());
    }
    fn on_received(&self, event: &ReceiveEvent) {
        self.received.lock().push(event.clone());
    }
}

impl Recorder {
    fn wait_for_received(&self, count: usize) -> Vec<ReceiveEvent> {
        let deadline = Instant::now() + WAIT;
        loop {
            {
                let received = self.received.lock();
                if received.len() >= count {
                    return received.clone();
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for data");
            thread::sleep(Duration::from_millis(10));
        }
    }
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

/// Bind a loopback listener and run `serve` on the first accepted stream
fn tcp_server(
    serve: impl FnOnce(TcpStream) + Send + 'static,
) -> (u16, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        serve(stream);
    });
    (port, handle)
}

/// Park the server end until the client closes its write side
fn drain(mut stream: TcpStream) {
    let mut sink = [0u8; 256];
    while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
}

#[test]
fn tcp_echo_without_marker_completes_on_first_chunk() {
    init_logging();
    let (port, server) = tcp_server(|mut stream| {
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        stream.write_all(&buf[..n]).unwrap();
        drain(stream);
    });

    let mut conn = Connection::with_endpoint(Protocol::Tcp, "127.0.0.1", port);
    conn.open().unwrap();

    let _sync = conn.synchronous();
    conn.send("abc").unwrap();
    let reply = conn.receive(&ReceiveParams::wait(WAIT)).unwrap();
    assert_eq!(reply.as_deref(), Some(b"abc".as_slice()));

    conn.close();
    server.join().unwrap();
}

#[test]
fn tcp_crlf_frame_split_across_chunks() {
    init_logging();
    let (port, server) = tcp_server(|mut stream| {
        stream.write_all(b"OK").unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(50));
        stream.write_all(b"\r\nrest").unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(50));
        stream.write_all(b"\r\n").unwrap();
        drain(stream);
    });

    let mut conn = Connection::with_endpoint(Protocol::Tcp, "127.0.0.1", port);
    conn.set_eop(EndOfPacket::single(b"\r\n".to_vec()));
    conn.open().unwrap();

    let _sync = conn.synchronous();
    let first = conn.receive(&ReceiveParams::wait(WAIT)).unwrap();
    assert_eq!(first.as_deref(), Some(b"OK\r\n".as_slice()));

    // "rest" stays buffered and completes once its marker arrives.
    let second = conn.receive(&ReceiveParams::wait(WAIT)).unwrap();
    assert_eq!(second.as_deref(), Some(b"rest\r\n".as_slice()));

    conn.close();
    server.join().unwrap();
}

#[test]
fn close_interrupts_blocked_receive_loop_without_error() {
    init_logging();
    let (port, server) = tcp_server(drain);

    let recorder = Arc::new(Recorder::default());
    let mut conn = Connection::with_endpoint(Protocol::Tcp, "127.0.0.1", port);
    conn.add_listener(recorder.clone());
    conn.open().unwrap();

    // Let the receive loop park in a blocking read, then close under it.
    thread::sleep(Duration::from_millis(50));
    conn.close();
    assert!(!conn.is_open());
    assert_eq!(conn.state(), MediaState::Closed);

    // The loop observed the socket closing: no error notification, and
    // none may arrive after close() has returned.
    assert!(recorder.errors.lock().is_empty());
    assert_eq!(
        recorder.states.lock().clone(),
        vec![
            MediaState::Opening,
            MediaState::Open,
            MediaState::Closing,
            MediaState::Closed,
        ]
    );
    server.join().unwrap();
}

#[test]
fn remote_close_transitions_to_closed_without_error() {
    init_logging();
    let (port, server) = tcp_server(|stream| drop(stream));

    let recorder = Arc::new(Recorder::default());
    let mut conn = Connection::with_endpoint(Protocol::Tcp, "127.0.0.1", port);
    conn.add_listener(recorder.clone());
    conn.open().unwrap();

    wait_until("remote close", || !conn.is_open());
    assert_eq!(conn.state(), MediaState::Closed);
    assert!(recorder.errors.lock().is_empty());

    // A later caller-side close is a clean no-op.
    conn.close();
    assert!(matches!(conn.send("x"), Err(Error::NotOpen)));
    server.join().unwrap();
}

#[test]
fn async_mode_forwards_chunks_to_listeners() {
    init_logging();
    let (port, server) = tcp_server(|mut stream| {
        stream.write_all(b"hello").unwrap();
        drain(stream);
    });

    let recorder = Arc::new(Recorder::default());
    let mut conn = Connection::with_endpoint(Protocol::Tcp, "127.0.0.1", port);
    conn.add_listener(recorder.clone());
    conn.open().unwrap();

    let events = recorder.wait_for_received(1);
    assert_eq!(events[0].data, b"hello");
    assert!(events[0].origin.starts_with("127.0.0.1:"));

    conn.close();
    server.join().unwrap();
}

#[test]
fn byte_counters_track_traffic_and_reset() {
    init_logging();
    let (port, server) = tcp_server(|mut stream| {
        stream.write_all(b"12345").unwrap();
        drain(stream);
    });

    let recorder = Arc::new(Recorder::default());
    let mut conn = Connection::with_endpoint(Protocol::Tcp, "127.0.0.1", port);
    conn.add_listener(recorder.clone());
    conn.open().unwrap();

    conn.send(b"abc").unwrap();
    recorder.wait_for_received(1);
    assert_eq!(conn.bytes_sent(), 3);
    assert_eq!(conn.bytes_received(), 5);

    conn.reset_byte_counters();
    assert_eq!(conn.bytes_sent(), 0);
    assert_eq!(conn.bytes_received(), 0);

    conn.close();
    server.join().unwrap();
}

#[test]
fn reopen_passes_through_closed() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        for _ in 0..2 {
            let (stream, _) = listener.accept().unwrap();
            drain(stream);
        }
    });

    let recorder = Arc::new(Recorder::default());
    let mut conn = Connection::with_endpoint(Protocol::Tcp, "127.0.0.1", port);
    conn.add_listener(recorder.clone());

    conn.open().unwrap();
    assert!(conn.is_open());
    // Opening again closes the first socket before connecting anew.
    conn.open().unwrap();
    assert!(conn.is_open());
    conn.close();

    let states = recorder.states.lock().clone();
    assert_eq!(
        states,
        vec![
            MediaState::Opening,
            MediaState::Open,
            MediaState::Closing,
            MediaState::Closed,
            MediaState::Opening,
            MediaState::Open,
            MediaState::Closing,
            MediaState::Closed,
        ]
    );
    server.join().unwrap();
}

#[test]
fn tcp_connect_failure_raises_and_falls_back_to_closed() {
    init_logging();
    // Bind then drop to get a port nothing listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let recorder = Arc::new(Recorder::default());
    let mut conn = Connection::with_endpoint(Protocol::Tcp, "127.0.0.1", port);
    conn.set_connect_timeout(Duration::from_secs(2));
    conn.add_listener(recorder.clone());

    assert!(matches!(conn.open(), Err(Error::Connect(_))));
    assert!(!conn.is_open());
    assert_eq!(
        recorder.states.lock().clone(),
        vec![MediaState::Opening, MediaState::Closing, MediaState::Closed]
    );
}

#[test]
fn udp_round_trip_with_origin_tag() {
    init_logging();
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer_port = peer.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        peer.send_to(b"pong", from).unwrap();
    });

    let recorder = Arc::new(Recorder::default());
    let mut conn = Connection::with_endpoint(Protocol::Udp, "127.0.0.1", peer_port);
    conn.add_listener(recorder.clone());
    conn.open().unwrap();
    assert!(conn.is_open());

    conn.send("ping").unwrap();
    let events = recorder.wait_for_received(1);
    assert_eq!(events[0].data, b"pong");
    assert_eq!(events[0].origin, format!("127.0.0.1:{}", peer_port));
    assert_eq!(conn.bytes_sent(), 4);
    assert_eq!(conn.bytes_received(), 4);

    conn.close();
    assert_eq!(conn.state(), MediaState::Closed);
    server.join().unwrap();
}

#[test]
fn udp_synchronous_receive_matches_reply_frame() {
    init_logging();
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer_port = peer.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (_, from) = peer.recv_from(&mut buf).unwrap();
        peer.send_to(b"value=42\r\n", from).unwrap();
    });

    let mut conn = Connection::with_endpoint(Protocol::Udp, "127.0.0.1", peer_port);
    conn.set_eop(EndOfPacket::single(b"\r\n".to_vec()));
    conn.open().unwrap();

    let _sync = conn.synchronous();
    conn.send("read\r\n").unwrap();
    let reply = conn.receive(&ReceiveParams::wait(WAIT)).unwrap();
    assert_eq!(reply.as_deref(), Some(b"value=42\r\n".as_slice()));

    conn.close();
    server.join().unwrap();
}

#[test]
fn synchronous_receive_times_out_cleanly() {
    init_logging();
    let (port, server) = tcp_server(drain);

    let mut conn = Connection::with_endpoint(Protocol::Tcp, "127.0.0.1", port);
    conn.open().unwrap();

    let _sync = conn.synchronous();
    let started = Instant::now();
    let reply = conn
        .receive(&ReceiveParams::wait(Duration::from_millis(100)))
        .unwrap();
    assert_eq!(reply, None);
    assert!(started.elapsed() >= Duration::from_millis(100));

    conn.close();
    server.join().unwrap();
}
