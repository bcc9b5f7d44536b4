//! Background receive loop
//!
//! One receive thread per open connection, created fresh on every open and
//! never reused. It performs blocking reads in chunks of at most one
//! Ethernet frame and dispatches each chunk either into the synchronous
//! frame buffer (synchronous mode) or straight to the registered listeners
//! (asynchronous mode).
//!
//! Termination rules:
//!
//! - Stop flag set: exit silently.
//! - TCP end-of-stream or reset while not stopped: treat as connection
//!   loss, run the close transition on the shared state, exit.
//! - Any other read error while running: report via the error
//!   notification channel and keep reading.
//!
//! A blocked UDP receive cannot be interrupted portably, so the UDP
//! socket carries a short read timeout and the loop re-checks the stop
//! flag on every tick.

use crate::connection::Shared;
use crate::error::Error;
use crate::listener::{ReceiveEvent, TraceEvent};
use crate::types::{hex_string, TraceLevel, TraceType};
use std::io::{ErrorKind, Read};
use std::net::{TcpStream, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Size of the receive buffer. Ethernet maximum frame size is 1518 bytes.
pub(crate) const RECEIVE_BUFFER_SIZE: usize = 1518;

/// Socket end owned by the receive loop (a clone of the connection's)
pub(crate) enum ReceiveSocket {
    Tcp {
        stream: TcpStream,
        /// Remote socket address, captured at spawn
        origin: String,
    },
    Udp(UdpSocket),
}

/// Spawn the receive thread for one freshly opened socket
pub(crate) fn spawn(
    shared: Arc<Shared>,
    socket: ReceiveSocket,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("setu-net-receive".to_string())
        .spawn(move || {
            log::debug!("Receive loop started");
            match socket {
                ReceiveSocket::Tcp { stream, origin } => run_tcp(&shared, stream, &origin),
                ReceiveSocket::Udp(socket) => run_udp(&shared, socket),
            }
            log::debug!("Receive loop stopped");
        })
}

fn run_tcp(shared: &Shared, mut stream: TcpStream, origin: &str) {
    let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }
        match stream.read(&mut buffer) {
            Ok(0) => {
                // Peer closed the stream. If the stop flag raced us the
                // close came from our own side; exit without noise.
                if !shared.stop.load(Ordering::Relaxed) {
                    log::info!("Peer closed the connection");
                    shared.close_from_receiver();
                }
                break;
            }
            Ok(count) => handle_chunk(shared, &buffer[..count], origin),
            Err(e) => {
                if shared.stop.load(Ordering::Relaxed) {
                    break;
                }
                if is_disconnect(e.kind()) || !shared.is_open() {
                    log::info!("Connection lost: {}", e);
                    shared.close_from_receiver();
                    break;
                }
                // Transient failure; report it and keep reading.
                shared.notify_error(Error::Transport(e));
            }
        }
    }
}

fn run_udp(shared: &Shared, socket: UdpSocket) {
    let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }
        match socket.recv_from(&mut buffer) {
            Ok((0, _)) => {}
            Ok((count, addr)) => {
                let origin = format!("{}:{}", addr.ip(), addr.port());
                handle_chunk(shared, &buffer[..count], &origin);
            }
            // Read timeout tick; lets the loop observe the stop flag.
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                if shared.stop.load(Ordering::Relaxed) {
                    break;
                }
                shared.notify_error(Error::Transport(e));
            }
        }
    }
}

pub(crate) fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    )
}

/// Dispatch one received chunk to the synchronous buffer or the listeners
fn handle_chunk(shared: &Shared, chunk: &[u8], origin: &str) {
    if chunk.is_empty() {
        return;
    }
    shared
        .bytes_received
        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
    let verbose = shared.trace() == TraceLevel::Verbose;
    if verbose {
        shared.listeners.notify_trace(TraceEvent {
            trace_type: TraceType::Received,
            payload: hex_string(chunk),
        });
    }
    if shared.is_synchronous() {
        let eop = shared.eop.lock().clone();
        shared.sync.append(chunk, &eop);
    } else {
        // Stale synchronous leftovers are meaningless once the caller has
        // gone back to asynchronous delivery.
        shared.sync.reset_received_size();
        shared.listeners.notify_received(ReceiveEvent {
            data: chunk.to_vec(),
            origin: origin.to_string(),
        });
    }
}
