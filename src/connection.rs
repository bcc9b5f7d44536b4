//! Connection lifecycle, send path and synchronous receive
//!
//! [`Connection`] owns the socket, the background receive loop and the
//! synchronous frame buffer. A caller configures it, opens it, sends
//! opaque bytes and either observes replies through registered listeners
//! (asynchronous mode) or blocks for one complete reply frame
//! (synchronous mode, see [`Connection::synchronous`]).
//!
//! State machine: `Closed -> Opening -> Open -> Closing -> Closed`.
//! Reopen always passes through `Closed`; a failed TCP connect falls from
//! `Opening` straight back to `Closed`.

use crate::error::{Error, Result};
use crate::listener::{ListenerHub, MediaListener, NotifyDispatcher, TraceEvent};
use crate::receiver::{self, ReceiveSocket};
use crate::settings::{self, NetSettings};
use crate::sync_buffer::SyncBuffer;
use crate::types::{
    hex_string, EndOfPacket, MediaState, Protocol, ReceiveParams, SendPayload, TraceLevel,
    TraceType,
};
use parking_lot::Mutex;
use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Default bound for a TCP connect. The caller is never parked
/// indefinitely on an unresponsive network stack.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound for a TCP write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a blocked UDP receive wakes up to check the stop flag
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Socket handle, swapped atomically on open and close so a concurrent
/// send or receive-loop iteration never observes a half-torn-down handle
pub(crate) enum SocketHandle {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// State shared between the connection and its receive thread
pub(crate) struct Shared {
    pub(crate) socket: Mutex<Option<SocketHandle>>,
    pub(crate) sync: SyncBuffer,
    pub(crate) listeners: ListenerHub,
    pub(crate) eop: Mutex<EndOfPacket>,
    pub(crate) stop: AtomicBool,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    synchronous: AtomicUsize,
    trace: AtomicU8,
    state: AtomicU8,
}

impl Shared {
    fn new() -> Self {
        Self {
            socket: Mutex::new(None),
            sync: SyncBuffer::new(),
            listeners: ListenerHub::new(),
            eop: Mutex::new(EndOfPacket::None),
            stop: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            synchronous: AtomicUsize::new(0),
            trace: AtomicU8::new(TraceLevel::Off as u8),
            state: AtomicU8::new(MediaState::Closed as u8),
        }
    }

    pub(crate) fn trace(&self) -> TraceLevel {
        TraceLevel::from_ordinal(self.trace.load(Ordering::Relaxed))
    }

    pub(crate) fn state(&self) -> MediaState {
        MediaState::from_ordinal(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn is_open(&self) -> bool {
        self.socket.lock().is_some()
    }

    pub(crate) fn is_synchronous(&self) -> bool {
        self.synchronous.load(Ordering::Relaxed) != 0
    }

    /// Record a state transition and notify all listeners
    pub(crate) fn transition(&self, state: MediaState) {
        self.state.store(state as u8, Ordering::Relaxed);
        self.listeners.notify_media_state_change(state, self.trace());
    }

    /// Report an error raised inside the receive loop
    pub(crate) fn notify_error(&self, error: Error) {
        self.listeners.notify_error(error, self.trace());
    }

    /// Close transition driven by the receive loop after the peer went
    /// away. The dead thread itself is reaped by the next `close()`.
    pub(crate) fn close_from_receiver(&self) {
        let Some(handle) = self.socket.lock().take() else {
            // A caller-side close() beat us to it.
            return;
        };
        self.stop.store(true, Ordering::Relaxed);
        self.transition(MediaState::Closing);
        drop(handle);
        self.transition(MediaState::Closed);
        self.sync.reset_received_size();
    }
}

/// TCP/UDP client connection carrying opaque byte streams.
///
/// # Examples
///
/// Request/response over TCP with a CRLF-delimited reply:
///
/// ```no_run
/// use setu_net::{Connection, EndOfPacket, Protocol, ReceiveParams};
/// use std::time::Duration;
///
/// # fn main() -> setu_net::Result<()> {
/// let mut conn = Connection::with_endpoint(Protocol::Tcp, "10.0.0.5", 4059);
/// conn.set_eop(EndOfPacket::single(b"\r\n".to_vec()));
/// conn.validate()?;
/// conn.open()?;
///
/// let _sync = conn.synchronous();
/// conn.send("STATUS\r\n")?;
/// if let Some(reply) = conn.receive(&ReceiveParams::wait(Duration::from_secs(2)))? {
///     println!("reply: {} bytes", reply.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    protocol: Protocol,
    host: String,
    port: u16,
    connect_timeout: Duration,
    write_timeout: Option<Duration>,
    /// Pass-through tuning value consumed by protocol layers above
    receive_delay: Option<Duration>,
    /// Pass-through tuning value consumed by protocol layers above
    async_wait_time: Option<Duration>,
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    /// Create a closed connection with default settings (TCP, empty host,
    /// port 0). Configure and `validate()` before opening.
    pub fn new() -> Self {
        Self {
            protocol: Protocol::default(),
            host: String::new(),
            port: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            receive_delay: None,
            async_wait_time: None,
            shared: Arc::new(Shared::new()),
            receiver: Mutex::new(None),
        }
    }

    /// Create a closed connection for the given endpoint
    pub fn with_endpoint(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        let mut conn = Self::new();
        conn.protocol = protocol;
        conn.host = host.into();
        conn.port = port;
        conn
    }

    // === Configuration ===

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn set_protocol(&mut self, value: Protocol) {
        if self.protocol != value {
            self.protocol = value;
            self.shared.listeners.notify_property_changed("Protocol");
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host
    }

    pub fn set_host_name(&mut self, value: impl Into<String>) {
        let value = value.into();
        if self.host != value {
            self.host = value;
            self.shared.listeners.notify_property_changed("HostName");
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, value: u16) {
        if self.port != value {
            self.port = value;
            self.shared.listeners.notify_property_changed("Port");
        }
    }

    pub fn eop(&self) -> EndOfPacket {
        self.shared.eop.lock().clone()
    }

    pub fn set_eop(&mut self, value: EndOfPacket) {
        *self.shared.eop.lock() = value;
    }

    pub fn trace(&self) -> TraceLevel {
        self.shared.trace()
    }

    pub fn set_trace(&mut self, value: TraceLevel) {
        self.shared.trace.store(value as u8, Ordering::Relaxed);
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn set_connect_timeout(&mut self, value: Duration) {
        self.connect_timeout = value;
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    /// `None` removes the bound; a hung TCP write then blocks the caller
    /// until the OS write completes or errors.
    pub fn set_write_timeout(&mut self, value: Option<Duration>) {
        self.write_timeout = value;
    }

    pub fn receive_delay(&self) -> Option<Duration> {
        self.receive_delay
    }

    pub fn set_receive_delay(&mut self, value: Option<Duration>) {
        self.receive_delay = value;
    }

    pub fn async_wait_time(&self) -> Option<Duration> {
        self.async_wait_time
    }

    pub fn set_async_wait_time(&mut self, value: Option<Duration>) {
        self.async_wait_time = value;
    }

    /// Check the configured endpoint before opening
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Configuration("Invalid hostname".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Configuration("Invalid port".to_string()));
        }
        Ok(())
    }

    /// Clone host, port and protocol from another connection. The socket
    /// and counters are not copied.
    pub fn copy_from(&mut self, other: &Connection) {
        self.set_port(other.port());
        self.set_host_name(other.host_name());
        self.set_protocol(other.protocol());
    }

    // === Listeners ===

    pub fn add_listener(&self, listener: Arc<dyn MediaListener>) {
        self.shared.listeners.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MediaListener>) {
        self.shared.listeners.remove_listener(listener);
    }

    /// Replace the notification context (default: inline on the raising
    /// thread). See [`crate::listener::ChannelDispatcher`].
    pub fn set_notify_dispatcher(&self, dispatcher: Arc<dyn NotifyDispatcher>) {
        self.shared.listeners.set_dispatcher(dispatcher);
    }

    // === Lifecycle ===

    /// Open the connection. An already open connection is closed first, so
    /// reopen always passes through `Closed`.
    pub fn open(&mut self) -> Result<()> {
        self.close();
        self.shared.stop.store(false, Ordering::Relaxed);
        self.shared.sync.reset_last_position();
        self.shared.transition(MediaState::Opening);
        let result = match self.protocol {
            Protocol::Tcp => self.open_tcp(),
            Protocol::Udp => self.open_udp(),
        }
        .and_then(|socket| {
            // OPEN goes out before the loop starts so listeners never
            // observe data or a remote close ahead of the transition.
            self.shared.transition(MediaState::Open);
            self.spawn_receiver(socket)
        });
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                *self.shared.socket.lock() = None;
                self.shared.transition(MediaState::Closing);
                self.shared.transition(MediaState::Closed);
                Err(e)
            }
        }
    }

    fn open_tcp(&mut self) -> Result<ReceiveSocket> {
        let stream = self.connect_tcp().map_err(Error::Connect)?;
        let origin = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| format!("{}:{}", self.host, self.port));
        let _ = stream.set_nodelay(true);
        if let Err(e) = stream.set_write_timeout(self.write_timeout) {
            log::warn!("Failed to set write timeout: {}", e);
        }
        let reader = stream.try_clone().map_err(Error::Connect)?;
        *self.shared.socket.lock() = Some(SocketHandle::Tcp(stream));
        if self.shared.trace() >= TraceLevel::Info {
            self.shared.listeners.notify_trace(TraceEvent {
                trace_type: TraceType::Info,
                payload: format!(
                    "Client settings: Protocol: {} Host: {} Port: {} Eop: {}",
                    self.protocol,
                    self.host,
                    self.port,
                    self.eop()
                ),
            });
        }
        log::info!("Connected to {}:{}", self.host, self.port);
        Ok(ReceiveSocket::Tcp {
            stream: reader,
            origin,
        })
    }

    fn connect_tcp(&self) -> std::io::Result<TcpStream> {
        let addrs = (self.host.as_str(), self.port).to_socket_addrs()?;
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "host resolved to no addresses",
            )
        }))
    }

    fn open_udp(&mut self) -> Result<ReceiveSocket> {
        // Connectionless: a local unbound socket, no connect phase.
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(STOP_POLL_INTERVAL))?;
        let reader = socket.try_clone()?;
        *self.shared.socket.lock() = Some(SocketHandle::Udp(socket));
        log::info!("UDP socket open towards {}:{}", self.host, self.port);
        Ok(ReceiveSocket::Udp(reader))
    }

    fn spawn_receiver(&self, socket: ReceiveSocket) -> Result<()> {
        let handle = receiver::spawn(Arc::clone(&self.shared), socket)?;
        *self.receiver.lock() = Some(handle);
        Ok(())
    }

    /// Close the connection and join the receive loop. No listener
    /// notification arrives after this returns. A no-op when already
    /// closed; safe to call from any thread and from teardown.
    pub fn close(&self) {
        let handle = self.shared.socket.lock().take();
        let thread = self.receiver.lock().take();
        let Some(handle) = handle else {
            // Never opened, or the receive loop already ran the close
            // transition after a remote disconnect; reap the thread.
            if let Some(thread) = thread {
                let _ = thread.join();
            }
            return;
        };
        self.shared.transition(MediaState::Closing);
        self.shared.stop.store(true, Ordering::Relaxed);
        if let SocketHandle::Tcp(stream) = &handle {
            // Half-close the write side so the peer sees an orderly
            // shutdown; it may already be gone, failures are benign.
            let _ = stream.shutdown(Shutdown::Write);
            // Unblock the receive loop's pending read.
            let _ = stream.shutdown(Shutdown::Read);
        }
        if let Some(thread) = thread {
            if thread.join().is_err() {
                log::error!("Receive thread panicked");
            }
        }
        drop(handle);
        self.shared.transition(MediaState::Closed);
        self.shared.sync.reset_received_size();
        log::info!("Connection closed");
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    pub fn state(&self) -> MediaState {
        self.shared.state()
    }

    // === Data transfer ===

    /// Send one payload. Blocks until the underlying write completes,
    /// bounded by the configured write timeout for TCP. A peer-reset or
    /// broken-pipe condition closes the connection and returns `Ok`: the
    /// disconnect is reported through the state machine, not as a send
    /// failure.
    pub fn send(&self, payload: impl Into<SendPayload>) -> Result<()> {
        let data = payload.into().into_bytes();
        if !self.is_open() {
            return Err(Error::NotOpen);
        }
        if self.shared.trace() == TraceLevel::Verbose {
            self.shared.listeners.notify_trace(TraceEvent {
                trace_type: TraceType::Sent,
                payload: hex_string(&data),
            });
        }
        // A synchronous receive issued right after this send must not
        // match leftovers from before it.
        self.shared.sync.reset_last_position();
        let result = {
            let mut slot = self.shared.socket.lock();
            let Some(socket) = slot.as_mut() else {
                return Err(Error::NotOpen);
            };
            match socket {
                SocketHandle::Tcp(stream) => stream.write_all(&data),
                SocketHandle::Udp(socket) => send_datagram(socket, &self.host, self.port, &data),
            }
        };
        match result {
            Ok(()) => {
                self.shared
                    .bytes_sent
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if receiver::is_disconnect(e.kind()) => {
                log::info!("Send failed, peer is gone: {}", e);
                self.close();
                Ok(())
            }
            Err(e) => Err(Error::Transport(e)),
        }
    }

    /// Wait for one complete reply frame, as delimited by the configured
    /// end-of-packet marker. Returns `Ok(None)` when the wait budget
    /// elapses first. Callers enter synchronous mode (see
    /// [`Connection::synchronous`]) before sending the request, otherwise
    /// received bytes go to the listeners instead of the frame buffer.
    pub fn receive(&self, params: &ReceiveParams) -> Result<Option<Vec<u8>>> {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }
        Ok(self.shared.sync.wait_frame(params.wait_time))
    }

    // === Synchronous mode ===

    /// Enter synchronous mode for the lifetime of the returned guard.
    /// Nesting is allowed; the connection stays synchronous until the
    /// last guard is dropped.
    pub fn synchronous(&self) -> SyncGuard {
        self.shared.synchronous.fetch_add(1, Ordering::Relaxed);
        SyncGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_synchronous(&self) -> bool {
        self.shared.is_synchronous()
    }

    /// Discard everything buffered for synchronous receivers
    pub fn reset_synchronous_buffer(&self) {
        self.shared.sync.reset_received_size();
    }

    // === Counters ===

    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Relaxed)
    }

    pub fn reset_byte_counters(&self) {
        self.shared.bytes_sent.store(0, Ordering::Relaxed);
        self.shared.bytes_received.store(0, Ordering::Relaxed);
    }

    // === Identity and settings ===

    /// `host:port`, or empty when no host is configured
    pub fn name(&self) -> String {
        if self.host.is_empty() {
            String::new()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn media_type(&self) -> &'static str {
        "Net"
    }

    /// Serialize host, port and protocol to the settings blob consumed by
    /// the framework's settings UI
    pub fn settings(&self) -> String {
        settings::serialize(&NetSettings {
            host: self.host.clone(),
            port: self.port,
            protocol: self.protocol,
        })
    }

    /// Apply a settings blob. Missing elements fall back to defaults
    /// (TCP, empty host, port 0); unknown tags are ignored.
    pub fn apply_settings(&mut self, value: &str) -> Result<()> {
        let parsed = settings::parse(value)?;
        self.set_protocol(parsed.protocol);
        self.set_host_name(parsed.host);
        self.set_port(parsed.port);
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// RAII guard holding the connection in synchronous mode
pub struct SyncGuard {
    shared: Arc<Shared>,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.shared.synchronous.fetch_sub(1, Ordering::Relaxed);
    }
}

fn send_datagram(socket: &UdpSocket, host: &str, port: u16, data: &[u8]) -> std::io::Result<()> {
    let sent = socket.send_to(data, (host, port))?;
    if sent != data.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "datagram truncated",
        ));
    }
    Ok(())
}
