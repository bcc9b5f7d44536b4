//! Core types shared across the transport

use std::fmt;
use std::time::Duration;

/// Network protocol used by a connection.
///
/// The discriminants are part of the settings wire format
/// (`<Protocol>ordinal</Protocol>`) and must not be reordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    /// Connectionless datagrams
    Udp = 0,
    /// Stream connection
    #[default]
    Tcp = 1,
}

impl Protocol {
    /// Ordinal used by the settings blob
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Protocol::ordinal`]
    pub fn from_ordinal(value: u8) -> Option<Self> {
        match value {
            0 => Some(Protocol::Udp),
            1 => Some(Protocol::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Tcp => write!(f, "TCP"),
        }
    }
}

/// Connection lifecycle state.
///
/// Transitions: `Closed -> Opening -> Open -> Closing -> Closed`.
/// `Opening` may fall straight back to `Closed` on a failed TCP connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum MediaState {
    Opening = 0,
    Open = 1,
    Closing = 2,
    #[default]
    Closed = 3,
}

impl MediaState {
    pub(crate) fn from_ordinal(value: u8) -> Self {
        match value {
            0 => MediaState::Opening,
            1 => MediaState::Open,
            2 => MediaState::Closing,
            _ => MediaState::Closed,
        }
    }
}

impl fmt::Display for MediaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaState::Opening => write!(f, "Opening"),
            MediaState::Open => write!(f, "Open"),
            MediaState::Closing => write!(f, "Closing"),
            MediaState::Closed => write!(f, "Closed"),
        }
    }
}

/// How much the connection reports through trace notifications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TraceLevel {
    #[default]
    Off = 0,
    /// Errors only
    Error = 1,
    /// Errors and lifecycle information
    Info = 2,
    /// Everything, including sent and received payloads
    Verbose = 3,
}

impl TraceLevel {
    pub(crate) fn from_ordinal(value: u8) -> Self {
        match value {
            0 => TraceLevel::Off,
            1 => TraceLevel::Error,
            2 => TraceLevel::Info,
            _ => TraceLevel::Verbose,
        }
    }
}

/// Kind of a trace notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceType {
    /// Payload handed to the socket
    Sent,
    /// Payload read from the socket
    Received,
    /// Error report
    Error,
    /// Lifecycle information
    Info,
}

/// End-of-packet marker delimiting a logical reply frame in the byte stream.
///
/// Resolved once at configuration time; patterns match literal bytes only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EndOfPacket {
    /// No marker: any non-empty chunk completes a frame
    #[default]
    None,
    /// One byte pattern
    Single(Vec<u8>),
    /// Ordered set of candidate patterns
    Multiple(Vec<Vec<u8>>),
}

impl EndOfPacket {
    /// Build a single-pattern marker. An empty pattern normalizes to `None`.
    pub fn single(pattern: impl Into<Vec<u8>>) -> Self {
        let pattern = pattern.into();
        if pattern.is_empty() {
            EndOfPacket::None
        } else {
            EndOfPacket::Single(pattern)
        }
    }

    /// Build a multi-pattern marker. Empty patterns are dropped; an empty
    /// set normalizes to `None` and a one-element set to `Single`.
    pub fn multiple(patterns: impl IntoIterator<Item = Vec<u8>>) -> Self {
        let mut patterns: Vec<Vec<u8>> =
            patterns.into_iter().filter(|p| !p.is_empty()).collect();
        match patterns.len() {
            0 => EndOfPacket::None,
            1 => EndOfPacket::Single(patterns.remove(0)),
            _ => EndOfPacket::Multiple(patterns),
        }
    }

    /// Candidate patterns in declaration order
    pub fn patterns(&self) -> &[Vec<u8>] {
        match self {
            EndOfPacket::None => &[],
            EndOfPacket::Single(p) => std::slice::from_ref(p),
            EndOfPacket::Multiple(ps) => ps,
        }
    }

    /// Length of the longest candidate pattern
    pub(crate) fn max_len(&self) -> usize {
        self.patterns().iter().map(Vec::len).max().unwrap_or(0)
    }
}

impl fmt::Display for EndOfPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndOfPacket::None => write!(f, "None"),
            EndOfPacket::Single(p) => write!(f, "{}", hex_string(p)),
            EndOfPacket::Multiple(ps) => {
                let joined: Vec<String> = ps.iter().map(|p| hex_string(p)).collect();
                write!(f, "{}", joined.join(", "))
            }
        }
    }
}

/// Payload accepted by `send`: raw bytes or text encoded as UTF-8
#[derive(Debug, Clone)]
pub enum SendPayload {
    Bytes(Vec<u8>),
    Text(String),
}

impl SendPayload {
    /// Serialize the payload to the bytes that go on the wire
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            SendPayload::Bytes(b) => b,
            SendPayload::Text(s) => s.into_bytes(),
        }
    }
}

impl From<Vec<u8>> for SendPayload {
    fn from(value: Vec<u8>) -> Self {
        SendPayload::Bytes(value)
    }
}

impl From<&[u8]> for SendPayload {
    fn from(value: &[u8]) -> Self {
        SendPayload::Bytes(value.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for SendPayload {
    fn from(value: &[u8; N]) -> Self {
        SendPayload::Bytes(value.to_vec())
    }
}

impl From<String> for SendPayload {
    fn from(value: String) -> Self {
        SendPayload::Text(value)
    }
}

impl From<&str> for SendPayload {
    fn from(value: &str) -> Self {
        SendPayload::Text(value.to_string())
    }
}

/// Parameters for one synchronous receive: how long to wait for a
/// complete frame. `wait_time: None` waits without a deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveParams {
    pub wait_time: Option<Duration>,
}

impl ReceiveParams {
    /// Wait up to `wait_time` for a frame
    pub fn wait(wait_time: Duration) -> Self {
        Self {
            wait_time: Some(wait_time),
        }
    }

    /// Wait without a deadline
    pub fn unbounded() -> Self {
        Self { wait_time: None }
    }
}

/// Render bytes as uppercase hex, space separated
pub(crate) fn hex_string(bytes: &[u8]) -> String {
    let parts: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
    parts.join(" ")
}
