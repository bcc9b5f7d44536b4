//! setu-net - TCP/UDP client media transport
//!
//! This library carries opaque byte streams between a device-communication
//! framework and a remote endpoint. It supports two delivery modes:
//!
//! - **Asynchronous**: every received chunk is forwarded to registered
//!   [`listener::MediaListener`]s as it arrives.
//! - **Synchronous**: received bytes are buffered and a caller blocks
//!   until one logically complete reply frame is available, as delimited
//!   by a configurable end-of-packet marker.
//!
//! One background thread per open connection performs the blocking reads;
//! open, close, send and the synchronous receive run on the caller's
//! threads. See [`Connection`] for the full lifecycle.

pub mod connection;
pub mod error;
pub mod listener;
pub mod settings;
pub mod types;

mod receiver;
mod sync_buffer;

// Re-export commonly used types
pub use connection::{Connection, SyncGuard, DEFAULT_CONNECT_TIMEOUT, DEFAULT_WRITE_TIMEOUT};
pub use error::{Error, Result};
pub use listener::{MediaListener, ReceiveEvent, TraceEvent};
pub use types::{
    EndOfPacket, MediaState, Protocol, ReceiveParams, SendPayload, TraceLevel, TraceType,
};
