//! Synchronous receive buffering and frame boundary detection
//!
//! The receive thread appends chunks while a caller blocks until a
//! logically complete reply frame is available, where "complete" is
//! decided by the configured [`EndOfPacket`] marker rather than by
//! length. Producer and consumer share one lock; boundary detection runs
//! once per appended chunk on the producer side, so the consumer never
//! has to re-scan the buffer.

use crate::types::EndOfPacket;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct SyncState {
    /// Accumulated bytes, pending and consumed
    buffer: Vec<u8>,
    /// Start of the region the next frame is read from
    last_position: usize,
    /// End offset (exclusive, marker included) of a ready frame
    frame_end: Option<usize>,
}

/// Buffer shared between the receive thread and synchronous receivers
#[derive(Default)]
pub(crate) struct SyncBuffer {
    state: Mutex<SyncState>,
    frame_ready: Condvar,
}

impl SyncBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a received chunk and run boundary detection.
    ///
    /// The search covers the newly appended region plus `marker_len - 1`
    /// bytes before it, so a marker split across two reads is still found.
    /// With no marker configured, any non-empty append completes a frame.
    pub(crate) fn append(&self, data: &[u8], eop: &EndOfPacket) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        // Everything before the cursor has been consumed or invalidated;
        // drop it before growing the buffer again.
        if state.frame_end.is_none() && state.last_position == state.buffer.len() {
            state.buffer.clear();
            state.last_position = 0;
        }
        let appended_at = state.buffer.len();
        state.buffer.extend_from_slice(data);
        if state.frame_end.is_none() {
            if let Some(end) = detect_frame(&state, appended_at, eop) {
                state.frame_end = Some(end);
                self.frame_ready.notify_all();
            }
        }
    }

    /// Block until a complete frame is available or the budget elapses.
    ///
    /// On success returns the frame (marker included) and advances the
    /// cursor past it so a later receive cannot re-match the same bytes.
    /// `timeout: None` waits without a deadline.
    pub(crate) fn wait_frame(&self, timeout: Option<Duration>) -> Option<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while state.frame_end.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.frame_ready.wait_until(&mut state, deadline).timed_out()
                        && state.frame_end.is_none()
                    {
                        return None;
                    }
                }
                None => self.frame_ready.wait(&mut state),
            }
        }
        let end = state.frame_end.take()?;
        let frame = state.buffer[state.last_position..end].to_vec();
        state.last_position = end;
        Some(frame)
    }

    /// Invalidate everything received so far without touching a frame in
    /// flight semantics: a receive issued after this call only sees bytes
    /// that arrive later. Called when a new send starts and on open.
    pub(crate) fn reset_last_position(&self) {
        let mut state = self.state.lock();
        state.last_position = state.buffer.len();
        state.frame_end = None;
    }

    /// Clear the whole buffer. Called on close and on asynchronous chunks.
    pub(crate) fn reset_received_size(&self) {
        let mut state = self.state.lock();
        state.buffer.clear();
        state.last_position = 0;
        state.frame_end = None;
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        let state = self.state.lock();
        state.buffer.len() - state.last_position
    }
}

/// Find the end offset of the earliest complete frame, if any.
///
/// With multiple candidate markers the EARLIEST byte offset wins;
/// declaration order only breaks exact-offset ties.
fn detect_frame(state: &SyncState, appended_at: usize, eop: &EndOfPacket) -> Option<usize> {
    if let EndOfPacket::None = eop {
        return (state.buffer.len() > state.last_position).then(|| state.buffer.len());
    }
    let overlap = eop.max_len().saturating_sub(1);
    let start = appended_at.saturating_sub(overlap).max(state.last_position);
    let haystack = &state.buffer[start..];
    let mut best: Option<(usize, usize)> = None;
    for pattern in eop.patterns() {
        if let Some(offset) = find_pattern(haystack, pattern) {
            if best.map_or(true, |(b, _)| offset < b) {
                best = Some((offset, pattern.len()));
            }
        }
    }
    best.map(|(offset, len)| start + offset + len)
}

fn find_pattern(haystack: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > haystack.len() {
        return None;
    }
    haystack.windows(pattern.len()).position(|w| w == pattern)
}
