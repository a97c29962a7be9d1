//! Server error types.
//!
//! Faults are handled at the boundary where they are detected. Transport
//! and write-exhaustion faults terminate the affected session; nothing
//! here ever escalates past a single connection. Unparseable input is
//! not a session fault, the frame reader discards it and keeps going.

use thiserror::Error;

/// Per-session error type. Any of these ends the session that raised it.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Socket read or write failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The peer stopped draining its socket and a frame write could not
    /// complete within the retry budget.
    #[error("write stalled, gave up after {attempts} attempts")]
    WriteExhausted { attempts: u32 },

    /// The peer closed the connection in the middle of a frame.
    #[error("connection closed mid-frame")]
    TruncatedFrame,
}
