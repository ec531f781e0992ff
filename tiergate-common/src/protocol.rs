//! Frames the server sends over a streaming session.
//!
//! # Session Flow
//!
//! 1. Client opens the WebSocket and sends one `StreamRequest` as a text message
//! 2. While the session waits for capacity the server sends `Queued` once per tick
//! 3. Once admitted the server sends one `Fragment` per generated piece of text
//! 4. The session ends with `Done`, preceded by `Error` if generation failed
//! 5. The server closes the socket
//!
//! Every frame is a JSON object with a `type` field.

use serde::{Deserialize, Serialize};

/// Footer appended to every fragment on the plain HTTP streaming endpoint.
pub const CHAT_STREAM_FOOTER: &str = "///";
/// Final chunk of the plain HTTP streaming endpoint.
pub const CHAT_STREAM_TERMINATOR: &str = "/././";

/// Progress report for a session that is waiting for capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Sessions currently holding capacity in more tolerant tiers.
    pub occupancy: usize,
    /// Seconds left before the session is admitted regardless of occupancy.
    pub remaining_secs: u64,
}

/// Messages sent from server to client during a streaming session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// The session is waiting for capacity.
    Queued(QueueStatus),
    /// One piece of generated output.
    Fragment { text: String },
    /// Generation failed; the session is about to end.
    Error { message: String },
    /// No more frames follow.
    Done,
}

impl ServerFrame {
    pub fn fragment(text: impl Into<String>) -> Self {
        Self::Fragment { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Whether the frame ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Response of the queue depth polling endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Sessions currently holding capacity, summed over every tier.
    pub queue_length: usize,
    /// Streaming connections currently open, queued or generating.
    pub connections: usize,
}
