//! tiergate Common Types
//!
//! Shared types used by the tiergate server and its clients.

pub mod protocol;
pub mod request;

pub use protocol::{QueueDepth, QueueStatus, ServerFrame, CHAT_STREAM_FOOTER, CHAT_STREAM_TERMINATOR};
pub use request::{CompletionsRequest, HistoryMessage, StreamRequest};
