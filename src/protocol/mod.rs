// src/protocol/mod.rs
//! Backend wire protocol
//!
//! Newline-delimited JSON in both directions. Every frame carries a
//! numeric `messageId`; `-1` marks a frame pushed by the server for a
//! registered socket.

pub mod frame;

// Re-export commonly used types
pub use frame::{classify_reply, protocol_error_reply, Envelope, FrameHeader, ORIGINATOR_VUSER};

/// Message types the engine itself sends
pub mod message_types {
    pub const CYCLE_START: &str = "VUser.CycleStart";
    pub const CYCLE_END: &str = "VUser.CycleEnd";
    pub const CRASH: &str = "VUser.Crash";
    pub const ABORT: &str = "VUser.Abort";
}
