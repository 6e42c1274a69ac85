// src/runtime/mod.rs
//! Per-vuser runtime
//!
//! Each vuser runs as a pair of OS threads:
//!
//! - **Execution unit**: runs the script and exposes the call surface
//!   ([`ExecutionContext`]), timers and socket callbacks
//! - **Communication unit**: owns the backend connection and routes replies
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────── VuserManager ────────────────┐
//!                 │  DashMap<VuserId, slot>   event pump ──► subscribers
//!                 └──────┬──────────────────────────────┬────────┘
//!                  Executor proxy              Communicator proxy
//!                        │                              │
//!        ┌───────────────▼─────────┐   Request   ┌──────▼──────────────────┐
//!        │ execution unit thread   │ ──────────► │ communication unit      │
//!        │  script, timers,        │ ◄────────── │  thread, TCP socket,    │
//!        │  sockets, callbacks     │  Delivery   │  line framing           │
//!        └───────────▲─────────────┘             └──────┬──────────────────┘
//!                    └────── handoff channel (sendSync) ─┘
//! ```
//!
//! The handoff channel is the only memory the two threads share.

pub mod communication_unit;
pub mod communicator;
pub mod context;
pub mod events;
pub mod execution_unit;
pub mod executor;
pub mod futex;
pub mod handoff;
pub mod link;
pub mod sockets;
pub mod timers;
pub mod vuser_manager;

// Re-export commonly used types
pub use communicator::Communicator;
pub use context::ExecutionContext;
pub use events::{LogLevel, LogRecord, UnitEvent, VuserEvent};
pub use executor::Executor;
pub use handoff::{HandoffCloser, Requester, Responder};
pub use link::{MessageId, VuserId};
pub use sockets::SocketRegistry;
pub use timers::{TimerId, TimerOutcome, TimerTable};
pub use vuser_manager::{VuserManager, VuserState};
