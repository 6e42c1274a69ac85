// src/runtime/link.rs
//! Inter-unit link messages
//!
//! Every message kind crossing a thread boundary is a closed enum, matched
//! exhaustively by the receiving unit.
//!
//! ```text
//!  Executor proxy ──ExecutorCommand──►  Execution unit ──Request──►  Communication unit
//!                                             ▲                            │
//!  Communicator proxy ─CommunicatorCommand─┐  └─────────Delivery──────────┘
//!                                          └──────────────────────────────►│
//! ```

use crate::script::{StageArgs, VuserConfig};
use crate::utils::errors::Result;
use tokio::sync::{mpsc, oneshot};

/// Identifier of one virtual user
pub type VuserId = u64;

/// Correlation id pairing a request with its reply
pub type MessageId = i64;

/// Correlation id of server-pushed frames
pub const PUSH_MESSAGE_ID: MessageId = -1;

/// How the communication unit must treat the reply of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Reply is forwarded back over the link as [`Delivery::Reply`]
    Send,

    /// Reply is handed over through the handoff channel
    SendSync,

    /// No reply expected
    SendSyncNoWait,
}

/// Outbound request from the execution unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub message_id: MessageId,

    /// Complete wire line, written to the backend as is
    pub payload: String,
}

/// Inbound message to the execution unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Reply to an async request
    Reply { message_id: MessageId, content: String },

    /// Push frame for a registered socket
    Socket { socket_id: String, content: String },
}

/// Control messages for the communication unit
#[derive(Debug)]
pub enum CommunicatorCommand {
    Shutdown,
}

/// Control messages for the execution unit
pub enum ExecutorCommand {
    /// Load the script and report the outcome
    Run {
        config: VuserConfig,
        reply: oneshot::Sender<Result<()>>,
    },

    /// Run one stage; the outcome is reported as an event
    Stage(StageArgs),

    Shutdown,
}

impl std::fmt::Debug for ExecutorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorCommand::Run { config, .. } => {
                f.debug_struct("Run").field("config", config).finish()
            }
            ExecutorCommand::Stage(args) => f.debug_tuple("Stage").field(args).finish(),
            ExecutorCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Execution-unit ends of the request/delivery link
pub struct ExecutionLink {
    pub requests: mpsc::UnboundedSender<Request>,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Communication-unit ends of the request/delivery link
pub struct CommunicationLink {
    pub requests: mpsc::UnboundedReceiver<Request>,
    pub deliveries: mpsc::UnboundedSender<Delivery>,
}

/// Create the private link between one execution unit and its
/// communication unit
///
/// Unbounded so that neither side ever blocks on the other outside the
/// handoff channel.
pub fn inter_unit_link() -> (ExecutionLink, CommunicationLink) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

    (
        ExecutionLink {
            requests: request_tx,
            deliveries: delivery_rx,
        },
        CommunicationLink {
            requests: request_rx,
            deliveries: delivery_tx,
        },
    )
}
