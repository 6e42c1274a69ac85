// src/utils/errors.rs
//! Engine error types
//!
//! Every failure that reaches a caller is an [`EngineError`]. Each variant
//! maps to a stable [`ErrorCode`] so the controller can report failures as
//! structured objects instead of free-form strings.

use crate::runtime::link::{MessageId, VuserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Stable error codes reported to the controller
///
/// The numeric range is reserved by the runner protocol; codes outside it
/// are rejected by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Sdk,
    SdkLogic,
    Custom,
    Crash,
    Script,
    Parsing,
    Socket,
    Extractors,
}

impl ErrorCode {
    /// Numeric value on the wire
    pub fn value(self) -> i32 {
        match self {
            ErrorCode::Sdk => -103848,
            ErrorCode::SdkLogic => -103847,
            ErrorCode::Custom => -103846,
            ErrorCode::Crash => -103845,
            ErrorCode::Script => -103844,
            ErrorCode::Parsing => -103843,
            ErrorCode::Socket => -103842,
            ErrorCode::Extractors => -103841,
        }
    }

    /// Reverse lookup of a wire value
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            -103848 => Some(ErrorCode::Sdk),
            -103847 => Some(ErrorCode::SdkLogic),
            -103846 => Some(ErrorCode::Custom),
            -103845 => Some(ErrorCode::Crash),
            -103844 => Some(ErrorCode::Script),
            -103843 => Some(ErrorCode::Parsing),
            -103842 => Some(ErrorCode::Socket),
            -103841 => Some(ErrorCode::Extractors),
            _ => None,
        }
    }
}

/// Main engine error type
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Backend connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unit initialization failed: {0}")]
    InitFailed(String),

    #[error("Script failed to load: {0}")]
    ScriptFailed(String),

    #[error("Vuser with id {0} has no execution manager")]
    UnknownVuser(VuserId),

    #[error("Vuser with id {0} is already active")]
    VuserExists(VuserId),

    #[error("Vuser {vuser_id} cannot {operation} while {state}")]
    InvalidState {
        vuser_id: VuserId,
        operation: &'static str,
        state: String,
    },

    #[error("Canceled callback for request {0}")]
    CallbackCanceled(MessageId),

    #[error("A blocking call is already in flight on this channel")]
    SyncCallInFlight,

    #[error("Handoff channel closed")]
    ChannelClosed,

    #[error("Mutex is in inconsistent state: {0}")]
    InconsistentLock(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown timer {0}")]
    UnknownTimer(u64),

    #[error("No socket registered with id {0}")]
    UnknownSocket(String),

    #[error("Socket {0} closed")]
    SocketClosed(String),

    #[error("Socket barrier broken: {0}")]
    BarrierBroken(String),

    #[error("Unit terminated: {0}")]
    UnitTerminated(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::ConfigError(_) | EngineError::InvalidArgument(_) => ErrorCode::SdkLogic,
            EngineError::ConnectionFailed(_)
            | EngineError::UnknownSocket(_)
            | EngineError::SocketClosed(_)
            | EngineError::BarrierBroken(_) => ErrorCode::Socket,
            EngineError::ProtocolError(_) | EngineError::Json(_) => ErrorCode::Parsing,
            EngineError::CallbackCanceled(_) => ErrorCode::Custom,
            EngineError::ScriptFailed(_) => ErrorCode::Script,
            EngineError::InitFailed(_)
            | EngineError::UnknownVuser(_)
            | EngineError::VuserExists(_)
            | EngineError::InvalidState { .. }
            | EngineError::SyncCallInFlight
            | EngineError::UnknownTimer(_)
            | EngineError::Io(_) => ErrorCode::Sdk,
            EngineError::ChannelClosed
            | EngineError::InconsistentLock(_)
            | EngineError::UnitTerminated(_) => ErrorCode::Crash,
        }
    }

    /// Structured form of this error
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// Structured error surfaced to the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Stable error code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,
}

impl ErrorReport {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.value(), self.message)
    }
}
