// src/runtime/events.rs
//! Unit events
//!
//! Both units report logs and lifecycle changes to the manager through an
//! unbounded channel. Posting never blocks; if the manager is gone the
//! event is counted as dropped.

use crate::runtime::link::VuserId;
use crate::script::{Stage, StageResult};
use crate::utils::errors::{ErrorCode, ErrorReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Severity of a vuser log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

/// One log line produced inside a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,

    /// Error code attached to failure reports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,

    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }
}

/// Something that happened inside a unit
#[derive(Debug, Clone, PartialEq)]
pub enum UnitEvent {
    Log(LogRecord),

    /// A stage ran to completion (successfully or not)
    StageFinished { stage: Stage, result: StageResult },

    /// The script failed unexpectedly; per-vuser state was cleared
    Crashed(ErrorReport),

    /// The backend connection closed or failed
    ConnectionLost(String),
}

/// Event tagged with the vuser it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct VuserEvent {
    pub vuser_id: VuserId,
    pub event: UnitEvent,
}

/// Sending side of the unit event stream, bound to one vuser
#[derive(Clone)]
pub struct UnitEvents {
    vuser_id: VuserId,
    sender: mpsc::UnboundedSender<VuserEvent>,
    dropped: Arc<AtomicU64>,
}

impl UnitEvents {
    pub fn new(vuser_id: VuserId, sender: mpsc::UnboundedSender<VuserEvent>) -> Self {
        Self {
            vuser_id,
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn vuser_id(&self) -> VuserId {
        self.vuser_id
    }

    /// Post an event without blocking
    pub fn emit(&self, event: UnitEvent) {
        let event = VuserEvent {
            vuser_id: self.vuser_id,
            event,
        };
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(UnitEvent::Log(LogRecord::new(level, message)));
    }

    /// Log a failure report carrying an error code
    pub fn log_with_code(&self, level: LogLevel, code: ErrorCode, message: impl Into<String>) {
        self.emit(UnitEvent::Log(LogRecord::new(level, message).with_code(code)));
    }

    pub fn trace(&self, message: impl Into<String>) {
        self.log(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Events that could not be delivered
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
