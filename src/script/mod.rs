// src/script/mod.rs
//! Script surface
//!
//! A script is Rust code handed to the engine as a [`ScriptLoader`]. The
//! loader runs on the execution unit's thread and registers the script's
//! steps in a [`FlowRegistry`]; the stage runner then executes them.

pub mod flow_registry;

use crate::runtime::link::VuserId;
use crate::utils::errors::{EngineError, ErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// Re-export commonly used types
pub use flow_registry::{FlowRegistry, Step};

/// Script lifecycle stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Initialize,
    Action,
    Finalize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initialize => "initialize",
            Stage::Action => "action",
            Stage::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageResult {
    Success,
    Failure,
}

/// Arguments of a stage dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageArgs {
    pub stage: Stage,

    /// Steps to run, in order; `None` runs every registered step
    #[serde(default)]
    pub flow: Option<Vec<String>>,
}

impl StageArgs {
    /// Run every registered step of `stage`
    pub fn all(stage: Stage) -> Self {
        Self { stage, flow: None }
    }

    /// Run exactly the named steps of `stage`
    pub fn flow<I, S>(stage: Stage, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stage,
            flow: Some(names.into_iter().map(Into::into).collect()),
        }
    }
}

/// Per-vuser configuration handed to the script loader
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VuserConfig {
    pub vuser_id: VuserId,
    pub script_name: String,
    pub script_path: PathBuf,
    pub user_args: HashMap<String, String>,
    pub env: HashMap<String, String>,
}

impl VuserConfig {
    pub fn new(vuser_id: VuserId, script_name: impl Into<String>) -> Self {
        Self {
            vuser_id,
            script_name: script_name.into(),
            ..Default::default()
        }
    }
}

/// How a script asked to leave the current flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitType {
    /// End the current iteration
    Iteration,

    /// Stop the vuser after the current iteration
    Stop,

    /// Abort the vuser immediately
    Abort,
}

/// Failure raised by script code
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    /// Requested exit, or a fatal reply from the backend
    #[error("{message}")]
    Abort { exit_type: ExitType, message: String },

    /// Error reply from the backend or a failed SDK call
    #[error("{error_type} error: {message}")]
    Load {
        error_type: String,
        message: String,
        code: i64,
    },

    /// An async call was canceled at an iteration boundary
    #[error("{0}")]
    Canceled(String),

    /// The stage names a step that was never registered
    #[error("invalid function name: '{0}'")]
    InvalidFlow(String),

    /// Anything else; treated as a crash
    #[error("{0}")]
    Crash(String),
}

impl ScriptError {
    pub fn abort(message: impl Into<String>) -> Self {
        ScriptError::Abort {
            exit_type: ExitType::Abort,
            message: message.into(),
        }
    }

    pub fn crash(message: impl Into<String>) -> Self {
        ScriptError::Crash(message.into())
    }

    /// Expected errors end the stage with a failure; the rest crash the vuser
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ScriptError::Abort { .. } | ScriptError::Load { .. } | ScriptError::Canceled(_)
        )
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ScriptError::Abort { .. } | ScriptError::Canceled(_) => ErrorCode::Custom,
            ScriptError::Load { code, .. } => ErrorCode::from_value(*code).unwrap_or(ErrorCode::Sdk),
            ScriptError::InvalidFlow(_) => ErrorCode::Script,
            ScriptError::Crash(_) => ErrorCode::Crash,
        }
    }
}

impl From<EngineError> for ScriptError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::CallbackCanceled(_)
            | EngineError::SocketClosed(_)
            | EngineError::BarrierBroken(_) => ScriptError::Canceled(err.to_string()),
            EngineError::ChannelClosed
            | EngineError::InconsistentLock(_)
            | EngineError::UnitTerminated(_) => ScriptError::Crash(err.to_string()),
            other => ScriptError::Load {
                error_type: "net".to_string(),
                message: other.to_string(),
                code: other.code().value() as i64,
            },
        }
    }
}

/// Loads a script into a vuser's flow registry
///
/// Called once per vuser, on the execution unit's thread, when the vuser
/// is run.
pub trait ScriptLoader: Send + Sync + 'static {
    fn load(&self, config: &VuserConfig, flows: &mut FlowRegistry) -> Result<(), ScriptError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_args_deserialize() {
        let args: StageArgs = serde_json::from_str(r#"{"stage":"action"}"#).unwrap();
        assert_eq!(args, StageArgs::all(Stage::Action));

        let args: StageArgs =
            serde_json::from_str(r#"{"stage":"initialize","flow":["login","warmup"]}"#).unwrap();
        assert_eq!(args, StageArgs::flow(Stage::Initialize, ["login", "warmup"]));
    }

    #[test]
    fn test_error_classification() {
        assert!(ScriptError::abort("bye").is_expected());
        assert!(ScriptError::Canceled("late".into()).is_expected());
        assert!(!ScriptError::InvalidFlow("missing".into()).is_expected());
        assert!(!ScriptError::crash("boom").is_expected());
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: ScriptError = EngineError::CallbackCanceled(4).into();
        assert!(matches!(err, ScriptError::Canceled(_)));

        let err: ScriptError = EngineError::ChannelClosed.into();
        assert!(matches!(err, ScriptError::Crash(_)));

        let err: ScriptError = EngineError::InvalidArgument("empty".into()).into();
        assert_eq!(err.code(), ErrorCode::SdkLogic);
        assert!(err.is_expected());
    }

    #[test]
    fn test_vuser_config_camel_case() {
        let config: VuserConfig =
            serde_json::from_str(r#"{"vuserId":3,"scriptName":"main","userArgs":{"a":"1"}}"#).unwrap();
        assert_eq!(config.vuser_id, 3);
        assert_eq!(config.script_name, "main");
        assert_eq!(config.user_args.get("a").map(String::as_str), Some("1"));
    }
}
