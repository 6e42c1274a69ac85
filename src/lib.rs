// src/lib.rs
//! Vuser Engine Library
//!
//! Per-virtual-user execution engine of a load runner. Every vuser runs a
//! script on its own execution thread and talks to the backend protocol
//! engine through a dedicated communication thread.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **runtime**: unit threads, handoff channel, lifecycle manager
//! - **script**: script loading, flow registry, script errors
//! - **protocol**: backend frames and message envelopes
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and errors

// Public module exports
pub mod observability;
pub mod protocol;
pub mod runtime;
pub mod script;
pub mod utils;

// Re-export commonly used types
pub use runtime::context::ExecutionContext;
pub use runtime::vuser_manager::{VuserManager, VuserState};
pub use script::{FlowRegistry, ScriptError, ScriptLoader, Stage, StageArgs, VuserConfig};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

/// Version banner: crate version, git revision and compiler
///
/// The revision and compiler are stamped by `build.rs`.
pub fn build_banner() -> String {
    format!(
        "v{} ({}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("RUSTC_VERSION")
    )
}
