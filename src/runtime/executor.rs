// src/runtime/executor.rs
//! Manager-side proxy of an execution unit

use crate::runtime::communicator::await_ready;
use crate::runtime::events::UnitEvents;
use crate::runtime::execution_unit::ExecutionUnit;
use crate::runtime::handoff::Requester;
use crate::runtime::link::{ExecutionLink, ExecutorCommand, VuserId};
use crate::script::{ScriptLoader, StageArgs, VuserConfig};
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Handle to a running execution unit
pub struct Executor {
    vuser_id: VuserId,
    commands: mpsc::UnboundedSender<ExecutorCommand>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Executor {
    /// Spawn the unit and wait until its runtime is up
    pub async fn start(
        vuser_id: VuserId,
        loader: Arc<dyn ScriptLoader>,
        link: ExecutionLink,
        requester: Requester,
        events: UnitEvents,
        timeout: Duration,
    ) -> Result<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let unit = ExecutionUnit {
            vuser_id,
            loader,
            link,
            requester,
            events,
            commands: command_rx,
        };
        let thread = unit.spawn(ready_tx)?;

        let executor = Self {
            vuser_id,
            commands,
            thread: Mutex::new(Some(thread)),
        };

        if let Err(err) = await_ready(ready_rx, timeout, "execution").await {
            executor.shutdown();
            executor.take_thread();
            return Err(err);
        }

        debug!(vuser_id, "Executor ready");
        Ok(executor)
    }

    pub fn vuser_id(&self) -> VuserId {
        self.vuser_id
    }

    /// Load the vuser's script
    pub async fn run(&self, config: VuserConfig) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        self.send(ExecutorCommand::Run { config, reply })?;

        outcome.await.map_err(|_| self.terminated())?
    }

    /// Dispatch a stage; its outcome arrives as an event
    pub fn run_stage(&self, args: StageArgs) -> Result<()> {
        self.send(ExecutorCommand::Stage(args))
    }

    /// Ask the unit to exit; a no-op if it is already gone
    pub fn shutdown(&self) {
        let _ = self.commands.send(ExecutorCommand::Shutdown);
    }

    pub(crate) fn take_thread(&self) -> Option<thread::JoinHandle<()>> {
        self.thread.lock().take()
    }

    fn send(&self, command: ExecutorCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| self.terminated())
    }

    fn terminated(&self) -> EngineError {
        EngineError::UnitTerminated(format!("execution unit of vuser {} is gone", self.vuser_id))
    }
}
