// src/runtime/communicator.rs
//! Manager-side proxy of a communication unit

use crate::runtime::communication_unit::CommunicationUnit;
use crate::runtime::events::UnitEvents;
use crate::runtime::handoff::{HandoffCloser, Responder};
use crate::runtime::link::{CommunicationLink, CommunicatorCommand, VuserId};
use crate::utils::config::BackendConfig;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Handle to a running communication unit
pub struct Communicator {
    vuser_id: VuserId,
    commands: mpsc::UnboundedSender<CommunicatorCommand>,
    closer: HandoffCloser,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Communicator {
    /// Spawn the unit and wait until it is connected to the backend
    pub async fn start(
        vuser_id: VuserId,
        backend: BackendConfig,
        link: CommunicationLink,
        responder: Responder,
        events: UnitEvents,
        timeout: Duration,
    ) -> Result<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let closer = responder.closer();

        let unit = CommunicationUnit {
            vuser_id,
            backend,
            link,
            responder,
            events,
            commands: command_rx,
        };
        let thread = unit.spawn(ready_tx)?;

        let communicator = Self {
            vuser_id,
            commands,
            closer,
            thread: Mutex::new(Some(thread)),
        };

        if let Err(err) = await_ready(ready_rx, timeout, "communication").await {
            communicator.shutdown();
            communicator.take_thread();
            return Err(err);
        }

        debug!(vuser_id, "Communicator ready");
        Ok(communicator)
    }

    pub fn vuser_id(&self) -> VuserId {
        self.vuser_id
    }

    /// Close the handoff channel shared with the execution unit
    pub fn close_channel(&self) {
        self.closer.close();
    }

    /// Ask the unit to exit; a no-op if it is already gone
    pub fn shutdown(&self) {
        let _ = self.commands.send(CommunicatorCommand::Shutdown);
    }

    /// Whether the unit stopped reading commands
    pub fn is_terminated(&self) -> bool {
        self.commands.is_closed()
    }

    pub(crate) fn take_thread(&self) -> Option<thread::JoinHandle<()>> {
        self.thread.lock().take()
    }
}

/// Wait for a unit's start-up acknowledgement
pub(crate) async fn await_ready(
    ready: oneshot::Receiver<Result<()>>,
    timeout: Duration,
    unit: &str,
) -> Result<()> {
    match tokio::time::timeout(timeout, ready).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(EngineError::InitFailed(format!(
            "{} unit exited before acknowledging start",
            unit
        ))),
        Err(_) => {
            warn!("{} unit did not start within {:?}", unit, timeout);
            Err(EngineError::InitFailed(format!(
                "{} unit did not start within {}ms",
                unit,
                timeout.as_millis()
            )))
        }
    }
}
