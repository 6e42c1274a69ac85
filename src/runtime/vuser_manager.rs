// src/runtime/vuser_manager.rs
//! Vuser lifecycle manager
//!
//! Owns the table of vusers and drives each one through its states:
//!
//! ```text
//! uninitialized ──init_vuser──► initializing ──► ready ──run──► running(stage) ──stop──► stopped
//!                                     │                              ▲      │
//!                                     └── unit failed: entry removed └──────┘ run_stage
//! ```
//!
//! Every vuser is a pair of unit threads plus the handoff channel between
//! them. The manager talks to the pair only through its proxies and hears
//! back through the unit event stream, which it re-emits through `tracing`
//! and fans out to subscribers.

use crate::observability::names;
use crate::runtime::communicator::Communicator;
use crate::runtime::events::{LogLevel, UnitEvent, UnitEvents, VuserEvent};
use crate::runtime::executor::Executor;
use crate::runtime::handoff;
use crate::runtime::link::{inter_unit_link, VuserId};
use crate::script::{ScriptLoader, Stage, StageArgs, VuserConfig};
use crate::utils::config::{BackendConfig, EngineConfig, RuntimeConfig};
use crate::utils::errors::{EngineError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle state of one vuser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuserState {
    Uninitialized,
    Initializing,
    Ready,

    /// Script loaded; `stage` is the last stage dispatched
    Running { stage: Option<Stage> },

    Stopped,
}

impl VuserState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: &VuserState) -> bool {
        use VuserState::*;

        match (self, next) {
            (_, Stopped) => true,
            (Uninitialized | Stopped, Initializing) => true,
            (Initializing, Ready) => true,
            (Ready, Running { stage: None }) => true,
            (Running { .. }, Running { stage: Some(_) }) => true,
            _ => false,
        }
    }

    /// Holds (or is about to hold) a live unit pair
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            VuserState::Initializing | VuserState::Ready | VuserState::Running { .. }
        )
    }
}

impl fmt::Display for VuserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VuserState::Uninitialized => f.write_str("uninitialized"),
            VuserState::Initializing => f.write_str("initializing"),
            VuserState::Ready => f.write_str("ready"),
            VuserState::Running { stage: None } => f.write_str("running"),
            VuserState::Running { stage: Some(stage) } => write!(f, "running({})", stage),
            VuserState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Proxies of one vuser's two units
struct UnitPair {
    communicator: Communicator,
    executor: Executor,
}

struct VuserSlot {
    state: VuserState,
    units: Option<Arc<UnitPair>>,
}

/// Lifecycle manager for all vusers of this process
pub struct VuserManager {
    backend: BackendConfig,
    runtime: RuntimeConfig,
    loader: Arc<dyn ScriptLoader>,
    vusers: DashMap<VuserId, VuserSlot>,
    events: mpsc::UnboundedSender<VuserEvent>,
    broadcast: broadcast::Sender<VuserEvent>,
    pump: JoinHandle<()>,
}

impl VuserManager {
    /// Create a manager running scripts from `loader`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &EngineConfig, loader: Arc<dyn ScriptLoader>) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(config.runtime.event_capacity);
        let pump = tokio::spawn(pump_events(event_rx, broadcast.clone()));

        Self {
            backend: config.backend.clone(),
            runtime: config.runtime.clone(),
            loader,
            vusers: DashMap::new(),
            events,
            broadcast,
            pump,
        }
    }

    /// Spawn both units of `config.vuser_id` and wait for their start-up
    ///
    /// A failure of either unit removes the vuser again.
    pub async fn init_vuser(&self, config: &VuserConfig) -> Result<VuserId> {
        let vuser_id = config.vuser_id;
        self.claim(vuser_id)?;
        debug!(vuser_id, "Initializing vuser");

        let units = match self.start_units(vuser_id).await {
            Ok(units) => Arc::new(units),
            Err(err) => {
                self.vusers
                    .remove_if(&vuser_id, |_, slot| slot.state == VuserState::Initializing);
                error!(vuser_id, "Vuser initialization failed: {}", err);
                return Err(err);
            }
        };

        let accepted = match self.vusers.get_mut(&vuser_id) {
            Some(mut slot) if slot.state == VuserState::Initializing => {
                slot.state = VuserState::Ready;
                slot.units = Some(Arc::clone(&units));
                true
            }
            _ => false,
        };

        if !accepted {
            self.terminate(vuser_id, &units).await;
            return Err(EngineError::InitFailed(format!(
                "vuser {} was stopped during initialization",
                vuser_id
            )));
        }

        self.update_gauge();
        info!(vuser_id, "Vuser initialized");
        Ok(vuser_id)
    }

    /// Load the vuser's script
    ///
    /// Stages are dispatched afterwards with [`run_stage`](Self::run_stage).
    pub async fn run(&self, vuser_id: VuserId, mut config: VuserConfig) -> Result<()> {
        let units = self.transition(vuser_id, "run", VuserState::Running { stage: None })?;
        config.vuser_id = vuser_id;

        match units.executor.run(config).await {
            Ok(()) => {
                info!(vuser_id, "Vuser running");
                Ok(())
            }
            Err(err) => {
                if let Some(mut slot) = self.vusers.get_mut(&vuser_id) {
                    if slot.state == (VuserState::Running { stage: None }) {
                        slot.state = VuserState::Ready;
                    }
                }
                error!(vuser_id, "Vuser failed to run: {}", err);
                Err(err)
            }
        }
    }

    /// Dispatch a stage without waiting for it
    ///
    /// The outcome arrives as a [`UnitEvent::StageFinished`] event.
    pub fn run_stage(&self, vuser_id: VuserId, args: StageArgs) -> Result<()> {
        let units = self.transition(
            vuser_id,
            "run stage",
            VuserState::Running {
                stage: Some(args.stage),
            },
        )?;

        trace!(vuser_id, stage = %args.stage, "Dispatching stage");
        units.executor.run_stage(args)
    }

    /// Terminate both units of a vuser
    ///
    /// Stopping a stopped vuser is a no-op.
    pub async fn stop(&self, vuser_id: VuserId) -> Result<()> {
        let units = {
            let mut slot = self
                .vusers
                .get_mut(&vuser_id)
                .ok_or(EngineError::UnknownVuser(vuser_id))?;

            if slot.state == VuserState::Stopped {
                debug!(vuser_id, "Vuser already stopped");
                return Ok(());
            }
            slot.state = VuserState::Stopped;
            slot.units.take()
        };

        if let Some(units) = units {
            self.terminate(vuser_id, &units).await;
        }

        self.update_gauge();
        info!(vuser_id, "Vuser stopped");
        Ok(())
    }

    /// Initialize a vuser and load its script, stopping it again if loading fails
    pub async fn run_vuser(&self, config: VuserConfig) -> Result<VuserId> {
        let vuser_id = self.init_vuser(&config).await?;

        if let Err(err) = self.run(vuser_id, config).await {
            if let Err(stop_err) = self.stop(vuser_id).await {
                warn!(vuser_id, "Failed to stop vuser after run error: {}", stop_err);
            }
            return Err(err);
        }
        Ok(vuser_id)
    }

    /// Stop every active vuser
    pub async fn stop_all(&self) {
        let stops = self.active_vusers().into_iter().map(|vuser_id| async move {
            if let Err(err) = self.stop(vuser_id).await {
                warn!(vuser_id, "Failed to stop vuser: {}", err);
            }
        });
        futures::future::join_all(stops).await;
    }

    /// Current state of a vuser; unknown ids are uninitialized
    pub fn state(&self, vuser_id: VuserId) -> VuserState {
        self.vusers
            .get(&vuser_id)
            .map(|slot| slot.state)
            .unwrap_or(VuserState::Uninitialized)
    }

    /// Ids of vusers that hold a live unit pair, ascending
    pub fn active_vusers(&self) -> Vec<VuserId> {
        let mut ids: Vec<VuserId> = self
            .vusers
            .iter()
            .filter(|slot| slot.state.is_active())
            .map(|slot| *slot.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Receive every unit event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<VuserEvent> {
        self.broadcast.subscribe()
    }

    fn claim(&self, vuser_id: VuserId) -> Result<()> {
        match self.vusers.entry(vuser_id) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                if !slot.state.can_transition_to(&VuserState::Initializing) {
                    return Err(EngineError::VuserExists(vuser_id));
                }
                slot.state = VuserState::Initializing;
                slot.units = None;
            }
            Entry::Vacant(entry) => {
                entry.insert(VuserSlot {
                    state: VuserState::Initializing,
                    units: None,
                });
            }
        }
        Ok(())
    }

    fn transition(
        &self,
        vuser_id: VuserId,
        operation: &'static str,
        next: VuserState,
    ) -> Result<Arc<UnitPair>> {
        let mut slot = self
            .vusers
            .get_mut(&vuser_id)
            .ok_or(EngineError::UnknownVuser(vuser_id))?;

        let invalid = |state: VuserState| EngineError::InvalidState {
            vuser_id,
            operation,
            state: state.to_string(),
        };

        if !slot.state.can_transition_to(&next) {
            return Err(invalid(slot.state));
        }
        let units = slot.units.clone().ok_or_else(|| invalid(slot.state))?;

        slot.state = next;
        Ok(units)
    }

    async fn start_units(&self, vuser_id: VuserId) -> Result<UnitPair> {
        let (exec_link, comm_link) = inter_unit_link();
        let (requester, responder) = handoff::channel(self.runtime.handoff_buffer_size)?;
        let events = UnitEvents::new(vuser_id, self.events.clone());
        let timeout = self.runtime.init_timeout();

        let (communicator, executor) = tokio::join!(
            Communicator::start(
                vuser_id,
                self.backend.clone(),
                comm_link,
                responder,
                events.clone(),
                timeout,
            ),
            Executor::start(
                vuser_id,
                Arc::clone(&self.loader),
                exec_link,
                requester,
                events,
                timeout,
            ),
        );

        match (communicator, executor) {
            (Ok(communicator), Ok(executor)) => Ok(UnitPair {
                communicator,
                executor,
            }),
            (Ok(communicator), Err(err)) => {
                communicator.close_channel();
                communicator.shutdown();
                self.join_units(vuser_id, communicator.take_thread().into_iter().collect())
                    .await;
                Err(err)
            }
            (Err(err), Ok(executor)) => {
                executor.shutdown();
                self.join_units(vuser_id, executor.take_thread().into_iter().collect())
                    .await;
                Err(err)
            }
            (Err(err), Err(_)) => Err(err),
        }
    }

    async fn terminate(&self, vuser_id: VuserId, units: &UnitPair) {
        if units.communicator.is_terminated() {
            debug!(vuser_id, "Communication unit already exited");
        }

        // Wake a unit parked in the handoff protocol before asking it to exit.
        units.communicator.close_channel();
        units.executor.shutdown();
        units.communicator.shutdown();

        let threads = [units.executor.take_thread(), units.communicator.take_thread()]
            .into_iter()
            .flatten()
            .collect();
        self.join_units(vuser_id, threads).await;
    }

    async fn join_units(&self, vuser_id: VuserId, threads: Vec<thread::JoinHandle<()>>) {
        if threads.is_empty() {
            return;
        }

        let joined = tokio::task::spawn_blocking(move || {
            threads
                .into_iter()
                .map(thread::JoinHandle::join)
                .filter(std::result::Result::is_err)
                .count()
        });

        match tokio::time::timeout(self.runtime.stop_timeout(), joined).await {
            Ok(Ok(0)) => trace!(vuser_id, "Unit threads joined"),
            Ok(Ok(panicked)) => warn!(vuser_id, panicked, "Unit threads panicked"),
            Ok(Err(e)) => warn!(vuser_id, "Failed to join unit threads: {}", e),
            Err(_) => warn!(
                vuser_id,
                "Unit threads did not exit within {}ms, detaching", self.runtime.stop_timeout_ms
            ),
        }
    }

    fn update_gauge(&self) {
        metrics::gauge!(names::ACTIVE_VUSERS).set(self.active_vusers().len() as f64);
    }
}

impl Drop for VuserManager {
    fn drop(&mut self) {
        for slot in self.vusers.iter() {
            if let Some(units) = &slot.units {
                units.communicator.close_channel();
                units.executor.shutdown();
                units.communicator.shutdown();
            }
        }
        self.pump.abort();
    }
}

/// Re-emit unit events through `tracing` and fan them out
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<VuserEvent>,
    broadcast: broadcast::Sender<VuserEvent>,
) {
    while let Some(event) = events.recv().await {
        trace_event(&event);
        // No subscribers is fine.
        let _ = broadcast.send(event);
    }
}

fn trace_event(event: &VuserEvent) {
    let vuser_id = event.vuser_id;

    match &event.event {
        UnitEvent::Log(record) => match record.level {
            LogLevel::Trace => trace!(vuser_id, "{}", record.message),
            LogLevel::Debug => debug!(vuser_id, "{}", record.message),
            LogLevel::Info => info!(vuser_id, "{}", record.message),
            LogLevel::Warning => warn!(vuser_id, "{}", record.message),
            LogLevel::Error => error!(vuser_id, code = ?record.code, "{}", record.message),
        },
        UnitEvent::StageFinished { stage, result } => {
            debug!(vuser_id, %stage, ?result, "Stage finished")
        }
        UnitEvent::Crashed(report) => error!(vuser_id, "Vuser crashed: {}", report),
        UnitEvent::ConnectionLost(reason) => {
            warn!(vuser_id, "Backend connection lost: {}", reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{FlowRegistry, ScriptError, StageResult};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    struct CountingScript;

    impl ScriptLoader for CountingScript {
        fn load(
            &self,
            config: &VuserConfig,
            flows: &mut FlowRegistry,
        ) -> std::result::Result<(), ScriptError> {
            if config.script_name == "broken" {
                return Err(ScriptError::crash("syntax error"));
            }
            flows.action("count", |ctx| async move {
                ctx.log(LogLevel::Info, format!("iteration {}", ctx.iteration()));
                Ok(())
            });
            Ok(())
        }
    }

    /// Accept any number of connections and never reply
    async fn silent_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut sink = [0u8; 1024];
                    while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                });
            }
        });
        port
    }

    fn config(port: u16) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.backend.port = port;
        config.backend.connect_timeout_ms = 500;
        config.runtime.init_timeout_ms = 2000;
        config.runtime.stop_timeout_ms = 2000;
        config
    }

    async fn next_stage_finished(
        events: &mut broadcast::Receiver<VuserEvent>,
    ) -> (VuserId, Stage, StageResult) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let UnitEvent::StageFinished { stage, result } = event.event {
                return (event.vuser_id, stage, result);
            }
        }
    }

    #[test]
    fn test_state_transitions() {
        use VuserState::*;

        assert!(Uninitialized.can_transition_to(&Initializing));
        assert!(Stopped.can_transition_to(&Initializing));
        assert!(Initializing.can_transition_to(&Ready));
        assert!(Ready.can_transition_to(&Running { stage: None }));
        assert!(Running { stage: None }.can_transition_to(&Running {
            stage: Some(Stage::Action)
        }));
        assert!(Ready.can_transition_to(&Stopped));

        assert!(!Ready.can_transition_to(&Initializing));
        assert!(!Ready.can_transition_to(&Running {
            stage: Some(Stage::Action)
        }));
        assert!(!Running { stage: None }.can_transition_to(&Running { stage: None }));
        assert!(!Initializing.can_transition_to(&Running { stage: None }));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(VuserState::Ready.to_string(), "ready");
        assert_eq!(
            VuserState::Running {
                stage: Some(Stage::Finalize)
            }
            .to_string(),
            "running(finalize)"
        );
    }

    #[tokio::test]
    async fn test_unknown_vuser_is_reported() {
        let manager = VuserManager::new(&config(1), Arc::new(CountingScript));

        assert!(matches!(
            manager.stop(42).await,
            Err(EngineError::UnknownVuser(42))
        ));
        assert!(matches!(
            manager.run_stage(42, StageArgs::all(Stage::Action)),
            Err(EngineError::UnknownVuser(42))
        ));
        assert!(matches!(
            manager.run(42, VuserConfig::new(42, "script")).await,
            Err(EngineError::UnknownVuser(42))
        ));
        assert_eq!(manager.state(42), VuserState::Uninitialized);
    }

    #[tokio::test]
    async fn test_failed_init_leaves_no_vuser() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let manager = VuserManager::new(&config(port), Arc::new(CountingScript));
        let result = manager.init_vuser(&VuserConfig::new(1, "script")).await;

        assert!(matches!(result, Err(EngineError::ConnectionFailed(_))));
        assert_eq!(manager.state(1), VuserState::Uninitialized);
        assert!(manager.active_vusers().is_empty());
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let port = silent_backend().await;
        let manager = VuserManager::new(&config(port), Arc::new(CountingScript));
        let mut events = manager.subscribe();
        let script = VuserConfig::new(3, "counting");

        manager.init_vuser(&script).await.unwrap();
        assert_eq!(manager.state(3), VuserState::Ready);
        assert!(matches!(
            manager.init_vuser(&script).await,
            Err(EngineError::VuserExists(3))
        ));
        assert!(matches!(
            manager.run_stage(3, StageArgs::all(Stage::Action)),
            Err(EngineError::InvalidState { .. })
        ));

        manager.run(3, script.clone()).await.unwrap();
        assert_eq!(manager.state(3), VuserState::Running { stage: None });

        manager.run_stage(3, StageArgs::all(Stage::Action)).unwrap();
        assert_eq!(
            manager.state(3),
            VuserState::Running {
                stage: Some(Stage::Action)
            }
        );
        assert_eq!(
            next_stage_finished(&mut events).await,
            (3, Stage::Action, StageResult::Success)
        );
        assert_eq!(manager.active_vusers(), vec![3]);

        manager.stop(3).await.unwrap();
        assert_eq!(manager.state(3), VuserState::Stopped);
        manager.stop(3).await.unwrap();
        assert!(manager.active_vusers().is_empty());

        // A stopped id can be brought back
        manager.init_vuser(&script).await.unwrap();
        assert_eq!(manager.state(3), VuserState::Ready);
        manager.stop_all().await;
        assert_eq!(manager.state(3), VuserState::Stopped);
    }

    #[tokio::test]
    async fn test_run_vuser_stops_on_load_failure() {
        let port = silent_backend().await;
        let manager = VuserManager::new(&config(port), Arc::new(CountingScript));

        let result = manager.run_vuser(VuserConfig::new(8, "broken")).await;
        assert!(matches!(result, Err(EngineError::ScriptFailed(_))));
        assert_eq!(manager.state(8), VuserState::Stopped);
    }

    #[tokio::test]
    async fn test_vusers_are_isolated() {
        let port = silent_backend().await;
        let manager = VuserManager::new(&config(port), Arc::new(CountingScript));
        let mut events = manager.subscribe();

        for id in [10, 11] {
            manager
                .run_vuser(VuserConfig::new(id, "counting"))
                .await
                .unwrap();
        }
        manager.run_stage(11, StageArgs::all(Stage::Action)).unwrap();

        let (vuser_id, stage, result) = next_stage_finished(&mut events).await;
        assert_eq!((vuser_id, stage, result), (11, Stage::Action, StageResult::Success));
        assert_eq!(
            manager.state(10),
            VuserState::Running { stage: None }
        );

        manager.stop_all().await;
        assert!(manager.active_vusers().is_empty());
    }
}
