// src/runtime/execution_unit.rs
//! Execution unit: the thread that runs one vuser's script
//!
//! The thread owns a current-thread Tokio runtime and a `LocalSet`, so the
//! context, its timers and its sockets stay `!Send`. The command loop keeps
//! routing deliveries while a stage runs as a local task; a stage only
//! stops the loop while it is blocked inside `send_sync`.

use crate::protocol::message_types;
use crate::runtime::context::ExecutionContext;
use crate::runtime::events::{LogLevel, UnitEvent, UnitEvents};
use crate::runtime::handoff::Requester;
use crate::runtime::link::{ExecutionLink, ExecutorCommand, VuserId};
use crate::script::{
    ExitType, FlowRegistry, ScriptError, ScriptLoader, Stage, StageArgs, StageResult, VuserConfig,
};
use crate::utils::errors::{EngineError, ErrorCode, ErrorReport, Result};
use futures::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, LocalSet};
use tracing::{debug, error, trace, warn};

/// Everything an execution unit thread starts with
pub struct ExecutionUnit {
    pub vuser_id: VuserId,
    pub loader: Arc<dyn ScriptLoader>,
    pub link: ExecutionLink,
    pub requester: Requester,
    pub events: UnitEvents,
    pub commands: mpsc::UnboundedReceiver<ExecutorCommand>,
}

impl ExecutionUnit {
    /// Start the unit on its own thread
    ///
    /// `ready` is answered once the thread's runtime is up.
    pub fn spawn(self, ready: oneshot::Sender<Result<()>>) -> Result<thread::JoinHandle<()>> {
        let name = format!("vuser-{}-exec", self.vuser_id);

        let handle = thread::Builder::new().name(name).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready.send(Err(EngineError::InitFailed(format!(
                        "execution runtime: {}",
                        e
                    ))));
                    return;
                }
            };

            let local = LocalSet::new();
            local.block_on(&runtime, self.run(ready));
        })?;

        Ok(handle)
    }

    async fn run(self, ready: oneshot::Sender<Result<()>>) {
        let ExecutionUnit {
            vuser_id,
            loader,
            link,
            requester,
            events,
            mut commands,
        } = self;
        let ExecutionLink {
            requests,
            mut deliveries,
        } = link;

        let ctx = Rc::new(ExecutionContext::new(
            vuser_id,
            requests,
            requester,
            events.clone(),
        ));
        let mut flows: Option<Rc<FlowRegistry>> = None;
        let mut stage_task: Option<JoinHandle<()>> = None;
        let mut dispatched: Option<Stage> = None;
        let mut link_open = true;

        let _ = ready.send(Ok(()));
        debug!(vuser_id, "Execution unit started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ExecutorCommand::Run { config, reply }) => {
                        let loaded = load_script(loader.as_ref(), &config, &events);
                        let result = loaded.map(|registry| {
                            flows = Some(Rc::new(registry));
                        });
                        let _ = reply.send(result);
                    }
                    Some(ExecutorCommand::Stage(args)) => {
                        let Some(registry) = flows.clone() else {
                            events.log_with_code(
                                LogLevel::Error,
                                ErrorCode::SdkLogic,
                                format!("Vuser cannot run {} before its script is loaded", args.stage),
                            );
                            events.emit(UnitEvent::StageFinished {
                                stage: args.stage,
                                result: StageResult::Failure,
                            });
                            continue;
                        };

                        // Stages run one after another, in dispatch order.
                        dispatched = Some(args.stage);
                        let previous = stage_task.take();
                        let ctx = Rc::clone(&ctx);
                        stage_task = Some(tokio::task::spawn_local(async move {
                            if let Some(previous) = previous {
                                let _ = previous.await;
                            }
                            run_stage(ctx, registry, args).await;
                        }));
                    }
                    Some(ExecutorCommand::Shutdown) | None => break,
                },
                delivery = deliveries.recv(), if link_open => match delivery {
                    Some(delivery) => {
                        let handled =
                            panic::catch_unwind(AssertUnwindSafe(|| ctx.deliver(delivery)));
                        if let Err(payload) = handled {
                            let running = stage_task.take().filter(|task| !task.is_finished());
                            handler_panicked(&ctx, running, dispatched, payload.as_ref());
                        }
                    }
                    None => {
                        link_open = false;
                        let canceled = ctx.clear_response_pending_messages();
                        warn!(vuser_id, canceled, "Communication link closed");
                    }
                },
            }
        }

        if let Some(task) = stage_task.take() {
            task.abort();
        }
        ctx.clear_all();
        debug!(vuser_id, "Execution unit stopped");
    }
}

/// Run the loader against a fresh registry
fn load_script(
    loader: &dyn ScriptLoader,
    config: &VuserConfig,
    events: &UnitEvents,
) -> Result<FlowRegistry> {
    let mut registry = FlowRegistry::new();

    let loaded = panic::catch_unwind(AssertUnwindSafe(|| loader.load(config, &mut registry)))
        .unwrap_or_else(|payload| Err(ScriptError::Crash(panic_message(payload.as_ref()))));

    match loaded {
        Ok(()) => {
            trace!(vuser_id = config.vuser_id, "Script {} loaded", config.script_name);
            Ok(registry)
        }
        Err(err) => {
            events.log_with_code(
                LogLevel::Error,
                ErrorCode::Script,
                format!("Vuser \"{}\" thrown while loading {}", err, config.script_name),
            );
            Err(EngineError::ScriptFailed(err.to_string()))
        }
    }
}

/// Run one stage cycle and report its outcome
pub(crate) async fn run_stage(ctx: Rc<ExecutionContext>, flows: Rc<FlowRegistry>, args: StageArgs) {
    let stage = args.stage;
    if stage == Stage::Action {
        ctx.begin_iteration();
    }
    announce(&ctx, message_types::CYCLE_START, json!({ "stage": stage }));

    let result = match run_steps(&ctx, &flows, &args).await {
        Ok(()) => StageResult::Success,
        Err(err) if err.is_expected() => {
            report_known_error(&ctx, stage, &err);
            StageResult::Failure
        }
        Err(err) => {
            crash(&ctx, stage, &err);
            ctx.events().emit(UnitEvent::StageFinished {
                stage,
                result: StageResult::Failure,
            });
            return;
        }
    };

    ctx.clear_all();
    announce(
        &ctx,
        message_types::CYCLE_END,
        json!({ "stage": stage, "result": result }),
    );
    ctx.events().emit(UnitEvent::StageFinished { stage, result });
}

async fn run_steps(
    ctx: &Rc<ExecutionContext>,
    flows: &FlowRegistry,
    args: &StageArgs,
) -> std::result::Result<(), ScriptError> {
    for (name, step) in flows.resolve(args)? {
        trace!(vuser_id = ctx.vuser_id(), stage = %args.stage, "Running step {}", name);

        match AssertUnwindSafe((*step)(Rc::clone(ctx))).catch_unwind().await {
            Ok(result) => result?,
            Err(payload) => {
                return Err(ScriptError::Crash(format!(
                    "step '{}' panicked: {}",
                    name,
                    panic_message(payload.as_ref())
                )))
            }
        }
    }
    Ok(())
}

fn report_known_error(ctx: &ExecutionContext, stage: Stage, err: &ScriptError) {
    let events = ctx.events();
    match err {
        ScriptError::Abort {
            exit_type: ExitType::Abort,
            ..
        } => {}
        ScriptError::Abort { message, .. } => events.warning(message.clone()),
        ScriptError::Canceled(message) => events.trace(message.clone()),
        ScriptError::Load {
            error_type,
            message,
            ..
        } => events.log_with_code(
            LogLevel::Error,
            err.code(),
            format!(
                "Vuser {} was stopped after receiving {} error: '{}'.",
                stage, error_type, message
            ),
        ),
        ScriptError::InvalidFlow(_) | ScriptError::Crash(_) => {}
    }
}

/// Unexpected failure: clear every continuation before reporting
fn crash(ctx: &ExecutionContext, stage: Stage, err: &ScriptError) {
    ctx.clear_all();

    let message = format!(
        "Vuser {} was stopped after receiving runtime error '{}'",
        stage, err
    );
    error!(vuser_id = ctx.vuser_id(), "{}", message);
    ctx.events()
        .log_with_code(LogLevel::Error, ErrorCode::Crash, message.clone());

    announce(
        ctx,
        message_types::CRASH,
        json!({
            "stage": stage,
            "result": StageResult::Failure,
            "code": ErrorCode::Crash.value(),
        }),
    );
    ctx.events()
        .emit(UnitEvent::Crashed(ErrorReport::new(ErrorCode::Crash, message)));
}

/// A socket handler or reply callback panicked on the unit's loop
///
/// The stage still running, if any, is aborted and reported as failed.
fn handler_panicked(
    ctx: &ExecutionContext,
    running: Option<JoinHandle<()>>,
    stage: Option<Stage>,
    payload: &(dyn Any + Send),
) {
    let err = ScriptError::Crash(format!("handler panicked: {}", panic_message(payload)));
    let Some(stage) = stage else {
        ctx.clear_all();
        error!(vuser_id = ctx.vuser_id(), "{}", err);
        return;
    };

    if let Some(task) = &running {
        task.abort();
    }
    crash(ctx, stage, &err);
    if running.is_some() {
        ctx.events().emit(UnitEvent::StageFinished {
            stage,
            result: StageResult::Failure,
        });
    }
}

/// Fire-and-forget notification to the backend
fn announce(ctx: &ExecutionContext, message_type: &str, content: Value) {
    if let Err(err) = ctx.send_message_no_response(message_type, content) {
        warn!(
            vuser_id = ctx.vuser_id(),
            "Failed to send {}: {}", message_type, err
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::events::VuserEvent;
    use crate::runtime::handoff;
    use crate::runtime::link::{inter_unit_link, CommunicationLink, Delivery, RequestKind};
    use std::cell::Cell;

    struct Fixture {
        ctx: Rc<ExecutionContext>,
        comm: CommunicationLink,
        events: mpsc::UnboundedReceiver<VuserEvent>,
        _responder: handoff::Responder,
    }

    fn fixture() -> Fixture {
        let (exec, comm) = inter_unit_link();
        let (requester, responder) = handoff::channel(32).unwrap();
        let (tx, events) = mpsc::unbounded_channel();
        let ctx = Rc::new(ExecutionContext::new(
            4,
            exec.requests,
            requester,
            UnitEvents::new(4, tx),
        ));
        Fixture {
            ctx,
            comm,
            events,
            _responder: responder,
        }
    }

    fn sent_types(comm: &mut CommunicationLink) -> Vec<String> {
        let mut types = Vec::new();
        while let Ok(request) = comm.requests.try_recv() {
            assert_eq!(request.kind, RequestKind::SendSyncNoWait);
            let value: Value = serde_json::from_str(request.payload.trim_end()).unwrap();
            types.push(value["messageType"].as_str().unwrap().to_string());
        }
        types
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<VuserEvent>) -> Vec<UnitEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event.event);
        }
        out
    }

    #[tokio::test]
    async fn test_action_stage_success() {
        let mut f = fixture();
        let runs = Rc::new(Cell::new(0));
        let mut flows = FlowRegistry::new();
        let counter = Rc::clone(&runs);
        flows.action("browse", move |_ctx| {
            let counter = Rc::clone(&counter);
            async move {
                counter.set(counter.get() + 1);
                Ok(())
            }
        });
        let flows = Rc::new(flows);

        run_stage(Rc::clone(&f.ctx), Rc::clone(&flows), StageArgs::all(Stage::Action)).await;
        run_stage(Rc::clone(&f.ctx), flows, StageArgs::all(Stage::Action)).await;

        assert_eq!(runs.get(), 2);
        assert_eq!(f.ctx.iteration(), 2);
        assert_eq!(
            sent_types(&mut f.comm),
            vec![
                message_types::CYCLE_START,
                message_types::CYCLE_END,
                message_types::CYCLE_START,
                message_types::CYCLE_END
            ]
        );
        let events = drain(&mut f.events);
        assert!(events.contains(&UnitEvent::StageFinished {
            stage: Stage::Action,
            result: StageResult::Success
        }));
    }

    #[tokio::test]
    async fn test_expected_error_fails_stage_without_crash() {
        let mut f = fixture();
        let mut flows = FlowRegistry::new();
        flows.initialize("login", |_ctx| async {
            Err(ScriptError::Load {
                error_type: "WebRequest".into(),
                message: "refused".into(),
                code: ErrorCode::Socket.value() as i64,
            })
        });

        run_stage(Rc::clone(&f.ctx), Rc::new(flows), StageArgs::all(Stage::Initialize)).await;

        assert_eq!(
            sent_types(&mut f.comm),
            vec![message_types::CYCLE_START, message_types::CYCLE_END]
        );
        let events = drain(&mut f.events);
        assert!(!events.iter().any(|e| matches!(e, UnitEvent::Crashed(_))));
        assert!(events.iter().any(|e| matches!(
            e,
            UnitEvent::Log(record) if record.code == Some(ErrorCode::Socket)
        )));
        assert_eq!(
            events.last(),
            Some(&UnitEvent::StageFinished {
                stage: Stage::Initialize,
                result: StageResult::Failure
            })
        );
    }

    #[tokio::test]
    async fn test_crash_clears_state_before_reporting() {
        let mut f = fixture();
        let canceled = Rc::new(Cell::new(0));
        let mut flows = FlowRegistry::new();
        let counter = Rc::clone(&canceled);
        flows.action("boom", move |ctx| {
            let counter = Rc::clone(&counter);
            async move {
                for id in 100..103 {
                    let counter = Rc::clone(&counter);
                    ctx.send(id, "req", move |result| {
                        if result.is_err() {
                            counter.set(counter.get() + 1);
                        }
                    })?;
                }
                ctx.sockets().register_socket("ws-1", |_| {});
                ctx.sockets().register_socket("ws-2", |_| {});
                Err(ScriptError::crash("unexpected null"))
            }
        });

        run_stage(Rc::clone(&f.ctx), Rc::new(flows), StageArgs::all(Stage::Action)).await;

        assert_eq!(canceled.get(), 3);
        assert!(f.ctx.sockets().is_empty());
        assert_eq!(f.ctx.pending_callbacks(), 0);

        // Late reply after the crash reaches nobody
        f.ctx.deliver(Delivery::Reply {
            message_id: 101,
            content: "{}".into(),
        });
        assert_eq!(canceled.get(), 3);

        let mut types = Vec::new();
        while let Ok(request) = f.comm.requests.try_recv() {
            if request.kind == RequestKind::SendSyncNoWait {
                let value: Value = serde_json::from_str(request.payload.trim_end()).unwrap();
                types.push(value["messageType"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(types, vec![message_types::CYCLE_START, message_types::CRASH]);

        let events = drain(&mut f.events);
        assert!(events.iter().any(|e| matches!(e, UnitEvent::Crashed(report) if report.code == ErrorCode::Crash)));
    }

    #[tokio::test]
    async fn test_panicking_step_is_a_crash() {
        let mut f = fixture();
        let mut flows = FlowRegistry::new();
        flows.finalize("explode", |_ctx| async {
            if true {
                panic!("kaboom");
            }
            Ok(())
        });

        run_stage(Rc::clone(&f.ctx), Rc::new(flows), StageArgs::all(Stage::Finalize)).await;

        let events = drain(&mut f.events);
        let crashed = events.iter().find_map(|e| match e {
            UnitEvent::Crashed(report) => Some(report.message.clone()),
            _ => None,
        });
        assert!(crashed.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_handler_panic_between_stages_reports_crash_only() {
        let mut f = fixture();
        f.ctx.sockets().register_socket("ws-1", |_| {});
        let payload: Box<dyn Any + Send> = Box::new("bad frame");

        handler_panicked(&f.ctx, None, Some(Stage::Action), payload.as_ref());

        assert!(f.ctx.sockets().is_empty());
        let events = drain(&mut f.events);
        assert!(events.iter().any(|e| matches!(
            e,
            UnitEvent::Crashed(report) if report.message.contains("bad frame")
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, UnitEvent::StageFinished { .. })));
    }

    #[tokio::test]
    async fn test_unknown_flow_name_crashes_stage() {
        let mut f = fixture();
        let mut flows = FlowRegistry::new();
        flows.action("browse", |_ctx| async { Ok(()) });

        run_stage(
            Rc::clone(&f.ctx),
            Rc::new(flows),
            StageArgs::flow(Stage::Action, ["missing"]),
        )
        .await;

        let events = drain(&mut f.events);
        assert!(events.iter().any(|e| matches!(e, UnitEvent::Crashed(_))));
        assert_eq!(
            events.last(),
            Some(&UnitEvent::StageFinished {
                stage: Stage::Action,
                result: StageResult::Failure
            })
        );
    }

    #[tokio::test]
    async fn test_abort_exit_is_silent() {
        let mut f = fixture();
        let mut flows = FlowRegistry::new();
        flows.action("leave", |_ctx| async { Err(ScriptError::abort("done")) });

        run_stage(Rc::clone(&f.ctx), Rc::new(flows), StageArgs::all(Stage::Action)).await;

        let events = drain(&mut f.events);
        assert!(!events.iter().any(|e| matches!(e, UnitEvent::Log(_))));
        assert_eq!(
            events.last(),
            Some(&UnitEvent::StageFinished {
                stage: Stage::Action,
                result: StageResult::Failure
            })
        );
    }

    struct FailingLoader;

    impl ScriptLoader for FailingLoader {
        fn load(&self, _config: &VuserConfig, _flows: &mut FlowRegistry) -> std::result::Result<(), ScriptError> {
            Err(ScriptError::crash("syntax error"))
        }
    }

    struct PanickingLoader;

    impl ScriptLoader for PanickingLoader {
        fn load(&self, _config: &VuserConfig, _flows: &mut FlowRegistry) -> std::result::Result<(), ScriptError> {
            panic!("loader bug");
        }
    }

    #[test]
    fn test_load_script_failures_are_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = UnitEvents::new(1, tx);
        let config = VuserConfig::new(1, "main");

        assert!(matches!(
            load_script(&FailingLoader, &config, &events),
            Err(EngineError::ScriptFailed(_))
        ));
        match load_script(&PanickingLoader, &config, &events) {
            Err(EngineError::ScriptFailed(message)) => assert!(message.contains("loader bug")),
            _ => panic!("expected a script failure"),
        }

        let first = rx.try_recv().unwrap();
        assert!(matches!(
            first.event,
            UnitEvent::Log(ref record) if record.code == Some(ErrorCode::Script)
        ));
    }
}
