// tests/vuser_engine.rs
//! End-to-end tests: the manager drives real unit threads against an
//! in-process backend speaking the line protocol.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use vuser_engine::runtime::events::{LogLevel, UnitEvent, VuserEvent};
use vuser_engine::runtime::link::VuserId;
use vuser_engine::script::StageResult;
use vuser_engine::utils::errors::ErrorCode;
use vuser_engine::{
    EngineConfig, EngineError, FlowRegistry, ScriptError, ScriptLoader, Stage, StageArgs,
    VuserConfig, VuserManager, VuserState,
};

const BUFFER_SIZE: usize = 64;

fn long_pong() -> String {
    format!("PONG-and-some-long-tail-exceeding-one-buffer{}", ".".repeat(1000))
}

/// Backend answering by message type
async fn fake_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream));
        }
    });
    port
}

async fn serve(stream: TcpStream) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let request: Value = serde_json::from_str(&line).unwrap();
        let id = request["messageId"].clone();

        let reply = match request["messageType"].as_str().unwrap_or_default() {
            "Probe.Ping" => json!({
                "messageId": id,
                "messageType": "Probe.Pong",
                "content": { "text": long_pong() },
            }),
            "Probe.Fail" => json!({
                "messageId": id,
                "messageType": "Error.Probe",
                "content": { "content": "backend refused", "errorCode": ErrorCode::Socket.value() },
            }),
            "Probe.Subscribe" => json!({
                "messageId": -1,
                "socketId": "7",
                "content": "tick",
            }),
            "Probe.Hangup" => return,
            // Cycle announcements expect no reply
            _ => continue,
        };

        let mut reply = reply.to_string();
        reply.push('\n');
        if writer.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

struct ProbeScript;

impl ScriptLoader for ProbeScript {
    fn load(
        &self,
        _config: &VuserConfig,
        flows: &mut FlowRegistry,
    ) -> Result<(), ScriptError> {
        flows
            .action("long_ping", |ctx| async move {
                let reply = ctx.send_message_sync("Probe.Ping", json!({ "payload": "PING" }))?;
                ctx.log(LogLevel::Info, reply["text"].as_str().unwrap_or_default());
                Ok(())
            })
            .action("async_ping", |ctx| async move {
                let reply = ctx.send_message("Probe.Ping", json!({})).await?;
                let text = reply["text"].as_str().unwrap_or_default();
                ctx.log(LogLevel::Info, format!("async {}", text.len()));
                Ok(())
            })
            .action("fail", |ctx| async move {
                ctx.send_message_sync("Probe.Fail", json!({}))?;
                Ok(())
            })
            .action("push", |ctx| async move {
                let sockets = ctx.sockets().clone();
                let events = ctx.events().clone();
                ctx.sockets().register_socket("7", move |frame| {
                    events.info(format!("push {}", frame["content"]));
                    let _ = sockets.break_socket_barrier("7", None);
                });

                let wake = ctx
                    .sockets()
                    .new_socket_barrier("7", Some(Duration::from_secs(5)));
                ctx.send_message_no_response("Probe.Subscribe", json!({}))?;
                wake.await?;
                Ok(())
            })
            .action("panicking_push", |ctx| async move {
                ctx.sockets()
                    .register_socket("7", |_frame| panic!("handler blew up"));

                let wake = ctx
                    .sockets()
                    .new_socket_barrier("7", Some(Duration::from_secs(5)));
                ctx.send_message_no_response("Probe.Subscribe", json!({}))?;
                wake.await?;
                Ok(())
            })
            .action("hangup", |ctx| async move {
                ctx.send_message_no_response("Probe.Hangup", json!({}))?;
                tokio::time::sleep(Duration::from_millis(100)).await;
                ctx.send_message_sync("Probe.Ping", json!({}))?;
                Ok(())
            });
        Ok(())
    }
}

fn config(port: u16) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.backend.port = port;
    config.backend.connect_timeout_ms = 1000;
    config.runtime.handoff_buffer_size = BUFFER_SIZE;
    config.runtime.init_timeout_ms = 3000;
    config.runtime.stop_timeout_ms = 3000;
    config
}

async fn start_manager() -> VuserManager {
    let port = fake_backend().await;
    VuserManager::new(&config(port), Arc::new(ProbeScript))
}

/// Events of `vuser_id` up to and including its next `StageFinished`
async fn run_flow(
    manager: &VuserManager,
    events: &mut broadcast::Receiver<VuserEvent>,
    vuser_id: VuserId,
    step: &str,
) -> (StageResult, Vec<UnitEvent>) {
    manager
        .run_stage(vuser_id, StageArgs::flow(Stage::Action, [step]))
        .unwrap();

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("stage did not finish")
            .unwrap();
        if event.vuser_id != vuser_id {
            continue;
        }
        if let UnitEvent::StageFinished { result, .. } = event.event {
            return (result, seen);
        }
        seen.push(event.event);
    }
}

fn info_messages(events: &[UnitEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            UnitEvent::Log(record) if record.level == LogLevel::Info => {
                Some(record.message.clone())
            }
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_reply_longer_than_buffer_arrives_whole() {
    let manager = start_manager().await;
    let mut events = manager.subscribe();
    manager.run_vuser(VuserConfig::new(1, "probe")).await.unwrap();

    let (result, seen) = run_flow(&manager, &mut events, 1, "long_ping").await;
    assert_eq!(result, StageResult::Success);
    assert!(long_pong().len() > BUFFER_SIZE);
    assert_eq!(info_messages(&seen), vec![long_pong()]);

    manager.stop(1).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_reply_resolves_pending_call() {
    let manager = start_manager().await;
    let mut events = manager.subscribe();
    manager.run_vuser(VuserConfig::new(2, "probe")).await.unwrap();

    let (result, seen) = run_flow(&manager, &mut events, 2, "async_ping").await;
    assert_eq!(result, StageResult::Success);
    assert_eq!(
        info_messages(&seen),
        vec![format!("async {}", long_pong().len())]
    );

    manager.stop(2).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_reply_fails_stage_with_its_code() {
    let manager = start_manager().await;
    let mut events = manager.subscribe();
    manager.run_vuser(VuserConfig::new(3, "probe")).await.unwrap();

    let (result, seen) = run_flow(&manager, &mut events, 3, "fail").await;
    assert_eq!(result, StageResult::Failure);

    let record = seen
        .iter()
        .find_map(|event| match event {
            UnitEvent::Log(record) if record.level == LogLevel::Error => Some(record.clone()),
            _ => None,
        })
        .expect("error log");
    assert_eq!(record.code, Some(ErrorCode::Socket));
    assert!(record.message.contains("backend refused"));

    // The vuser stays usable after an expected failure
    let (result, _) = run_flow(&manager, &mut events, 3, "long_ping").await;
    assert_eq!(result, StageResult::Success);

    manager.stop(3).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_frame_reaches_socket_handler() {
    let manager = start_manager().await;
    let mut events = manager.subscribe();
    manager.run_vuser(VuserConfig::new(4, "probe")).await.unwrap();

    let (result, seen) = run_flow(&manager, &mut events, 4, "push").await;
    assert_eq!(result, StageResult::Success);
    assert_eq!(info_messages(&seen), vec!["push \"tick\"".to_string()]);

    manager.stop(4).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_socket_handler_crashes_the_stage() {
    let manager = start_manager().await;
    let mut events = manager.subscribe();
    manager.run_vuser(VuserConfig::new(8, "probe")).await.unwrap();

    let (result, seen) = run_flow(&manager, &mut events, 8, "panicking_push").await;
    assert_eq!(result, StageResult::Failure);

    let report = seen
        .iter()
        .find_map(|event| match event {
            UnitEvent::Crashed(report) => Some(report.clone()),
            _ => None,
        })
        .expect("crash report");
    assert_eq!(report.code, ErrorCode::Crash);
    assert!(report.message.contains("handler blew up"));

    // The unit's loop survived the panic
    let (result, _) = run_flow(&manager, &mut events, 8, "long_ping").await;
    assert_eq!(result, StageResult::Success);

    manager.stop(8).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_loss_is_reported_and_blocked_call_fails() {
    let manager = start_manager().await;
    let mut events = manager.subscribe();
    manager.run_vuser(VuserConfig::new(5, "probe")).await.unwrap();

    manager
        .run_stage(5, StageArgs::flow(Stage::Action, ["hangup"]))
        .unwrap();

    let mut lost = false;
    let mut finished = None;
    while !(lost && finished.is_some()) {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("no connection loss reported")
            .unwrap();
        match event.event {
            UnitEvent::ConnectionLost(_) => lost = true,
            UnitEvent::StageFinished { result, .. } => finished = Some(result),
            _ => {}
        }
    }
    assert_eq!(finished, Some(StageResult::Failure));

    manager.stop(5).await.unwrap();
    assert_eq!(manager.state(5), VuserState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_vusers_get_their_own_replies() {
    let manager = start_manager().await;
    let mut events = manager.subscribe();
    let ids: Vec<VuserId> = (10..14).collect();

    for &id in &ids {
        manager.run_vuser(VuserConfig::new(id, "probe")).await.unwrap();
    }
    for &id in &ids {
        manager
            .run_stage(id, StageArgs::flow(Stage::Action, ["long_ping"]))
            .unwrap();
    }

    let mut done = Vec::new();
    while done.len() < ids.len() {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("stages did not finish")
            .unwrap();
        match event.event {
            UnitEvent::Log(record) if record.level == LogLevel::Info => {
                assert_eq!(record.message, long_pong())
            }
            UnitEvent::StageFinished { result, .. } => {
                assert_eq!(result, StageResult::Success);
                done.push(event.vuser_id);
            }
            _ => {}
        }
    }
    done.sort_unstable();
    assert_eq!(done, ids);

    manager.stop_all().await;
    assert!(manager.active_vusers().is_empty());
}

#[tokio::test]
async fn stop_is_idempotent_and_unknown_ids_are_errors() {
    let manager = start_manager().await;
    manager.init_vuser(&VuserConfig::new(6, "probe")).await.unwrap();

    manager.stop(6).await.unwrap();
    manager.stop(6).await.unwrap();
    assert_eq!(manager.state(6), VuserState::Stopped);

    match manager.stop(99).await {
        Err(err @ EngineError::UnknownVuser(99)) => {
            assert_eq!(err.report().code, ErrorCode::Sdk);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn init_fails_without_backend() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let manager = VuserManager::new(&config(port), Arc::new(ProbeScript));
    let err = manager
        .init_vuser(&VuserConfig::new(7, "probe"))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::ConnectionFailed(_)));
    assert_eq!(manager.state(7), VuserState::Uninitialized);
}
