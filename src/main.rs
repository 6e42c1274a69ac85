// src/main.rs
//! Vuser Engine probe
//!
//! Runs a handful of vusers with a built-in ping script against the
//! configured backend, then stops them. Useful to check a backend and the
//! engine's thread plumbing end to end.

use anyhow::{bail, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use vuser_engine::observability::{init_metrics, init_tracing};
use vuser_engine::runtime::events::{LogLevel, UnitEvent, VuserEvent};
use vuser_engine::runtime::link::VuserId;
use vuser_engine::script::StageResult;
use vuser_engine::{
    build_banner, EngineConfig, FlowRegistry, ScriptError, ScriptLoader, Stage, StageArgs,
    VuserConfig, VuserManager,
};

/// Script sending one blocking ping per action
struct PingScript {
    payload: String,
}

impl ScriptLoader for PingScript {
    fn load(
        &self,
        config: &VuserConfig,
        flows: &mut FlowRegistry,
    ) -> std::result::Result<(), ScriptError> {
        let vuser_id = config.vuser_id;
        let payload = self.payload.clone();

        flows
            .initialize("hello", move |ctx| async move {
                ctx.log(LogLevel::Info, format!("vuser {} starting", vuser_id));
                Ok(())
            })
            .action("ping", move |ctx| {
                let payload = payload.clone();
                async move {
                    let reply = ctx.send_message_sync("Probe.Ping", json!({ "payload": payload }))?;
                    ctx.log(
                        LogLevel::Debug,
                        format!("iteration {} reply: {}", ctx.iteration(), reply),
                    );
                    Ok(())
                }
            })
            .finalize("bye", |ctx| async move {
                ctx.log(LogLevel::Info, format!("vuser done after {} iterations", ctx.iteration()));
                Ok(())
            });
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::load()?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.logging)?;
    init_metrics(&config.metrics)?;

    info!("Starting Vuser Engine {}", build_banner());
    info!("Configuration loaded: {:?}", config);

    let loader = Arc::new(PingScript {
        payload: config.probe.payload.clone(),
    });
    let manager = Arc::new(VuserManager::new(&config, loader));

    let probe = run_probe(Arc::clone(&manager), &config);

    // Graceful shutdown handler
    let outcome = tokio::select! {
        outcome = probe => outcome,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Received shutdown signal, cleaning up..."),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
            Ok(0)
        }
    };

    manager.stop_all().await;

    match outcome {
        Ok(0) => {
            info!("Probe finished");
            Ok(())
        }
        Ok(failed) => bail!("{} vuser(s) failed", failed),
        Err(e) => {
            error!("Probe error: {}", e);
            Err(e)
        }
    }
}

/// Run every probe vuser to completion, returning how many failed
async fn run_probe(manager: Arc<VuserManager>, config: &EngineConfig) -> Result<usize> {
    let mut tasks = Vec::new();

    for vuser_id in 1..=VuserId::from(config.probe.vusers) {
        let manager = Arc::clone(&manager);
        let iterations = config.probe.iterations;
        tasks.push(tokio::spawn(async move {
            let outcome = drive_vuser(&manager, vuser_id, iterations).await;
            if let Err(e) = &outcome {
                warn!(vuser_id, "Vuser failed: {}", e);
            }
            outcome
        }));
    }

    let mut failed = 0;
    for task in futures::future::join_all(tasks).await {
        match task {
            Ok(Ok(())) => {}
            Ok(Err(_)) => failed += 1,
            Err(e) => {
                error!("Vuser task panicked: {}", e);
                failed += 1;
            }
        }
    }
    Ok(failed)
}

async fn drive_vuser(manager: &VuserManager, vuser_id: VuserId, iterations: u32) -> Result<()> {
    let mut events = manager.subscribe();
    manager
        .run_vuser(VuserConfig::new(vuser_id, "ping"))
        .await?;

    let mut stages = vec![Stage::Initialize];
    stages.extend(std::iter::repeat(Stage::Action).take(iterations as usize));
    stages.push(Stage::Finalize);

    for stage in stages {
        manager.run_stage(vuser_id, StageArgs::all(stage))?;
        if wait_for_stage(&mut events, vuser_id).await? == StageResult::Failure {
            manager.stop(vuser_id).await?;
            bail!("vuser {} failed in {}", vuser_id, stage);
        }
    }

    manager.stop(vuser_id).await?;
    Ok(())
}

async fn wait_for_stage(
    events: &mut broadcast::Receiver<VuserEvent>,
    vuser_id: VuserId,
) -> Result<StageResult> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(vuser_id, skipped, "Event subscriber lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
        };
        if event.vuser_id != vuser_id {
            continue;
        }

        match event.event {
            UnitEvent::StageFinished { result, .. } => return Ok(result),
            UnitEvent::ConnectionLost(reason) => bail!("connection lost: {}", reason),
            _ => {}
        }
    }
}
