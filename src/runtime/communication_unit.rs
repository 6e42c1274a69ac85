// src/runtime/communication_unit.rs
//! Communication unit: the thread that owns a vuser's backend connection
//!
//! Outbound requests from the execution unit are written to the socket as
//! they arrive. Inbound lines are routed by correlation id:
//!
//! ```text
//! messageId == -1            ──► Delivery::Socket over the link
//! pending SendSync           ──► handoff channel (blocks until consumed)
//! pending Send               ──► Delivery::Reply over the link
//! anything else              ──► protocol error, frame dropped
//! ```
//!
//! A line without a readable header cannot be correlated. If a blocking
//! call is parked it is answered with an `Error.Protocol` reply, since at
//! most one can be in flight.
//!
//! There is no reconnect. When the connection ends the unit reports
//! `ConnectionLost`, closes the handoff channel and exits.

use crate::observability::names;
use crate::protocol::{protocol_error_reply, FrameHeader};
use crate::runtime::events::{UnitEvent, UnitEvents};
use crate::runtime::handoff::Responder;
use crate::runtime::link::{
    CommunicationLink, CommunicatorCommand, Delivery, MessageId, Request, RequestKind, VuserId,
};
use crate::utils::config::BackendConfig;
use crate::utils::errors::{EngineError, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::thread;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

/// What a recorded request expects back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Send,
    SendSync,
}

/// Why the unit's loop ended
enum Exit {
    Shutdown,
    ChannelClosed,
    ConnectionLost(String),
}

/// Everything a communication unit thread starts with
pub struct CommunicationUnit {
    pub vuser_id: VuserId,
    pub backend: BackendConfig,
    pub link: CommunicationLink,
    pub responder: Responder,
    pub events: UnitEvents,
    pub commands: mpsc::UnboundedReceiver<CommunicatorCommand>,
}

impl CommunicationUnit {
    /// Start the unit on its own thread
    ///
    /// `ready` is answered once the backend connection is established, or
    /// with the connection error.
    pub fn spawn(self, ready: oneshot::Sender<Result<()>>) -> Result<thread::JoinHandle<()>> {
        let name = format!("vuser-{}-comm", self.vuser_id);

        let handle = thread::Builder::new().name(name).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready.send(Err(EngineError::InitFailed(format!(
                        "communication runtime: {}",
                        e
                    ))));
                    return;
                }
            };

            runtime.block_on(self.run(ready));
        })?;

        Ok(handle)
    }

    async fn run(self, ready: oneshot::Sender<Result<()>>) {
        let CommunicationUnit {
            vuser_id,
            backend,
            link,
            responder,
            events,
            mut commands,
        } = self;
        let CommunicationLink {
            mut requests,
            deliveries,
        } = link;

        let stream = match connect(&backend).await {
            Ok(stream) => stream,
            Err(err) => {
                let _ = ready.send(Err(err));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        debug!(vuser_id, "Connected to backend {}:{}", backend.host, backend.port);

        let (reader, mut writer) = stream.into_split();
        let mut frames = FramedRead::new(reader, LinesCodec::new());
        let mut router = Router {
            pending: HashMap::new(),
            responder,
            deliveries,
            events: events.clone(),
        };
        let mut requests_open = true;

        let exit = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(CommunicatorCommand::Shutdown) | None => break Exit::Shutdown,
                },
                request = requests.recv(), if requests_open => match request {
                    Some(request) => {
                        router.record(&request);
                        if let Err(e) = writer.write_all(request.payload.as_bytes()).await {
                            break Exit::ConnectionLost(format!("write failed: {}", e));
                        }
                    }
                    None => requests_open = false,
                },
                frame = frames.next() => match frame {
                    Some(Ok(line)) => {
                        if let Err(err) = router.route(line) {
                            debug!(vuser_id, "Stopped routing: {}", err);
                            break Exit::ChannelClosed;
                        }
                    }
                    Some(Err(e)) => break Exit::ConnectionLost(format!("read failed: {}", e)),
                    None => break Exit::ConnectionLost("backend closed the connection".into()),
                },
            }
        };

        match exit {
            Exit::Shutdown => debug!(vuser_id, "Communication unit shutting down"),
            Exit::ChannelClosed => {}
            Exit::ConnectionLost(reason) => {
                warn!(vuser_id, "Backend connection lost: {}", reason);
                events.emit(UnitEvent::ConnectionLost(reason));
            }
        }

        // Wake the execution unit if it is parked in a blocking call.
        router.responder.closer().close();
        let _ = writer.shutdown().await;
        info!(vuser_id, "Communication unit stopped");
    }
}

async fn connect(backend: &BackendConfig) -> Result<TcpStream> {
    let addr = format!("{}:{}", backend.host, backend.port);

    let stream = tokio::time::timeout(backend.connect_timeout(), TcpStream::connect(&addr))
        .await
        .map_err(|_| {
            EngineError::ConnectionFailed(format!(
                "{}: timed out after {}ms",
                addr, backend.connect_timeout_ms
            ))
        })?
        .map_err(|e| EngineError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Correlation state of one connection
struct Router {
    pending: HashMap<MessageId, PendingKind>,
    responder: Responder,
    deliveries: mpsc::UnboundedSender<Delivery>,
    events: UnitEvents,
}

impl Router {
    /// Remember a request that expects a reply
    fn record(&mut self, request: &Request) {
        let kind = match request.kind {
            RequestKind::Send => PendingKind::Send,
            RequestKind::SendSync => PendingKind::SendSync,
            RequestKind::SendSyncNoWait => return,
        };
        self.pending.insert(request.message_id, kind);
    }

    /// Route one inbound line
    ///
    /// Fails only when the handoff channel is closed.
    fn route(&mut self, line: String) -> Result<()> {
        let header = match FrameHeader::parse(&line) {
            Ok(header) => header,
            Err(err) => {
                self.protocol_error(format!("Dropping unreadable frame: {}", err));
                return self.fail_sync_caller(&err.to_string());
            }
        };

        if header.is_push() {
            match header.socket_id {
                Some(socket_id) => self.forward(Delivery::Socket {
                    socket_id,
                    content: line,
                }),
                None => self.protocol_error("Dropping push frame without socketId".to_string()),
            }
            return Ok(());
        }

        match self.pending.remove(&header.message_id) {
            Some(PendingKind::SendSync) => self.deliver_sync(header.message_id, &line),
            Some(PendingKind::Send) => {
                self.forward(Delivery::Reply {
                    message_id: header.message_id,
                    content: line,
                });
                Ok(())
            }
            None => {
                self.protocol_error(format!(
                    "Unexpected reply for message id {}",
                    header.message_id
                ));
                Ok(())
            }
        }
    }

    fn deliver_sync(&mut self, message_id: MessageId, line: &str) -> Result<()> {
        let flips = match self.responder.deliver(line) {
            Ok(flips) => flips,
            Err(EngineError::InvalidArgument(reason)) => {
                // The caller is parked; it still gets an answer.
                self.protocol_error(format!(
                    "Reply for message id {} rejected: {}",
                    message_id, reason
                ));
                self.responder
                    .deliver(&protocol_error_reply(message_id, &reason))?
            }
            Err(err) => return Err(err),
        };

        metrics::counter!(names::HANDOFF_FLIPS).increment(flips as u64);
        Ok(())
    }

    /// Answer the parked blocking caller, if any, with a protocol error
    fn fail_sync_caller(&mut self, reason: &str) -> Result<()> {
        let waiting = self
            .pending
            .iter()
            .find(|(_, kind)| **kind == PendingKind::SendSync)
            .map(|(message_id, _)| *message_id);

        let Some(message_id) = waiting else {
            return Ok(());
        };
        self.pending.remove(&message_id);

        let flips = self
            .responder
            .deliver(&protocol_error_reply(message_id, reason))?;
        metrics::counter!(names::HANDOFF_FLIPS).increment(flips as u64);
        Ok(())
    }

    fn forward(&self, delivery: Delivery) {
        if self.deliveries.send(delivery).is_err() {
            debug!(
                vuser_id = self.events.vuser_id(),
                "Execution unit gone, dropping delivery"
            );
        }
    }

    fn protocol_error(&self, message: String) {
        metrics::counter!(names::PROTOCOL_ERRORS).increment(1);
        warn!(vuser_id = self.events.vuser_id(), "{}", message);
        self.events.error(message);
    }
}
