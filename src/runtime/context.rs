// src/runtime/context.rs
//! Script-facing call surface of one vuser
//!
//! Lives on the execution unit's thread (`Rc`, not `Send`). Provides the
//! three call modes towards the backend plus the per-vuser timer and
//! socket registries.
//!
//! - `send_sync`: blocks the thread until the reply arrives through the
//!   handoff channel
//! - `send`: the reply arrives later over the link and runs a callback
//! - `send_sync_no_wait`: fire and forget

use crate::observability::names;
use crate::protocol::{classify_reply, message_types, Envelope};
use crate::runtime::events::{LogLevel, UnitEvents};
use crate::runtime::handoff::Requester;
use crate::runtime::link::{Delivery, MessageId, Request, RequestKind, VuserId};
use crate::runtime::sockets::SocketRegistry;
use crate::runtime::timers::TimerTable;
use crate::script::{ExitType, ScriptError};
use crate::utils::errors::{EngineError, Result};
use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// Continuation of an async request
pub type ReplyCallback = Box<dyn FnOnce(Result<Value>)>;

/// Per-vuser execution context
pub struct ExecutionContext {
    vuser_id: VuserId,

    /// Outbound half of the link to the communication unit
    requests: mpsc::UnboundedSender<Request>,

    /// Blocking half of the handoff channel; borrowed for one round trip
    requester: RefCell<Requester>,

    /// Async continuations by correlation id
    callbacks: RefCell<HashMap<MessageId, ReplyCallback>>,

    timers: TimerTable,
    sockets: SocketRegistry,
    events: UnitEvents,

    /// Next id handed out by the envelope helpers
    next_message_id: Cell<MessageId>,

    /// `action` stages started so far
    iteration: Cell<u64>,
}

impl ExecutionContext {
    pub fn new(
        vuser_id: VuserId,
        requests: mpsc::UnboundedSender<Request>,
        requester: Requester,
        events: UnitEvents,
    ) -> Self {
        Self {
            vuser_id,
            requests,
            requester: RefCell::new(requester),
            callbacks: RefCell::new(HashMap::new()),
            timers: TimerTable::new(),
            sockets: SocketRegistry::new(),
            events,
            next_message_id: Cell::new(0),
            iteration: Cell::new(0),
        }
    }

    pub fn vuser_id(&self) -> VuserId {
        self.vuser_id
    }

    pub fn timers(&self) -> &TimerTable {
        &self.timers
    }

    pub fn sockets(&self) -> &SocketRegistry {
        &self.sockets
    }

    pub fn events(&self) -> &UnitEvents {
        &self.events
    }

    /// Post a log record to the manager
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.events.log(level, message);
    }

    pub fn iteration(&self) -> u64 {
        self.iteration.get()
    }

    pub(crate) fn begin_iteration(&self) -> u64 {
        let next = self.iteration.get() + 1;
        self.iteration.set(next);
        next
    }

    /// Async requests still waiting for a reply
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.borrow().len()
    }

    /// Send `payload` and block until its reply arrives
    ///
    /// Only one blocking call may be in flight; a nested call fails with
    /// [`EngineError::SyncCallInFlight`] instead of corrupting the channel.
    pub fn send_sync(&self, message_id: MessageId, payload: &str) -> Result<Value> {
        validate_payload(payload)?;

        let mut requester = self
            .requester
            .try_borrow_mut()
            .map_err(|_| EngineError::SyncCallInFlight)?;

        self.post(RequestKind::SendSync, message_id, payload)?;
        let reply = requester.receive()?;
        metrics::counter!(names::SYNC_CALLS).increment(1);

        Ok(serde_json::from_str(&reply)?)
    }

    /// Send `payload`; `callback` runs with the reply once it arrives
    ///
    /// Pending callbacks are canceled at every iteration boundary.
    pub fn send<F>(&self, message_id: MessageId, payload: &str, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Value>) + 'static,
    {
        let replaced = self
            .callbacks
            .borrow_mut()
            .insert(message_id, Box::new(callback));
        if replaced.is_some() {
            self.events.warning(format!(
                "replaced pending callback for message id: {}",
                message_id
            ));
        }

        if let Err(err) = self.post(RequestKind::Send, message_id, payload) {
            self.callbacks.borrow_mut().remove(&message_id);
            return Err(err);
        }

        metrics::counter!(names::ASYNC_CALLS).increment(1);
        Ok(())
    }

    /// Send `payload` without expecting a reply
    pub fn send_sync_no_wait(&self, message_id: MessageId, payload: &str) -> Result<()> {
        validate_payload(payload)?;
        self.post(RequestKind::SendSyncNoWait, message_id, payload)
    }

    /// Cancel every pending async request; each callback runs exactly once
    pub fn clear_response_pending_messages(&self) -> usize {
        let mut pending: Vec<(MessageId, ReplyCallback)> =
            self.callbacks.borrow_mut().drain().collect();
        pending.sort_by_key(|(id, _)| *id);

        let count = pending.len();
        for (id, callback) in pending {
            callback(Err(EngineError::CallbackCanceled(id)));
        }
        count
    }

    /// Drop every per-iteration continuation: sockets, callbacks, timers
    pub fn clear_all(&self) {
        let sockets = self.sockets.clear_all();
        let callbacks = self.clear_response_pending_messages();
        let timers = self.timers.clear_all();
        trace!(
            vuser_id = self.vuser_id,
            sockets,
            callbacks,
            timers,
            "Cleared per-vuser state"
        );
    }

    /// Route one inbound message from the communication unit
    pub fn deliver(&self, delivery: Delivery) {
        match delivery {
            Delivery::Reply {
                message_id,
                content,
            } => {
                let callback = self.callbacks.borrow_mut().remove(&message_id);
                match callback {
                    Some(callback) => {
                        callback(serde_json::from_str(&content).map_err(EngineError::from))
                    }
                    None => self.events.debug(format!(
                        "no pending callback for message id: {}",
                        message_id
                    )),
                }
            }
            Delivery::Socket { socket_id, content } => {
                let parsed = match serde_json::from_str(&content) {
                    Ok(value) => value,
                    Err(e) => {
                        self.events
                            .error(format!("invalid push frame for socket {}: {}", socket_id, e));
                        return;
                    }
                };
                if self.sockets.dispatch(&socket_id, parsed).is_err() {
                    self.events
                        .debug(format!("no socket for socket id: {}", socket_id));
                }
            }
        }
    }

    /// Allocate the next envelope message id
    pub fn next_message_id(&self) -> MessageId {
        let id = self.next_message_id.get();
        self.next_message_id.set(id + 1);
        id
    }

    /// Blocking envelope call; the reply is classified
    pub fn send_message_sync(
        &self,
        message_type: &str,
        content: Value,
    ) -> std::result::Result<Value, ScriptError> {
        let (message_id, line) = self.envelope(message_type, &content)?;
        let reply = self.send_sync(message_id, &line)?;
        classify_reply(reply)
    }

    /// Async envelope call
    pub fn send_message(
        &self,
        message_type: &str,
        content: Value,
    ) -> LocalBoxFuture<'static, std::result::Result<Value, ScriptError>> {
        let (message_id, line) = match self.envelope(message_type, &content) {
            Ok(envelope) => envelope,
            Err(err) => return future::ready(Err(err)).boxed_local(),
        };

        let (tx, rx) = oneshot::channel();
        let sent = self.send(message_id, &line, move |reply| {
            let _ = tx.send(reply);
        });
        if let Err(err) = sent {
            return future::ready(Err(err.into())).boxed_local();
        }

        async move {
            let reply = rx
                .await
                .map_err(|_| ScriptError::from(EngineError::CallbackCanceled(message_id)))??;
            classify_reply(reply)
        }
        .boxed_local()
    }

    /// Fire-and-forget envelope call
    pub fn send_message_no_response(
        &self,
        message_type: &str,
        content: Value,
    ) -> std::result::Result<(), ScriptError> {
        let (message_id, line) = self.envelope(message_type, &content)?;
        self.send_sync_no_wait(message_id, &line)?;
        Ok(())
    }

    /// Announce an exit to the backend and build the error ending the flow
    pub fn exit(&self, exit_type: ExitType, message: impl Into<String>) -> ScriptError {
        let message = message.into();
        let content = json!({ "exitType": exit_type, "message": message });
        if let Err(err) = self.send_message_sync(message_types::ABORT, content) {
            return err;
        }
        ScriptError::Abort { exit_type, message }
    }

    fn envelope(
        &self,
        message_type: &str,
        content: &Value,
    ) -> std::result::Result<(MessageId, String), ScriptError> {
        let message_id = self.next_message_id();
        let line = Envelope::new(self.vuser_id, message_id, message_type, content).to_line()?;
        Ok((message_id, line))
    }

    fn post(&self, kind: RequestKind, message_id: MessageId, payload: &str) -> Result<()> {
        self.requests
            .send(Request {
                kind,
                message_id,
                payload: payload.to_string(),
            })
            .map_err(|_| EngineError::UnitTerminated("communication unit is gone".into()))
    }
}

fn validate_payload(payload: &str) -> Result<()> {
    if payload.is_empty() {
        return Err(EngineError::InvalidArgument("payload cannot be empty".into()));
    }
    Ok(())
}
