// src/runtime/sockets.rs
//! Execution-unit socket registry
//!
//! A logical push socket is a message handler plus two optional one-shot
//! barriers: one that wakes on new data, one that wakes on closure. A
//! barrier's timeout resolves it without error; the caller tells a timeout
//! from real data by re-checking its own state.

use crate::utils::errors::{EngineError, Result};
use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

/// Handler invoked for every push frame of a socket
pub type SocketHandler = Box<dyn FnMut(Value)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarrierSlot {
    Data,
    Close,
}

struct Barrier {
    resolve: Option<oneshot::Sender<Result<()>>>,
    timeout: Option<JoinHandle<()>>,
    generation: u64,
}

impl Barrier {
    /// Wake the waiter; dropping the barrier cancels its timeout
    fn resolve(mut self, result: Result<()>) {
        if let Some(resolve) = self.resolve.take() {
            let _ = resolve.send(result);
        }
    }
}

impl Drop for Barrier {
    fn drop(&mut self) {
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }
    }
}

struct SocketEntry {
    on_message: Rc<RefCell<SocketHandler>>,
    barrier: Option<Barrier>,
    close_barrier: Option<Barrier>,
}

impl SocketEntry {
    fn slot(&mut self, slot: BarrierSlot) -> &mut Option<Barrier> {
        match slot {
            BarrierSlot::Data => &mut self.barrier,
            BarrierSlot::Close => &mut self.close_barrier,
        }
    }
}

#[derive(Default)]
struct SocketState {
    sockets: HashMap<String, SocketEntry>,
    generation: u64,
}

/// Registry of push sockets for one vuser
#[derive(Clone, Default)]
pub struct SocketRegistry {
    state: Rc<RefCell<SocketState>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `on_message` for push frames tagged `socket_id`
    ///
    /// Re-registering an id drops the previous entry and its barriers.
    pub fn register_socket<F>(&self, socket_id: impl Into<String>, on_message: F)
    where
        F: FnMut(Value) + 'static,
    {
        let entry = SocketEntry {
            on_message: Rc::new(RefCell::new(Box::new(on_message))),
            barrier: None,
            close_barrier: None,
        };
        let previous = self.state.borrow_mut().sockets.insert(socket_id.into(), entry);
        drop(previous);
    }

    /// Remove a socket; pending barrier waits fail with `SocketClosed`
    pub fn unregister_socket(&self, socket_id: &str) -> bool {
        let removed = self.state.borrow_mut().sockets.remove(socket_id);
        removed.is_some()
    }

    pub fn contains(&self, socket_id: &str) -> bool {
        self.state.borrow().sockets.contains_key(socket_id)
    }

    pub fn len(&self) -> usize {
        self.state.borrow().sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next data wake-up of a socket
    pub fn new_socket_barrier(
        &self,
        socket_id: &str,
        timeout: Option<Duration>,
    ) -> LocalBoxFuture<'static, Result<()>> {
        self.install_barrier(socket_id, BarrierSlot::Data, timeout)
    }

    /// Resolve the data barrier, failing it when `error` is set
    pub fn break_socket_barrier(&self, socket_id: &str, error: Option<String>) -> Result<()> {
        let barrier = {
            let mut state = self.state.borrow_mut();
            let entry = state
                .sockets
                .get_mut(socket_id)
                .ok_or_else(|| EngineError::UnknownSocket(socket_id.to_string()))?;
            entry.barrier.take()
        };

        if let Some(barrier) = barrier {
            match error {
                Some(message) => barrier.resolve(Err(EngineError::BarrierBroken(message))),
                None => barrier.resolve(Ok(())),
            }
        }
        Ok(())
    }

    /// Wait until the socket is disconnected
    pub fn wait_for_socket_closure(
        &self,
        socket_id: &str,
        timeout: Option<Duration>,
    ) -> LocalBoxFuture<'static, Result<()>> {
        self.install_barrier(socket_id, BarrierSlot::Close, timeout)
    }

    /// Report a socket as closed: runs `on_close` then wakes closure waiters
    pub fn disconnect_socket<F>(&self, socket_id: &str, message: Value, on_close: Option<F>) -> Result<()>
    where
        F: FnOnce(Value),
    {
        if !self.contains(socket_id) {
            return Err(EngineError::UnknownSocket(socket_id.to_string()));
        }

        if let Some(on_close) = on_close {
            on_close(message);
        }

        let barrier = self
            .state
            .borrow_mut()
            .sockets
            .get_mut(socket_id)
            .and_then(|entry| entry.close_barrier.take());
        if let Some(barrier) = barrier {
            barrier.resolve(Ok(()));
        }
        Ok(())
    }

    /// Hand a push frame to the socket's handler
    pub fn dispatch(&self, socket_id: &str, content: Value) -> Result<()> {
        let handler = self
            .state
            .borrow()
            .sockets
            .get(socket_id)
            .map(|entry| Rc::clone(&entry.on_message))
            .ok_or_else(|| EngineError::UnknownSocket(socket_id.to_string()))?;

        // No registry borrow is held, so the handler may use the registry.
        let mut handler = handler.borrow_mut();
        (*handler)(content);
        Ok(())
    }

    /// Unregister every socket; returns how many were removed
    pub fn clear_all(&self) -> usize {
        let removed: Vec<SocketEntry> = {
            let mut state = self.state.borrow_mut();
            state.sockets.drain().map(|(_, entry)| entry).collect()
        };
        trace!("Cleared {} sockets", removed.len());
        removed.len()
    }

    fn install_barrier(
        &self,
        socket_id: &str,
        slot: BarrierSlot,
        timeout: Option<Duration>,
    ) -> LocalBoxFuture<'static, Result<()>> {
        let (tx, rx) = oneshot::channel();

        let replaced = {
            let mut state = self.state.borrow_mut();
            state.generation += 1;
            let generation = state.generation;

            let Some(entry) = state.sockets.get_mut(socket_id) else {
                return future::ready(Err(EngineError::UnknownSocket(socket_id.to_string())))
                    .boxed_local();
            };

            let timeout = timeout.map(|delay| {
                spawn_barrier_timeout(
                    Rc::downgrade(&self.state),
                    socket_id.to_string(),
                    slot,
                    generation,
                    delay,
                )
            });

            entry.slot(slot).replace(Barrier {
                resolve: Some(tx),
                timeout,
                generation,
            })
        };

        if let Some(previous) = replaced {
            previous.resolve(Ok(()));
        }

        let socket_id = socket_id.to_string();
        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(EngineError::SocketClosed(socket_id)),
            }
        }
        .boxed_local()
    }
}

fn spawn_barrier_timeout(
    state: Weak<RefCell<SocketState>>,
    socket_id: String,
    slot: BarrierSlot,
    generation: u64,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::task::spawn_local(async move {
        tokio::time::sleep(delay).await;

        let Some(state) = state.upgrade() else {
            return;
        };
        let barrier = {
            let mut state = state.borrow_mut();
            let Some(entry) = state.sockets.get_mut(&socket_id) else {
                return;
            };
            let current = entry.slot(slot);
            let is_current = current
                .as_ref()
                .map_or(false, |barrier| barrier.generation == generation);
            if is_current {
                current.take()
            } else {
                None
            }
        };

        if let Some(mut barrier) = barrier {
            // This task is the timeout; nothing left to abort.
            barrier.timeout = None;
            barrier.resolve(Ok(()));
        }
    })
}
