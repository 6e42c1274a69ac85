// src/runtime/timers.rs
//! Execution-unit timers
//!
//! Timers run as local tasks on the execution unit's `LocalSet`. Each live
//! timer has a completion signal that script code can await; clearing a
//! timer resolves its waiters instead of leaving them pending.

use crate::utils::errors::{EngineError, Result};
use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::trace;

/// Timer identifier, unique per vuser
pub type TimerId = u64;

/// Shortest interval period accepted
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// How a wait on a timer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The timeout elapsed and its callback ran
    Fired,

    /// The timer was cleared before firing
    Cleared,

    /// The timer had already finished when the wait started
    AlreadyCompleted,
}

struct TimerEntry {
    task: JoinHandle<()>,
    done: watch::Sender<Option<TimerOutcome>>,
}

struct TimerState {
    next_id: TimerId,
    entries: HashMap<TimerId, TimerEntry>,
}

/// Table of live timers for one vuser
#[derive(Clone)]
pub struct TimerTable {
    state: Rc<RefCell<TimerState>>,
}

impl TimerTable {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(TimerState {
                next_id: 1,
                entries: HashMap::new(),
            })),
        }
    }

    /// Run `callback` once after `delay`
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() + 'static,
    {
        let id = self.allocate_id();
        let state = Rc::downgrade(&self.state);

        let task = tokio::task::spawn_local(async move {
            time::sleep(delay).await;
            callback();
            finish(&state, id, TimerOutcome::Fired);
        });

        self.insert(id, task);
        id
    }

    /// Run `callback` every `period` until the timer is cleared
    pub fn set_interval<F>(&self, period: Duration, mut callback: F) -> TimerId
    where
        F: FnMut() + 'static,
    {
        let id = self.allocate_id();
        let period = period.max(MIN_INTERVAL);

        let task = tokio::task::spawn_local(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                callback();
            }
        });

        self.insert(id, task);
        id
    }

    /// Cancel a timer and resolve its waiters; false if it was not live
    pub fn clear_timer(&self, id: TimerId) -> bool {
        let entry = self.state.borrow_mut().entries.remove(&id);
        match entry {
            Some(entry) => {
                entry.task.abort();
                entry.done.send_replace(Some(TimerOutcome::Cleared));
                trace!("Cleared timer {}", id);
                true
            }
            None => false,
        }
    }

    /// Cancel every live timer; returns how many were cleared
    pub fn clear_all(&self) -> usize {
        let entries: Vec<TimerEntry> = {
            let mut state = self.state.borrow_mut();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        for entry in &entries {
            entry.task.abort();
            entry.done.send_replace(Some(TimerOutcome::Cleared));
        }
        entries.len()
    }

    /// Wait until the timer fires or is cleared
    pub fn wait(&self, id: TimerId) -> LocalBoxFuture<'static, Result<TimerOutcome>> {
        let state = self.state.borrow();

        let Some(entry) = state.entries.get(&id) else {
            let result = if id >= 1 && id < state.next_id {
                Ok(TimerOutcome::AlreadyCompleted)
            } else {
                Err(EngineError::UnknownTimer(id))
            };
            return future::ready(result).boxed_local();
        };

        let mut done = entry.done.subscribe();
        async move {
            let outcome = match done.wait_for(Option::is_some).await {
                Ok(outcome) => (*outcome).unwrap_or(TimerOutcome::Cleared),
                Err(_) => TimerOutcome::Cleared,
            };
            Ok(outcome)
        }
        .boxed_local()
    }

    /// Number of live timers
    pub fn pending(&self) -> usize {
        self.state.borrow().entries.len()
    }

    fn allocate_id(&self) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    fn insert(&self, id: TimerId, task: JoinHandle<()>) {
        let (done, _) = watch::channel(None);
        self.state
            .borrow_mut()
            .entries
            .insert(id, TimerEntry { task, done });
    }
}

impl Default for TimerTable {
    fn default() -> Self {
        Self::new()
    }
}

fn finish(state: &Weak<RefCell<TimerState>>, id: TimerId, outcome: TimerOutcome) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let entry = state.borrow_mut().entries.remove(&id);
    if let Some(entry) = entry {
        entry.done.send_replace(Some(outcome));
    }
}
