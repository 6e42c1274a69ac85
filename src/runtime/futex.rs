// src/runtime/futex.rs
//! Futex-backed lock word
//!
//! A [`LockWord`] is a binary lock that may be released by a different
//! thread than the one that acquired it. Acquisition is a compare-and-swap;
//! when contended the caller parks on the word (futex on Linux, a
//! condvar elsewhere) instead of spinning.
//!
//! Word states:
//! - `UNLOCKED` (0) free
//! - `LOCKED` (1) held, nobody parked
//! - `CONTENDED` (2) held, a waiter may be parked
//! - `CLOSED` (3) terminal; every lock/unlock fails and parked threads wake

use crate::utils::errors::{EngineError, Result};
use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;
const CLOSED: u32 = 3;

/// Cross-thread binary lock with futex-style parking
pub struct LockWord {
    state: AtomicU32,

    #[cfg(not(target_os = "linux"))]
    gate: parking_lot::Mutex<()>,

    #[cfg(not(target_os = "linux"))]
    condvar: parking_lot::Condvar,
}

impl LockWord {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            #[cfg(not(target_os = "linux"))]
            gate: parking_lot::Mutex::new(()),
            #[cfg(not(target_os = "linux"))]
            condvar: parking_lot::Condvar::new(),
        }
    }

    /// Acquire the word, parking while another holder keeps it
    pub fn lock(&self) -> Result<()> {
        // Once we have parked we must acquire as CONTENDED, other waiters
        // may still be asleep on the word.
        let mut acquire_as = LOCKED;

        loop {
            match self
                .state
                .compare_exchange(UNLOCKED, acquire_as, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(CLOSED) => return Err(EngineError::ChannelClosed),
                Err(LOCKED) => {
                    if self
                        .state
                        .compare_exchange(LOCKED, CONTENDED, Ordering::Relaxed, Ordering::Relaxed)
                        .is_err()
                    {
                        continue;
                    }
                }
                Err(_) => {}
            }

            self.wait(CONTENDED);
            acquire_as = CONTENDED;
        }
    }

    /// Release the word, waking one parked thread if any
    pub fn unlock(&self) -> Result<()> {
        let previous = self
            .state
            .fetch_update(Ordering::Release, Ordering::Relaxed, |state| match state {
                LOCKED | CONTENDED => Some(UNLOCKED),
                _ => None,
            });

        match previous {
            Ok(CONTENDED) => {
                self.wake(false);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(CLOSED) => Err(EngineError::ChannelClosed),
            Err(_) => Err(EngineError::InconsistentLock("unlock on unlocked Mutex")),
        }
    }

    /// Move the word to its terminal state and wake every parked thread
    pub fn close(&self) {
        self.state.store(CLOSED, Ordering::SeqCst);
        self.wake(true);
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), LOCKED | CONTENDED)
    }

    #[cfg(target_os = "linux")]
    fn wait(&self, expected: u32) {
        // Returns on wake, EAGAIN (word changed) or EINTR; the caller
        // re-checks the word in every case.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.state.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    #[cfg(target_os = "linux")]
    fn wake(&self, all: bool) {
        let count = if all { i32::MAX } else { 1 };
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.state.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn wait(&self, expected: u32) {
        let mut guard = self.gate.lock();
        if self.state.load(Ordering::Acquire) == expected {
            self.condvar.wait(&mut guard);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn wake(&self, all: bool) {
        // Taking the gate orders this wake after any waiter's state check.
        drop(self.gate.lock());
        if all {
            self.condvar.notify_all();
        } else {
            self.condvar.notify_one();
        }
    }
}

impl Default for LockWord {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockWord")
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}
