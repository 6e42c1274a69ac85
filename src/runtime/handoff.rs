// src/runtime/handoff.rs
//! Handoff channel: double-buffered blocking transfer between two threads
//!
//! The communication unit (responder) hands a reply of unbounded length to
//! the execution unit (requester), which is parked until the data arrives.
//! The only shared memory is two fixed-size buffers of UTF-16 code units,
//! each guarded by a write lock and a read lock ([`LockWord`]s).
//!
//! # Protocol
//!
//! ```text
//! Responder (per chunk)                 Requester (per chunk)
//! write(active)                         lock(active)
//! lock_read(other)                      unlock_read(active)
//! lock(other)                           read(active)
//! unlock(active)  ───── wakes ────►     unlock(active)
//! flip()                                flip()
//! ```
//!
//! The responder starts out holding both locks of the first buffer, so the
//! requester can never read a buffer before it is written. A chunk that
//! fits entirely is followed by a zero sentinel (`eoln`); a full buffer
//! means more chunks follow. After the last chunk both sides are active on
//! the same buffer again and the next round trip can start.
//!
//! There is no timeout. A side that dies mid-protocol closes the channel
//! on drop, and [`HandoffCloser`] lets the owner of the pair break a stuck
//! round trip from the outside.
//!
//! Closing never discards a published chunk. Each buffer carries a
//! `pending` flag set by the responder right before it releases the buffer
//! and cleared by the requester once read; a requester that finds the
//! channel closed still drains pending chunks before failing.

use crate::runtime::futex::LockWord;
use crate::utils::errors::{EngineError, Result};
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

/// Result of writing one chunk into a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWrite {
    /// Code units copied into the buffer
    pub written: usize,

    /// The remaining input fit and a sentinel was written
    pub eoln: bool,
}

/// One buffer with its write lock and read lock
pub struct BufferMutex {
    write_lock: CachePadded<LockWord>,
    read_lock: CachePadded<LockWord>,
    pending: AtomicBool,
    data: Box<[AtomicU16]>,
}

impl BufferMutex {
    /// Create a buffer with `capacity` code-unit slots
    pub fn new(capacity: usize) -> Self {
        Self {
            write_lock: CachePadded::new(LockWord::new()),
            read_lock: CachePadded::new(LockWord::new()),
            pending: AtomicBool::new(false),
            data: (0..capacity).map(|_| AtomicU16::new(0)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn lock(&self) -> Result<()> {
        self.write_lock.lock()
    }

    pub fn unlock(&self) -> Result<()> {
        self.write_lock.unlock()
    }

    pub fn lock_read(&self) -> Result<()> {
        self.read_lock.lock()
    }

    pub fn unlock_read(&self) -> Result<()> {
        self.read_lock.unlock()
    }

    /// Copy as many units of `input[start..]` as fit
    ///
    /// A zero sentinel follows the data when the rest of the input fits.
    pub fn write(&self, input: &[u16], start: usize) -> ChunkWrite {
        let capacity = self.data.len();
        let remaining = input.get(start..).unwrap_or(&[]);
        let count = remaining.len().min(capacity);

        for (slot, unit) in self.data.iter().zip(&remaining[..count]) {
            slot.store(*unit, Ordering::Relaxed);
        }

        let eoln = count < capacity;
        if eoln {
            self.data[count].store(0, Ordering::Relaxed);
        }

        ChunkWrite {
            written: count,
            eoln,
        }
    }

    /// Mark the written chunk unread and release the buffer
    ///
    /// A close racing the release is not an error: the chunk is already
    /// visible to [`BufferMutex::take_pending`].
    pub fn publish(&self) -> Result<()> {
        self.pending.store(true, Ordering::Release);
        match self.write_lock.unlock() {
            Ok(()) | Err(EngineError::ChannelClosed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Append the buffer contents up to the sentinel; true if one was found
    pub fn read(&self, out: &mut Vec<u16>) -> bool {
        let mut eoln = false;
        for slot in self.data.iter() {
            let unit = slot.load(Ordering::Relaxed);
            if unit == 0 {
                eoln = true;
                break;
            }
            out.push(unit);
        }
        self.pending.store(false, Ordering::Relaxed);
        eoln
    }

    /// Read an unread chunk without taking the locks
    ///
    /// Only sound once the channel is closed, when the responder can no
    /// longer acquire the buffer.
    pub fn take_pending(&self, out: &mut Vec<u16>) -> Option<bool> {
        if self.pending.swap(false, Ordering::Acquire) {
            Some(self.read(out))
        } else {
            None
        }
    }

    fn close(&self) {
        self.write_lock.close();
        self.read_lock.close();
    }
}

/// Two connected buffers and the selector of the active one
///
/// Each side of the channel owns its own `DualMutex` view over the same
/// pair of buffers; the `use_first` selector is private to that side.
pub struct DualMutex {
    first: Arc<BufferMutex>,
    second: Arc<BufferMutex>,
    use_first: bool,
}

impl DualMutex {
    pub fn new(capacity: usize) -> Self {
        Self {
            first: Arc::new(BufferMutex::new(capacity)),
            second: Arc::new(BufferMutex::new(capacity)),
            use_first: true,
        }
    }

    /// Another view over the same buffers, starting on the first one
    pub fn connect(&self) -> Self {
        Self {
            first: Arc::clone(&self.first),
            second: Arc::clone(&self.second),
            use_first: true,
        }
    }

    fn active(&self) -> &BufferMutex {
        if self.use_first {
            &self.first
        } else {
            &self.second
        }
    }

    fn other(&self) -> &BufferMutex {
        if self.use_first {
            &self.second
        } else {
            &self.first
        }
    }

    pub fn capacity(&self) -> usize {
        self.first.capacity()
    }

    pub fn lock(&self) -> Result<()> {
        self.active().lock()
    }

    pub fn unlock(&self) -> Result<()> {
        self.active().unlock()
    }

    pub fn lock_read(&self) -> Result<()> {
        self.active().lock_read()
    }

    pub fn unlock_read(&self) -> Result<()> {
        self.active().unlock_read()
    }

    pub fn lock_other(&self) -> Result<()> {
        self.other().lock()
    }

    pub fn unlock_other(&self) -> Result<()> {
        self.other().unlock()
    }

    pub fn lock_read_other(&self) -> Result<()> {
        self.other().lock_read()
    }

    /// Swap the active buffer
    pub fn flip(&mut self) {
        self.use_first = !self.use_first;
    }

    pub fn write(&self, input: &[u16], start: usize) -> ChunkWrite {
        self.active().write(input, start)
    }

    pub fn publish(&self) -> Result<()> {
        self.active().publish()
    }

    pub fn read(&self, out: &mut Vec<u16>) -> bool {
        self.active().read(out)
    }

    pub fn take_pending(&self, out: &mut Vec<u16>) -> Option<bool> {
        self.active().take_pending(out)
    }

    pub fn is_closed(&self) -> bool {
        self.first.write_lock.is_closed()
    }

    pub fn closer(&self) -> HandoffCloser {
        HandoffCloser {
            first: Arc::clone(&self.first),
            second: Arc::clone(&self.second),
        }
    }
}

/// Handle that closes both buffers of a channel
///
/// Closing wakes any thread parked in the protocol with
/// [`EngineError::ChannelClosed`].
#[derive(Clone)]
pub struct HandoffCloser {
    first: Arc<BufferMutex>,
    second: Arc<BufferMutex>,
}

impl HandoffCloser {
    pub fn close(&self) {
        self.first.close();
        self.second.close();
    }

    pub fn is_closed(&self) -> bool {
        self.first.write_lock.is_closed()
    }
}

/// Create a connected requester/responder pair
pub fn channel(capacity: usize) -> Result<(Requester, Responder)> {
    if capacity == 0 {
        return Err(EngineError::InvalidArgument(
            "handoff buffer capacity must be positive".into(),
        ));
    }

    let mutex = DualMutex::new(capacity);
    let requester = Requester::new(mutex.connect());
    let responder = Responder::new(mutex)?;
    Ok((requester, responder))
}

/// Blocking side of the channel, used by the execution unit
pub struct Requester {
    mutex: DualMutex,
    scratch: Vec<u16>,
}

impl Requester {
    fn new(mutex: DualMutex) -> Self {
        Self {
            mutex,
            scratch: Vec::new(),
        }
    }

    /// Park until the responder has delivered a full payload
    ///
    /// `&mut self` keeps a second receive from starting before this one
    /// has drained every chunk.
    pub fn receive(&mut self) -> Result<String> {
        self.scratch.clear();

        loop {
            let eoln = self.next_chunk()?;
            self.mutex.flip();

            if eoln {
                break;
            }
        }

        // Chunks may split a surrogate pair, decode only the whole payload.
        String::from_utf16(&self.scratch)
            .map_err(|e| EngineError::ProtocolError(format!("Invalid UTF-16 reply: {}", e)))
    }

    /// Read the active buffer's chunk; true if it ends the payload
    fn next_chunk(&mut self) -> Result<bool> {
        if let Err(err) = self.mutex.lock().and_then(|()| self.mutex.unlock_read()) {
            return self.drain(err);
        }

        let eoln = self.mutex.read(&mut self.scratch);
        match self.mutex.unlock() {
            // Closed after the read; the chunk is ours either way.
            Ok(()) | Err(EngineError::ChannelClosed) => Ok(eoln),
            Err(err) => Err(err),
        }
    }

    /// Fall back to a chunk published before the channel closed
    fn drain(&mut self, err: EngineError) -> Result<bool> {
        match err {
            EngineError::ChannelClosed => self
                .mutex
                .take_pending(&mut self.scratch)
                .ok_or(EngineError::ChannelClosed),
            other => Err(other),
        }
    }

    pub fn closer(&self) -> HandoffCloser {
        self.mutex.closer()
    }
}

impl Drop for Requester {
    fn drop(&mut self) {
        self.mutex.closer().close();
    }
}

/// Producing side of the channel, used by the communication unit
pub struct Responder {
    mutex: DualMutex,
}

impl Responder {
    fn new(mutex: DualMutex) -> Result<Self> {
        // Hold the first buffer so the requester waits for real data.
        mutex.lock()?;
        mutex.lock_read()?;
        Ok(Self { mutex })
    }

    /// Hand `payload` to the requester, chunk by chunk
    ///
    /// Blocks until the requester has picked up every chunk except the
    /// last, which stays readable even if the channel closes right after.
    /// Returns the number of flips performed.
    pub fn deliver(&mut self, payload: &str) -> Result<usize> {
        if payload.contains('\0') {
            return Err(EngineError::InvalidArgument(
                "payload contains the NUL sentinel".into(),
            ));
        }
        if self.mutex.is_closed() {
            return Err(EngineError::ChannelClosed);
        }

        let units: Vec<u16> = payload.encode_utf16().collect();
        let mut position = 0;
        let mut flips = 0;

        loop {
            let chunk = self.mutex.write(&units, position);
            position += chunk.written;

            // Claim the next buffer before releasing this one, so we never
            // run more than one buffer ahead of the reader.
            self.mutex.lock_read_other()?;
            self.mutex.lock_other()?;
            self.mutex.publish()?;
            self.mutex.flip();
            flips += 1;

            if chunk.eoln {
                return Ok(flips);
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.mutex.capacity()
    }

    pub fn closer(&self) -> HandoffCloser {
        self.mutex.closer()
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.mutex.closer().close();
    }
}
