//! Fixed-slot circular pool shared between a hardware callback and a worker thread.
//!
//! A `SlotRing` owns `N` pre-allocated PCM16 slots of equal length. The same
//! type serves capture (hardware writes, pipeline reads) and playback
//! (pipeline writes, hardware reads).
//!
//! ```text
//!            obtain_write ──► [Writing] ──release──► [Ready]
//!                ▲                                      │
//!                │                                 obtain_read
//!             [Free] ◄──────release────── [Reading] ◄───┘
//! ```
//!
//! Index bookkeeping lives under one `parking_lot::Mutex` paired with one
//! `Condvar`. Slot contents sit behind their own per-slot mutex, which is only
//! ever taken by the side that currently owns the slot, so copying samples in
//! or out never holds the ring lock.
//!
//! Non-blocking callers (the real-time audio callback) get `None` when no slot
//! is available and decide themselves whether to drop or retry.

pub mod chunk;

use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{ArrayError, Result};

/// Ownership state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Writing,
    Ready,
    Reading,
}

struct SlotData {
    samples: Box<[i16]>,
    /// Number of valid samples committed by the writer.
    len: usize,
}

struct RingState {
    write: usize,
    read: usize,
    full: bool,
    closed: bool,
    slots: Box<[SlotState]>,
}

/// Bounded pool of equally sized PCM16 slots handed out in FIFO order.
pub struct SlotRing {
    slot_len: usize,
    state: Mutex<RingState>,
    cond: Condvar,
    data: Box<[Mutex<SlotData>]>,
}

impl SlotRing {
    /// Allocate `slot_count` slots of `slot_len` samples each.
    ///
    /// This is the only allocation the ring ever performs.
    pub fn new(slot_count: usize, slot_len: usize) -> Result<Self> {
        if slot_count < 2 {
            return Err(ArrayError::InvalidConfig(format!(
                "slot ring needs at least 2 slots, got {slot_count}"
            )));
        }
        if slot_len == 0 {
            return Err(ArrayError::InvalidConfig("slot length must be non-zero".into()));
        }

        let data = (0..slot_count)
            .map(|_| {
                Mutex::new(SlotData {
                    samples: vec![0i16; slot_len].into_boxed_slice(),
                    len: 0,
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            slot_len,
            state: Mutex::new(RingState {
                write: 0,
                read: 0,
                full: false,
                closed: false,
                slots: vec![SlotState::Free; slot_count].into_boxed_slice(),
            }),
            cond: Condvar::new(),
            data,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.data.len()
    }

    /// Samples per slot.
    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Claim the next slot for writing.
    ///
    /// Returns `None` when the ring is full and `blocking` is false, or when the
    /// ring has been closed. With `blocking` set, waits until the consumer
    /// releases the slot.
    pub fn obtain_write(&self, blocking: bool) -> Option<WriteSlot<'_>> {
        let mut st = self.state.lock();
        loop {
            if st.closed {
                return None;
            }
            let w = st.write;
            if st.slots[w] == SlotState::Free {
                break;
            }
            if !blocking {
                return None;
            }
            self.cond.wait(&mut st);
        }

        let index = st.write;
        st.slots[index] = SlotState::Writing;
        st.write = (index + 1) % self.slot_count();
        st.full = st.write == st.read;
        drop(st);

        Some(WriteSlot {
            ring: self,
            index,
            data: Some(self.data[index].lock()),
            len: self.slot_len,
        })
    }

    /// Claim the oldest committed slot for reading.
    ///
    /// Returns `None` when nothing is ready and `blocking` is false, or when
    /// the ring has been closed.
    pub fn obtain_read(&self, blocking: bool) -> Option<ReadSlot<'_>> {
        let mut st = self.state.lock();
        loop {
            if st.closed {
                return None;
            }
            let r = st.read;
            if st.slots[r] == SlotState::Ready {
                break;
            }
            if !blocking {
                return None;
            }
            self.cond.wait(&mut st);
        }

        let index = st.read;
        st.slots[index] = SlotState::Reading;
        st.read = (index + 1) % self.slot_count();
        st.full = false;
        drop(st);

        Some(ReadSlot {
            ring: self,
            index,
            data: Some(self.data[index].lock()),
        })
    }

    /// Wake every waiter and refuse further obtains.
    ///
    /// Used on shutdown so a thread parked in a blocking obtain can observe
    /// its stop flag.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// True when the writer has caught up with the reader.
    pub fn is_full(&self) -> bool {
        self.state.lock().full
    }

    /// Number of committed slots waiting for a reader.
    pub fn ready_count(&self) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|s| **s == SlotState::Ready)
            .count()
    }

    /// Snapshot of (write index, read index). Both are always in `[0, N)`.
    pub fn indices(&self) -> (usize, usize) {
        let st = self.state.lock();
        (st.write, st.read)
    }

    fn transition(&self, index: usize, to: SlotState) {
        self.state.lock().slots[index] = to;
        self.cond.notify_all();
    }
}

impl std::fmt::Debug for SlotRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("SlotRing")
            .field("slot_len", &self.slot_len)
            .field("write", &st.write)
            .field("read", &st.read)
            .field("full", &st.full)
            .field("closed", &st.closed)
            .finish()
    }
}

/// A slot claimed by the producer. Committing (explicitly or on drop) makes it
/// visible to the consumer.
pub struct WriteSlot<'a> {
    ring: &'a SlotRing,
    index: usize,
    data: Option<MutexGuard<'a, SlotData>>,
    len: usize,
}

impl WriteSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Commit only the first `len` samples (clamped to the slot length).
    pub fn commit(mut self, len: usize) {
        self.len = len.min(self.ring.slot_len);
    }

    /// Commit the whole slot.
    pub fn release(self) {}
}

impl Deref for WriteSlot<'_> {
    type Target = [i16];

    fn deref(&self) -> &[i16] {
        match &self.data {
            Some(d) => &d.samples,
            None => &[],
        }
    }
}

impl DerefMut for WriteSlot<'_> {
    fn deref_mut(&mut self) -> &mut [i16] {
        match &mut self.data {
            Some(d) => &mut d.samples,
            None => &mut [],
        }
    }
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        if let Some(mut d) = self.data.take() {
            d.len = self.len;
        }
        self.ring.transition(self.index, SlotState::Ready);
    }
}

/// A slot claimed by the consumer. Releasing (explicitly or on drop) returns
/// it to the free pool.
pub struct ReadSlot<'a> {
    ring: &'a SlotRing,
    index: usize,
    data: Option<MutexGuard<'a, SlotData>>,
}

impl ReadSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn release(self) {}
}

impl Deref for ReadSlot<'_> {
    type Target = [i16];

    fn deref(&self) -> &[i16] {
        match &self.data {
            Some(d) => &d.samples[..d.len],
            None => &[],
        }
    }
}

impl Drop for ReadSlot<'_> {
    fn drop(&mut self) {
        self.data.take();
        self.ring.transition(self.index, SlotState::Free);
    }
}
