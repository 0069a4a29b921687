//! Cooperative CPU slot scheduler.
//!
//! Bounds how many CPU-heavy sections run at once across every session that
//! shares the scheduler. Work acquires a slot through [`CpuScheduler::lock_slot`]
//! and keeps it until the returned [`SlotGuard`] is dropped. Long scan loops
//! poll a [`YieldCheckpoint`]; when other work is queued the checkpoint hands
//! the slot over and waits its turn again (FIFO).
//!
//! The scheduler is an explicit value shared through [`crate::session::EngineContext`],
//! never an ambient global.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct SlotQueue {
    free: usize,
    waiting: VecDeque<u64>,
    next_ticket: u64,
}

/// Counters describing scheduler activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Slots granted through `lock_slot`.
    pub acquisitions: u64,
    /// Times a checkpoint handed its slot to queued work.
    pub yields: u64,
}

/// Slot-based admission control for CPU-bound work.
#[derive(Debug)]
pub struct CpuScheduler {
    slots: usize,
    queue: Mutex<SlotQueue>,
    available: Condvar,
    acquisitions: AtomicU64,
    yields: AtomicU64,
}

impl CpuScheduler {
    /// Create a scheduler with `slots` concurrent slots (at least one).
    pub fn new(slots: usize) -> Arc<Self> {
        let slots = slots.max(1);
        Arc::new(CpuScheduler {
            slots,
            queue: Mutex::new(SlotQueue {
                free: slots,
                waiting: VecDeque::new(),
                next_ticket: 0,
            }),
            available: Condvar::new(),
            acquisitions: AtomicU64::new(0),
            yields: AtomicU64::new(0),
        })
    }

    /// Total number of slots.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Slots not currently held.
    pub fn free_slots(&self) -> usize {
        self.queue.lock().free
    }

    /// Number of callers blocked waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.queue.lock().waiting.len()
    }

    /// Activity counters.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
        }
    }

    /// Block until a slot is free and take it.
    pub fn lock_slot(self: &Arc<Self>) -> SlotGuard {
        self.acquire();
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        SlotGuard {
            ticket: Arc::new(SlotTicket {
                scheduler: Arc::clone(self),
                held: AtomicBool::new(true),
            }),
        }
    }

    /// Take a slot only if one is free and nobody is queued for it.
    pub fn try_lock_slot(self: &Arc<Self>) -> Option<SlotGuard> {
        {
            let mut queue = self.queue.lock();
            if queue.free == 0 || !queue.waiting.is_empty() {
                return None;
            }
            queue.free -= 1;
        }
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        Some(SlotGuard {
            ticket: Arc::new(SlotTicket {
                scheduler: Arc::clone(self),
                held: AtomicBool::new(true),
            }),
        })
    }

    fn acquire(&self) {
        let mut queue = self.queue.lock();
        if queue.free > 0 && queue.waiting.is_empty() {
            queue.free -= 1;
            return;
        }

        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        queue.waiting.push_back(ticket);
        while !(queue.free > 0 && queue.waiting.front() == Some(&ticket)) {
            self.available.wait(&mut queue);
        }
        queue.waiting.pop_front();
        queue.free -= 1;
        if queue.free > 0 && !queue.waiting.is_empty() {
            self.available.notify_all();
        }
    }

    fn release(&self) {
        let mut queue = self.queue.lock();
        queue.free += 1;
        debug_assert!(queue.free <= self.slots);
        if !queue.waiting.is_empty() {
            self.available.notify_all();
        }
    }

    /// Give the slot back and queue for it again, but only if someone is
    /// waiting. Returns whether the slot changed hands.
    fn yield_slot(&self) -> bool {
        {
            let queue = self.queue.lock();
            if queue.waiting.is_empty() {
                return false;
            }
        }
        self.release();
        self.yields.fetch_add(1, Ordering::Relaxed);
        self.acquire();
        true
    }
}

#[derive(Debug)]
struct SlotTicket {
    scheduler: Arc<CpuScheduler>,
    held: AtomicBool,
}

/// A held CPU slot; released when dropped, on every exit path.
#[derive(Debug)]
pub struct SlotGuard {
    ticket: Arc<SlotTicket>,
}

impl SlotGuard {
    /// Hand the slot to queued work if there is any, then wait for it again.
    pub fn yield_if_necessary(&self) -> bool {
        self.ticket.held.load(Ordering::Acquire) && self.ticket.scheduler.yield_slot()
    }

    /// A checkpoint that yields this slot every `interval` units of work.
    pub fn checkpoint(&self, interval: u64) -> YieldCheckpoint {
        YieldCheckpoint {
            ticket: Some(Arc::clone(&self.ticket)),
            interval: interval.max(1),
            pending: 0,
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.ticket.held.swap(false, Ordering::AcqRel) {
            self.ticket.scheduler.release();
        }
    }
}

/// Fairness checkpoint polled from inside long scan loops.
///
/// A checkpoint outlives nothing: once the guard it came from is dropped,
/// ticks become no-ops.
#[derive(Debug, Clone)]
pub struct YieldCheckpoint {
    ticket: Option<Arc<SlotTicket>>,
    interval: u64,
    pending: u64,
}

impl YieldCheckpoint {
    /// A checkpoint not tied to any slot.
    pub fn disabled() -> Self {
        YieldCheckpoint {
            ticket: None,
            interval: u64::MAX,
            pending: 0,
        }
    }

    /// Record `units` of work, yielding once the interval is crossed.
    #[inline]
    pub fn tick(&mut self, units: u64) {
        self.pending += units;
        if self.pending >= self.interval {
            self.pending = 0;
            self.yield_now();
        }
    }

    /// Yield immediately if queued work is waiting for a slot.
    pub fn yield_now(&self) -> bool {
        match &self.ticket {
            Some(ticket) if ticket.held.load(Ordering::Acquire) => ticket.scheduler.yield_slot(),
            _ => false,
        }
    }
}

impl Default for YieldCheckpoint {
    fn default() -> Self {
        Self::disabled()
    }
}
