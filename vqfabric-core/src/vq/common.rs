//! VQ Common State (spec.md section 3): the bitmaps, wait-queue, abort flag
//! and doorbell shared by every SQ/CQ belonging to one node.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

/// Rings the device doorbell for a submission queue, or in loopback builds,
/// drives the synthetic command handler directly (spec.md section 4.2 step 4,
/// section 4.6).
pub trait Doorbell: Send + Sync {
    fn ring_sq(&self, sq_index: usize);
}

/// A doorbell that does nothing; useful for unit tests of SQ/CQ logic that
/// don't exercise the ISR path.
pub struct NullDoorbell;

impl Doorbell for NullDoorbell {
    fn ring_sq(&self, _sq_index: usize) {}
}

pub struct VqCommon {
    pub sq_count: usize,
    pub cq_count: usize,
    pub sq_size: usize,
    pub cq_size: usize,

    /// Bit `i` set iff SQ `i` currently admits a producer (free(SQ_i) >= threshold_i).
    pub sq_bitmap: AtomicU64,
    /// Bit `i` set iff CQ `i` currently holds at least one user message.
    pub cq_bitmap: AtomicU64,

    aborting: AtomicBool,
    wait_lock: Mutex<()>,
    wait_cond: Condvar,

    doorbell: Box<dyn Doorbell>,
}

impl VqCommon {
    pub fn new(
        sq_count: usize,
        cq_count: usize,
        sq_size: usize,
        cq_size: usize,
        doorbell: Box<dyn Doorbell>,
    ) -> Self {
        Self {
            sq_count,
            cq_count,
            sq_size,
            cq_size,
            sq_bitmap: AtomicU64::new(0),
            cq_bitmap: AtomicU64::new(0),
            aborting: AtomicBool::new(false),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
            doorbell,
        }
    }

    pub fn ring_sq(&self, sq_index: usize) {
        self.doorbell.ring_sq(sq_index);
    }

    pub fn set_sq_bit(&self, index: usize, value: bool) {
        set_bit(&self.sq_bitmap, index, value);
    }

    pub fn set_cq_bit(&self, index: usize, value: bool) {
        set_bit(&self.cq_bitmap, index, value);
        self.wake_all();
    }

    pub fn poll_out_ready(&self) -> bool {
        self.sq_bitmap.load(Ordering::Acquire) != 0
    }

    pub fn poll_in_ready(&self) -> bool {
        self.cq_bitmap.load(Ordering::Acquire) != 0
    }

    /// spec.md section 5 "Cancellation / teardown": setting `aborting` wakes
    /// all waiters with "interrupted".
    pub fn abort(&self) {
        self.aborting.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::SeqCst)
    }

    fn wake_all(&self) {
        let _guard = self.wait_lock.lock().unwrap();
        self.wait_cond.notify_all();
    }

    /// Block the calling thread until woken (new CQ message, abort, or
    /// timeout), used to back `poll()`.
    pub fn wait_timeout(&self, timeout: std::time::Duration) {
        let guard = self.wait_lock.lock().unwrap();
        let _ = self.wait_cond.wait_timeout(guard, timeout);
    }
}

fn set_bit(bitmap: &AtomicU64, index: usize, value: bool) {
    debug_assert!(index < 64);
    if value {
        bitmap.fetch_or(1u64 << index, Ordering::AcqRel);
    } else {
        bitmap.fetch_and(!(1u64 << index), Ordering::AcqRel);
    }
}
