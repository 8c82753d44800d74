//! Rate and error-count telemetry (SPEC_FULL.md section 2, grounded on
//! `et_rate_entry.h`, `et_sysfs_err_stats.c`, `et_sysfs_mem_stats.c`).
//! Published read-only by [`crate::node::Node`] / [`crate::device::DeviceInstance`];
//! formatting for sysfs show-functions is out of scope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::DriverError;

/// A monotonic count plus a rolling one-second rate, as `et_rate_entry.h`
/// tracks per message class.
pub struct RateEntry {
    total: AtomicU64,
    window: Mutex<Window>,
}

struct Window {
    started_at: Instant,
    count: u64,
    last_rate: f64,
}

impl RateEntry {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            window: Mutex::new(Window { started_at: Instant::now(), count: 0, last_rate: 0.0 }),
        }
    }

    pub fn record(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
        let mut window = self.window.lock().unwrap();
        let elapsed = window.started_at.elapsed();
        if elapsed >= Duration::from_secs(1) {
            window.last_rate = window.count as f64 / elapsed.as_secs_f64();
            window.count = n;
            window.started_at = Instant::now();
        } else {
            window.count += n;
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Rate observed over the last completed one-second window.
    pub fn rate_per_sec(&self) -> f64 {
        self.window.lock().unwrap().last_rate
    }
}

impl Default for RateEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-node error counters (`et_sysfs_err_stats.c`), one atomic per semantic
/// error kind from spec.md section 7.
#[derive(Default)]
pub struct ErrorCounters {
    pub invalid_argument: AtomicU64,
    pub bus_fault: AtomicU64,
    pub not_ready: AtomicU64,
    pub unclean: AtomicU64,
    pub busy: AtomicU64,
    pub perm: AtomicU64,
    pub again: AtomicU64,
    pub no_mem: AtomicU64,
    pub no_dev: AtomicU64,
    pub op_not_supp: AtomicU64,
    pub fault: AtomicU64,
}

impl ErrorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter matching `err`'s variant. Called at every
    /// ioctl-boundary error return (spec.md section 7's propagation policy).
    pub fn record(&self, err: &DriverError) {
        let counter = match err {
            DriverError::InvalidArgument(_) => &self.invalid_argument,
            DriverError::BusFault(_) => &self.bus_fault,
            DriverError::NotReady => &self.not_ready,
            DriverError::Unclean => &self.unclean,
            DriverError::Busy => &self.busy,
            DriverError::Perm(_) => &self.perm,
            DriverError::Again => &self.again,
            DriverError::NoMem(_) => &self.no_mem,
            DriverError::NoDev => &self.no_dev,
            DriverError::OpNotSupp(_) => &self.op_not_supp,
            DriverError::Fault => &self.fault,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-node memory counters (`et_sysfs_mem_stats.c`): coherent DMA buffer
/// accounting.
#[derive(Default)]
pub struct MemCounters {
    /// Count of coherent buffers currently allocated ("CMA allocated").
    pub cma_allocated: AtomicU64,
    pub dma_mappings_active: AtomicU64,
}

impl MemCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_mapping_created(&self) {
        self.cma_allocated.fetch_add(1, Ordering::Relaxed);
        self.dma_mappings_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_mapping_freed(&self) {
        self.cma_allocated.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_vma_closed(&self) {
        self.dma_mappings_active.fetch_sub(1, Ordering::Relaxed);
    }
}
