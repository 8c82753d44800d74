//! Reset Orchestrator (spec.md section 4.7): the workqueue-serialized
//! teardown/settle/reinit sequence, plus the generic single-threaded
//! workqueue it runs on (SPEC_FULL.md section 1's `std::thread` +
//! `mpsc::Sender` stand-in for `create_singlethread_workqueue`).

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::config::ResetConfig;
use crate::error::Result;
use crate::node::Node;

/// Probes whether the device endpoint is currently present on the bus
/// (spec.md section 4.7 step 4). Injected so the settle loop is testable
/// without real PCI hotplug.
pub trait PresencePoll: Send + Sync {
    fn is_present(&self) -> bool;
}

pub struct AlwaysPresent;

impl PresencePoll for AlwaysPresent {
    fn is_present(&self) -> bool {
        true
    }
}

/// spec.md section 4.7 steps 1-2: acquire both reset serializers in
/// Mgmt-before-Ops order. A veto on either leaves both nodes exactly as they
/// were (spec.md section 8 scenario 5).
pub fn begin_reset_sequence(mgmt: &Node, ops: &Node) -> Result<()> {
    mgmt.begin_reset()?;
    if let Err(err) = ops.begin_reset() {
        mgmt.end_reset();
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Reinitialized,
    InsufficientUptime,
}

/// spec.md section 4.7 steps 4-5: tear down both nodes, poll presence at
/// `poll_interval` granularity accumulating a contiguous up-time counter,
/// re-initialize once that counter clears `max_estimated_downtime_ms`, and
/// always release both reset serializers in reverse acquisition order.
pub fn settle_and_reinit(
    mgmt: &Node,
    ops: &Node,
    cfg: &ResetConfig,
    poll_interval: Duration,
    presence: &dyn PresencePoll,
    reinit: impl FnOnce() -> Result<()>,
) -> ResetOutcome {
    mgmt.teardown();
    ops.teardown();

    let step_ms = (poll_interval.as_millis() as u64).max(1);
    let mut up_time_ms = 0u64;
    let mut total_wait_ms = 0u64;
    let mut timed_out = false;
    loop {
        if up_time_ms >= cfg.max_estimated_downtime_ms {
            break;
        }
        if total_wait_ms >= cfg.discovery_timeout_ms {
            timed_out = true;
            break;
        }
        thread::sleep(poll_interval);
        total_wait_ms += step_ms;
        if presence.is_present() {
            up_time_ms += step_ms;
        } else {
            up_time_ms = 0;
        }
    }

    let outcome = if timed_out {
        log::error!("reset settle timed out before reaching required up-time");
        ResetOutcome::InsufficientUptime
    } else {
        match reinit() {
            Ok(()) => ResetOutcome::Reinitialized,
            Err(err) => {
                log::error!("reset reinit failed: {err}");
                ResetOutcome::InsufficientUptime
            }
        }
    };

    if outcome == ResetOutcome::InsufficientUptime {
        mgmt.mark_not_responding();
        ops.mark_not_responding();
    }
    ops.end_reset();
    mgmt.end_reset();
    outcome
}

/// Single dedicated worker thread draining a FIFO queue of boxed jobs,
/// matching `create_singlethread_workqueue` semantics (spec.md section 4.7
/// step 3: "enqueue a work item ... and return success").
pub struct ResetWorkqueue {
    sender: Option<mpsc::Sender<Box<dyn FnOnce() + Send>>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ResetWorkqueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
        let worker = thread::spawn(move || {
            for job in receiver {
                job();
            }
        });
        Self { sender: Some(sender), worker: Some(worker) }
    }

    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }
}

impl Default for ResetWorkqueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResetWorkqueue {
    fn drop(&mut self) {
        // Drop the sender first so the worker's receiver loop terminates
        // after draining whatever is still queued.
        self.sender.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
