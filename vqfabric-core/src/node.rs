//! Node: the Mgmt or Ops personality of a Device Instance (spec.md section 2,
//! section 3 "Node"). Owns the Open/Reset Gate, the DIR-derived Region Table
//! and VQ Set, and (for the Ops node) the DMA tag-correlation state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::dir::{self, DirWindow};
use crate::dma::{resolve_dma_response, DmaInfo, DmaInfoTable, UserMemory, VmaTable};
use crate::error::{DriverError, Result};
use crate::event::EventSink;
use crate::region::{BarRegionRecord, NodeKind, RegionTable};
use crate::telemetry::{ErrorCounters, MemCounters};
use crate::vq::common::Doorbell;
use crate::vq::cq::UserMessageNode;
use crate::vq::VqSet;

/// Serializes `open`/`release` against reset, and `begin_reset`/`end_reset`
/// against an open holder (spec.md section 3 invariants).
#[derive(Default)]
pub struct OpenGate {
    open: AtomicBool,
    resetting: AtomicBool,
}

impl OpenGate {
    pub fn open(&self) -> Result<()> {
        if self.resetting.load(Ordering::Acquire) {
            return Err(DriverError::Unclean);
        }
        self.open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| DriverError::Busy)
    }

    pub fn release(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// spec.md section 4.7 step 1/2: refuse with "in use" if the node is
    /// open; otherwise mark it resetting.
    pub fn begin_reset(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            return Err(DriverError::Perm("node is open".into()));
        }
        self.resetting.store(true, Ordering::Release);
        Ok(())
    }

    pub fn end_reset(&self) {
        self.resetting.store(false, Ordering::Release);
    }

    pub fn is_resetting(&self) -> bool {
        self.resetting.load(Ordering::Acquire)
    }
}

/// spec.md section 4.7 "State machine per node", plus the transient
/// `PENDING_COMMANDS` flag surfaced only in the `Ready` case.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    NotReady,
    Ready { pending_commands: bool },
    ResetInProgress,
    NotResponding,
}

struct Initialized {
    regions: RegionTable,
    vq: VqSet,
    device_config: vqfabric_abi::DeviceConfig,
}

/// One Mgmt or Ops node (spec.md section 3 "Node").
pub struct Node {
    pub kind: NodeKind,
    pub minor: u32,
    gate: OpenGate,
    not_responding: AtomicBool,
    state: Mutex<Option<Initialized>>,
    /// `Some` only for the Ops node (spec.md section 4.5's tag correlation is
    /// data-plane only).
    dma_info: Option<DmaInfoTable>,
    vma_table: Option<VmaTable>,
    pub errors: ErrorCounters,
    pub mem: MemCounters,
    loopback: bool,
}

impl Node {
    pub fn new(kind: NodeKind, minor: u32) -> Self {
        let is_ops = kind == NodeKind::Ops;
        Self {
            kind,
            minor,
            gate: OpenGate::default(),
            not_responding: AtomicBool::new(false),
            state: Mutex::new(None),
            dma_info: is_ops.then(DmaInfoTable::new),
            vma_table: is_ops.then(VmaTable::new),
            errors: ErrorCounters::new(),
            mem: MemCounters::new(),
            loopback: false,
        }
    }

    /// Same as [`new`](Self::new), but `push_sq` also drives the loopback
    /// command handler synchronously instead of (or alongside) the real
    /// device doorbell (spec.md section 4.6).
    #[cfg(feature = "loopback")]
    pub fn new_loopback(kind: NodeKind, minor: u32) -> Self {
        Self { loopback: true, ..Self::new(kind, minor) }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    /// spec.md section 4.3: waits for the DIR to report ready, parses it, and
    /// stands up the Region Table and VQ Set. Returns the new BAR records for
    /// the caller to fold into the device-wide overlap-checked list.
    pub fn init(
        &self,
        window: &dyn DirWindow,
        expected_version: u32,
        discovery_timeout_secs: u64,
        existing_bar_records: &[BarRegionRecord],
        doorbell: Box<dyn Doorbell>,
        event_sink: Box<dyn EventSink>,
    ) -> Result<Vec<BarRegionRecord>> {
        dir::wait_for_ready(window, self.kind, discovery_timeout_secs)?;
        let parsed = dir::parse(window, self.kind, expected_version, existing_bar_records)?;

        let vq = VqSet::with_event_sink(
            parsed.vq.sq_count as usize,
            parsed.vq.cq_count as usize,
            parsed.vq.per_sq_size as usize,
            parsed.vq.per_cq_size as usize,
            doorbell,
            event_sink,
        );

        *self.state.lock().unwrap() = Some(Initialized {
            regions: parsed.regions,
            vq,
            device_config: parsed.header.device_config,
        });
        self.not_responding.store(false, Ordering::Release);
        Ok(parsed.new_bar_records)
    }

    /// spec.md section 4.7 step 4: destroy VQs, drop the region table, and
    /// discard any outstanding DMA Info with a warning (spec.md section 4.5).
    pub fn teardown(&self) {
        let initialized = self.state.lock().unwrap().take();
        if let Some(Initialized { vq, .. }) = initialized {
            vq.abort();
        }
        if let Some(table) = &self.dma_info {
            let discarded = table.discard_all();
            if discarded > 0 {
                log::warn!("{:?}: discarded {discarded} pending DMA Info on teardown", self.kind);
            }
        }
    }

    pub fn mark_not_responding(&self) {
        self.not_responding.store(true, Ordering::Release);
    }

    /// spec.md section 4.7 "Queries expose four external states".
    pub fn state(&self) -> NodeState {
        if self.not_responding.load(Ordering::Acquire) {
            return NodeState::NotResponding;
        }
        if self.gate.is_resetting() {
            return NodeState::ResetInProgress;
        }
        let guard = self.state.lock().unwrap();
        match &*guard {
            None => NodeState::NotReady,
            Some(initialized) => {
                let pending = initialized.vq.sqs.iter().any(|sq| !sq.is_empty());
                NodeState::Ready { pending_commands: pending }
            }
        }
    }

    pub fn open(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(DriverError::NotReady);
        }
        self.gate.open()
    }

    pub fn release(&self) {
        self.gate.release();
    }

    pub fn is_open(&self) -> bool {
        self.gate.is_open()
    }

    pub fn begin_reset(&self) -> Result<()> {
        self.gate.begin_reset()
    }

    pub fn end_reset(&self) {
        self.gate.end_reset();
    }

    /// spec.md section 4.5: must be called before `PUSH_SQ` of a
    /// `DATA_READ`/`DATA_WRITE` command carrying `tag`.
    pub fn register_dma_info(&self, tag: u16, info: DmaInfo) -> Result<()> {
        self.dma_info
            .as_ref()
            .ok_or_else(|| DriverError::OpNotSupp("DMA tag correlation is Ops-only".into()))?
            .insert(tag, info)
    }

    pub fn vma_table(&self) -> Option<&VmaTable> {
        self.vma_table.as_ref()
    }

    pub fn push_sq(&self, sq_index: usize, message: &[u8]) -> Result<()> {
        let guard = self.state.lock().unwrap();
        let initialized = guard.as_ref().ok_or(DriverError::NotReady)?;
        initialized.vq.sq(sq_index)?.push(message)?;
        #[cfg(feature = "loopback")]
        if self.loopback {
            crate::loopback::drive(&initialized.vq, sq_index, message)?;
        }
        Ok(())
    }

    pub fn drain_cq(&self, cq_index: usize) -> Result<usize> {
        let guard = self.state.lock().unwrap();
        let initialized = guard.as_ref().ok_or(DriverError::NotReady)?;
        initialized.vq.cq(cq_index)?.drain()
    }

    /// `POP_CQ`: dequeues the oldest message and resolves any DMA
    /// correlation for it (spec.md section 4.2 step "POP_CQ").
    pub fn pop_cq(&self, cq_index: usize, user_memory: &dyn UserMemory) -> Result<UserMessageNode> {
        let node = {
            let guard = self.state.lock().unwrap();
            let initialized = guard.as_ref().ok_or(DriverError::NotReady)?;
            initialized.vq.cq(cq_index)?.pop_user_message()?
        };
        if let Some(table) = &self.dma_info {
            resolve_dma_response(table, node.header, &node.payload, user_memory)?;
        }
        Ok(node)
    }

    pub fn poll_out_ready(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|i| i.vq.common.poll_out_ready())
    }

    pub fn poll_in_ready(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|i| i.vq.common.poll_in_ready())
    }

    /// spec.md section 6 `GET_USER_DRAM_INFO` and related structural
    /// accessors: look up a region by type, rejecting an absent or invalid
    /// one with `ACCES`.
    pub fn region(&self, region_type: u32) -> Result<crate::region::MappedRegion> {
        let guard = self.state.lock().unwrap();
        let initialized = guard.as_ref().ok_or(DriverError::NotReady)?;
        initialized
            .regions
            .get(region_type)
            .filter(|r| r.valid)
            .cloned()
            .ok_or_else(|| DriverError::Perm("region invalid or not accessible".into()))
    }

    /// spec.md section 6 `GET_SQ_COUNT`.
    pub fn sq_count(&self) -> Result<u16> {
        let guard = self.state.lock().unwrap();
        let initialized = guard.as_ref().ok_or(DriverError::NotReady)?;
        Ok(initialized.vq.sqs.len() as u16)
    }

    /// spec.md section 6 `GET_SQ_MAX_MSG_SIZE`.
    pub fn max_sq_msg_size(&self) -> Result<u16> {
        let guard = self.state.lock().unwrap();
        let initialized = guard.as_ref().ok_or(DriverError::NotReady)?;
        Ok(initialized.vq.common.sq_size as u16)
    }

    /// spec.md section 6 `GET_DEVICE_CONFIGURATION`.
    pub fn device_config(&self) -> Result<vqfabric_abi::DeviceConfig> {
        let guard = self.state.lock().unwrap();
        let initialized = guard.as_ref().ok_or(DriverError::NotReady)?;
        Ok(initialized.device_config)
    }

    /// spec.md section 6 `GET_SQ_AVAIL_BITMAP`.
    pub fn sq_avail_bitmap(&self) -> Result<u64> {
        let guard = self.state.lock().unwrap();
        let initialized = guard.as_ref().ok_or(DriverError::NotReady)?;
        Ok(initialized.vq.common.sq_bitmap.load(std::sync::atomic::Ordering::Acquire))
    }

    /// spec.md section 6 `GET_CQ_AVAIL_BITMAP`.
    pub fn cq_avail_bitmap(&self) -> Result<u64> {
        let guard = self.state.lock().unwrap();
        let initialized = guard.as_ref().ok_or(DriverError::NotReady)?;
        Ok(initialized.vq.common.cq_bitmap.load(std::sync::atomic::Ordering::Acquire))
    }

    /// spec.md section 6 `SET_SQ_THRESHOLD`.
    pub fn set_sq_threshold(&self, sq_index: usize, bytes_needed: u64) -> Result<()> {
        let guard = self.state.lock().unwrap();
        let initialized = guard.as_ref().ok_or(DriverError::NotReady)?;
        initialized.vq.sq(sq_index)?.set_threshold(bytes_needed)
    }
}
