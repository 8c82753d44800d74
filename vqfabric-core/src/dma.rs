//! DMA Coherent Buffer lifecycle and tag-keyed DMA Info correlation
//! (spec.md section 4.5), grounded on `et_dma.c`/`et_dma.h`/`et_vma.h` and the
//! `dma_rbtree` correlation in `et_vqueue.c`'s `et_cqueue_copy_to_user`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vqfabric_abi::CommonHeader;

use crate::error::{DriverError, Result};

/// `DATA_READ_RSP`/`DATA_WRITE_RSP` message ids recognized by the tag
/// correlation path; everything else passes through untouched.
pub const MSG_ID_DATA_READ_RSP: u16 = 0x0010;
pub const MSG_ID_DATA_WRITE_RSP: u16 = 0x0011;

/// First payload byte of a DMA response: completion status.
pub const STATUS_COMPLETE: u8 = 0;

/// A coherent DMA buffer created by `mmap` (spec.md section 4.5 "User-visible
/// mapping"). Reference-counted the way a VMA's `open`/`close` hooks drive
/// the real allocation's lifetime.
pub struct DmaMapping {
    pub user_vaddr: u64,
    pub kernel_vaddr: u64,
    pub dma_addr: u64,
    pub size: usize,
    ref_count: AtomicUsize,
}

impl DmaMapping {
    pub fn new(user_vaddr: u64, kernel_vaddr: u64, dma_addr: u64, size: usize) -> Arc<Self> {
        Arc::new(Self {
            user_vaddr,
            kernel_vaddr,
            dma_addr,
            size,
            ref_count: AtomicUsize::new(1),
        })
    }

    /// VMA `open` hook: a new reference to an already-mapped buffer.
    pub fn vm_open(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// VMA `close` hook. Returns `true` when this was the last reference and
    /// the caller must now free the underlying buffer.
    pub fn vm_close(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn contains(&self, user_addr: u64) -> bool {
        user_addr >= self.user_vaddr && user_addr < self.user_vaddr + self.size as u64
    }
}

/// Lookup table of the coherent buffers currently mapped into a node's
/// address space, keyed by user virtual address (`et_vma.h`'s
/// `find_vma`-driven lookup).
#[derive(Default)]
pub struct VmaTable {
    mappings: Mutex<Vec<Arc<DmaMapping>>>,
}

impl VmaTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mapping: Arc<DmaMapping>) {
        self.mappings.lock().unwrap().push(mapping);
    }

    /// `find_vma_for`: the mapping whose range contains `addr`, if any.
    pub fn find_vma_for(&self, addr: u64) -> Option<Arc<DmaMapping>> {
        self.mappings.lock().unwrap().iter().find(|m| m.contains(addr)).cloned()
    }

    /// Drops a mapping once its last reference closes (spec.md section 4.5
    /// "the buffer is freed once its last mapping is torn down").
    pub fn remove(&self, user_vaddr: u64) {
        self.mappings.lock().unwrap().retain(|m| m.user_vaddr != user_vaddr);
    }

    pub fn len(&self) -> usize {
        self.mappings.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One pending tag correlation record (spec.md section 3 "DMA Info").
#[derive(Clone)]
pub struct DmaInfo {
    pub user_vaddr: u64,
    pub kernel_staging: Arc<Mutex<Vec<u8>>>,
    pub size: usize,
}

/// Tag-keyed ordered map of in-flight DMA requests, serialized by a single
/// mutex matching `et_dev->ops.dma_rbtree_mutex` (spec.md section 5 "Shared
/// resources").
#[derive(Default)]
pub struct DmaInfoTable {
    entries: Mutex<BTreeMap<u16, DmaInfo>>,
}

impl DmaInfoTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called strictly before the command carrying `tag` is pushed
    /// (spec.md section 3 invariant). Rejects a tag already in flight.
    pub fn insert(&self, tag: u16, info: DmaInfo) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&tag) {
            return Err(DriverError::InvalidArgument(format!(
                "tag {tag} already has a pending DMA Info"
            )));
        }
        entries.insert(tag, info);
        Ok(())
    }

    pub fn remove(&self, tag: u16) -> Option<DmaInfo> {
        self.entries.lock().unwrap().remove(&tag)
    }

    /// Node teardown: discard everything still pending, returning the count
    /// for the caller to log at warning level (spec.md section 7).
    pub fn discard_all(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let discarded = entries.len();
        entries.clear();
        discarded
    }

    pub fn pending_len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Copies bytes into a user-space destination (spec.md's "copy the staged
/// kernel buffer to the user's target"). A real implementation performs
/// `copy_to_user`; tests back it with an in-memory map.
pub trait UserMemory: Send + Sync {
    fn copy_to_user(&self, dest_vaddr: u64, data: &[u8]) -> Result<()>;
}

/// `POP_CQ`'s DMA correlation step (spec.md section 4.2 step "otherwise... if
/// the message id matches a DMA response"). Returns the removed [`DmaInfo`]
/// for the caller to account for, or `None` if this message wasn't a DMA
/// response.
pub fn resolve_dma_response(
    table: &DmaInfoTable,
    header: CommonHeader,
    payload: &[u8],
    user_memory: &dyn UserMemory,
) -> Result<Option<DmaInfo>> {
    if header.msg_id != MSG_ID_DATA_READ_RSP && header.msg_id != MSG_ID_DATA_WRITE_RSP {
        return Ok(None);
    }

    let info = table.remove(header.tag_id);
    if header.msg_id == MSG_ID_DATA_READ_RSP {
        if let Some(info) = &info {
            let status = payload.first().copied().unwrap_or(u8::MAX);
            if status == STATUS_COMPLETE {
                let staged = info.kernel_staging.lock().unwrap().clone();
                user_memory.copy_to_user(info.user_vaddr, &staged)?;
            }
        }
    }
    Ok(info)
}
