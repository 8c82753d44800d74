//! Circular buffer abstraction (spec.md section 4.1): a device-shared
//! `{ head, tail, len, buf[len] }` structure with a host-side local shadow of
//! head/tail/len plus a handle to the device-side copy.

use bitflags::bitflags;

use crate::mmio;

bitflags! {
    /// Controls whether push/pop refresh the shadow from the device before
    /// computing free/used space, and whether the pointer update is mirrored
    /// back to the device after the transfer (spec.md section 4.1).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SyncFlags: u8 {
        /// Refresh the consuming side's pointer from the device before acting.
        const SYNC_FOR_HOST = 1 << 0;
        /// Write the producing side's updated pointer back to the device.
        const SYNC_FOR_DEVICE = 1 << 1;
    }
}

/// Device-side circular buffer layout: a fixed `head`/`tail`/`len` prefix
/// followed by `len` bytes of payload, all living in MMIO space. Represented
/// here as a plain byte buffer standing in for the mapped region.
pub struct DeviceCircularBuffer {
    storage: Vec<u8>,
}

impl DeviceCircularBuffer {
    const HEADER_LEN: usize = 24; // head: u64, tail: u64, len: u64

    pub fn new(payload_len: usize) -> Self {
        let mut storage = vec![0u8; Self::HEADER_LEN + payload_len];
        storage[16..24].copy_from_slice(&(payload_len as u64).to_ne_bytes());
        Self { storage }
    }

    pub fn head(&self) -> u64 {
        u64::from_ne_bytes(self.storage[0..8].try_into().unwrap())
    }

    pub fn set_head(&mut self, v: u64) {
        self.storage[0..8].copy_from_slice(&v.to_ne_bytes());
    }

    pub fn tail(&self) -> u64 {
        u64::from_ne_bytes(self.storage[8..16].try_into().unwrap())
    }

    pub fn set_tail(&mut self, v: u64) {
        self.storage[8..16].copy_from_slice(&v.to_ne_bytes());
    }

    pub fn len(&self) -> u64 {
        u64::from_ne_bytes(self.storage[16..24].try_into().unwrap())
    }

    fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.storage[Self::HEADER_LEN..]
    }

    fn buf(&self) -> &[u8] {
        &self.storage[Self::HEADER_LEN..]
    }
}

/// Host-side shadow of a circular buffer's head/tail/len (spec.md section 4.1
/// "VQ Common State"/"SQ"/"CQ" local shadow fields).
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalShadow {
    pub head: u64,
    pub tail: u64,
    pub len: u64,
}

impl LocalShadow {
    pub fn from_device(remote: &DeviceCircularBuffer) -> Self {
        Self { head: remote.head(), tail: remote.tail(), len: remote.len() }
    }

    /// Bytes available for a producer to write.
    pub fn free(&self) -> u64 {
        self.len - self.used()
    }

    /// Bytes available for a consumer to read.
    pub fn used(&self) -> u64 {
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            self.len - self.tail + self.head
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircBufError {
    InsufficientSpace,
    InsufficientData,
    MessageTooLarge,
}

/// Push a whole message, splitting at the wrap boundary if necessary
/// (spec.md section 4.1 `push`).
pub fn push(
    local: &mut LocalShadow,
    remote: &mut DeviceCircularBuffer,
    buf: &[u8],
    sync: SyncFlags,
) -> Result<(), CircBufError> {
    let len = buf.len() as u64;
    if len > local.len {
        return Err(CircBufError::MessageTooLarge);
    }

    if sync.contains(SyncFlags::SYNC_FOR_HOST) {
        local.tail = remote.tail();
    }

    if local.free() < len {
        return Err(CircBufError::InsufficientSpace);
    }

    let cap = local.len as usize;
    let mut head = local.head as usize;
    let mut written = 0usize;
    while written < buf.len() {
        let to_wrap = cap - head;
        let chunk = to_wrap.min(buf.len() - written);
        mmio::write(remote.buf_mut(), head, &buf[written..written + chunk]);
        head = (head + chunk) % cap;
        written += chunk;
    }
    local.head = head as u64;

    if sync.contains(SyncFlags::SYNC_FOR_DEVICE) {
        remote.set_head(local.head);
    }

    Ok(())
}

/// Pop a whole message, splitting the read at the wrap boundary if necessary
/// (spec.md section 4.1 `pop`).
pub fn pop(
    local: &mut LocalShadow,
    remote: &mut DeviceCircularBuffer,
    len: usize,
    sync: SyncFlags,
) -> Result<Vec<u8>, CircBufError> {
    if sync.contains(SyncFlags::SYNC_FOR_HOST) {
        local.head = remote.head();
    }

    if local.used() < len as u64 {
        return Err(CircBufError::InsufficientData);
    }

    let cap = local.len as usize;
    let mut tail = local.tail as usize;
    let mut out = Vec::with_capacity(len);
    let mut remaining = len;
    while remaining > 0 {
        let to_wrap = cap - tail;
        let chunk = to_wrap.min(remaining);
        out.extend_from_slice(&mmio::read(remote.buf(), tail, chunk));
        tail = (tail + chunk) % cap;
        remaining -= chunk;
    }
    local.tail = tail as u64;

    if sync.contains(SyncFlags::SYNC_FOR_DEVICE) {
        remote.set_tail(local.tail);
    }

    Ok(out)
}

/// Non-consuming read at an offset into the device buffer (spec.md section
/// 4.1 `peek`), used to read a fixed-size header before sizing the payload
/// allocation.
pub fn peek(remote: &DeviceCircularBuffer, len: usize, peek_offset: usize) -> Vec<u8> {
    mmio::read(remote.buf(), peek_offset, len)
}
