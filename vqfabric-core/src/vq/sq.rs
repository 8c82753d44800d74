//! Submission Queue (spec.md section 4.2 `SQ.push`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use vqfabric_abi::CommonHeader;

use crate::circbuf::{self, DeviceCircularBuffer, LocalShadow, SyncFlags};
use crate::error::{DriverError, Result};

use super::common::VqCommon;

struct SqState {
    local: LocalShadow,
    remote: DeviceCircularBuffer,
}

pub struct Sq {
    pub index: usize,
    state: Mutex<SqState>,
    threshold: AtomicU64,
    common: Arc<VqCommon>,
}

impl Sq {
    pub fn new(index: usize, payload_len: usize, common: Arc<VqCommon>) -> Self {
        let remote = DeviceCircularBuffer::new(payload_len);
        let local = LocalShadow::from_device(&remote);
        // spec.md section 4.2: threshold defaults to one quarter of the buffer.
        let default_threshold = (payload_len as u64 / 4).max(1);
        let sq = Self {
            index,
            state: Mutex::new(SqState { local, remote }),
            threshold: AtomicU64::new(default_threshold),
            common,
        };
        sq.reevaluate_bit();
        sq
    }

    pub fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::Acquire)
    }

    /// spec.md section 4.2 "Availability semantics": user may set this to any
    /// value in `[1, len-1]`; resetting triggers an immediate re-evaluation.
    pub fn set_threshold(&self, value: u64) -> Result<()> {
        let state = self.state.lock().unwrap();
        let len = state.local.len;
        if value == 0 || value >= len {
            return Err(DriverError::InvalidArgument(format!(
                "threshold {value} out of range [1, {})",
                len
            )));
        }
        drop(state);
        self.threshold.store(value, Ordering::Release);
        self.reevaluate_bit();
        Ok(())
    }

    fn free_bytes(&self) -> u64 {
        self.state.lock().unwrap().local.free()
    }

    /// Whether the device has consumed everything this SQ has pushed so far
    /// (spec.md section 4.7's `PENDING_COMMANDS` flag is the negation).
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().local.used() == 0
    }

    fn reevaluate_bit(&self) {
        let ready = self.free_bytes() >= self.threshold();
        self.common.set_sq_bit(self.index, ready);
    }

    /// Frame and push one whole message. `message` is the header-prefixed
    /// byte buffer exactly as spec.md section 4.2 describes: `size` is the
    /// byte length of the framed message including the header.
    pub fn push(&self, message: &[u8]) -> Result<()> {
        if message.len() < CommonHeader::SIZE {
            return Err(DriverError::InvalidArgument(format!(
                "message size {} smaller than header {}",
                message.len(),
                CommonHeader::SIZE
            )));
        }
        let header = CommonHeader::from_bytes(message)
            .ok_or_else(|| DriverError::InvalidArgument("malformed header".into()))?;
        if header.size as usize > message.len() {
            return Err(DriverError::InvalidArgument(
                "header declares size larger than supplied buffer".into(),
            ));
        }
        if (header.size as usize) < CommonHeader::SIZE {
            return Err(DriverError::InvalidArgument(format!(
                "header declares size {} smaller than header length {}",
                header.size,
                CommonHeader::SIZE
            )));
        }
        let framed = &message[..header.size as usize];

        let mut state = self.state.lock().unwrap();
        let sync = SyncFlags::SYNC_FOR_HOST | SyncFlags::SYNC_FOR_DEVICE;
        let push_result = {
            let SqState { local, remote } = &mut *state;
            circbuf::push(local, remote, framed, sync)
        };
        if push_result.is_err() {
            drop(state);
            self.common.set_sq_bit(self.index, false);
            return Err(DriverError::Again);
        }
        drop(state);

        self.common.ring_sq(self.index);
        self.reevaluate_bit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vq::common::NullDoorbell;

    fn sq(payload_len: usize) -> Sq {
        let common = Arc::new(VqCommon::new(1, 0, payload_len, 0, Box::new(NullDoorbell)));
        Sq::new(0, payload_len, common)
    }

    fn framed(tag: u16, msg_id: u16, payload: &[u8]) -> Vec<u8> {
        let header = CommonHeader {
            size: (CommonHeader::SIZE + payload.len()) as u16,
            tag_id: tag,
            msg_id,
        };
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn push_success_rings_doorbell_and_advances_bitmap() {
        let queue = sq(64);
        assert!(queue.common.poll_out_ready());
        queue.push(&framed(1, 7, b"hi")).unwrap();
        assert!(queue.common.poll_out_ready());
    }

    #[test]
    fn push_rejects_undersized_buffer() {
        let queue = sq(64);
        let err = queue.push(&[0u8; 2]).unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[test]
    fn push_rejects_header_size_smaller_than_header_itself() {
        let queue = sq(64);
        let mut buf = framed(1, 7, b"hi");
        let header = CommonHeader { size: 3, tag_id: 1, msg_id: 7 };
        buf[..CommonHeader::SIZE].copy_from_slice(&header.to_bytes());
        let err = queue.push(&buf).unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[test]
    fn push_full_queue_returns_again_and_clears_bit() {
        let queue = sq(16);
        // payload len 16, header is 6 bytes -> first push consumes all 16.
        queue.push(&framed(0, 0, &[0u8; 10])).unwrap();
        let err = queue.push(&framed(0, 0, &[0u8; 10])).unwrap_err();
        assert!(matches!(err, DriverError::Again));
        assert!(!queue.common.poll_out_ready());
    }

    #[test]
    fn set_threshold_rejects_out_of_range() {
        let queue = sq(64);
        assert!(queue.set_threshold(0).is_err());
        assert!(queue.set_threshold(64).is_err());
        assert!(queue.set_threshold(63).is_ok());
    }

    #[test]
    fn set_threshold_reflects_immediately_in_bitmap() {
        let queue = sq(64);
        queue.set_threshold(1).unwrap();
        assert!(queue.common.poll_out_ready());
        queue.set_threshold(63).unwrap();
        assert!(!queue.common.poll_out_ready());
    }
}
