//! Completion Queue (spec.md section 4.2 CQ drain / `POP_CQ`).
//!
//! The device-facing half (`drain`) runs on the bottom-half/ISR-worker path
//! and moves whole messages out of the shared circular buffer into an
//! in-memory list, dispatching anything in the device-event range straight to
//! the [`EventSink`] instead of queuing it for a user read.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use vqfabric_abi::CommonHeader;

use crate::circbuf::{self, DeviceCircularBuffer, LocalShadow, SyncFlags};
use crate::error::{DriverError, Result};
use crate::event::{EventSink, NullEventSink};

use super::common::VqCommon;

/// spec.md section 4.2: message `msg_id`s in this range are device events
/// (telemetry, async notifications) consumed by the core itself rather than
/// delivered to a waiting `POP_CQ` caller.
pub const DEVICE_EVENT_MSG_ID_MIN: u16 = 0xE000;
pub const DEVICE_EVENT_MSG_ID_MAX: u16 = 0xEFFF;

fn is_device_event(header: &CommonHeader) -> bool {
    (DEVICE_EVENT_MSG_ID_MIN..=DEVICE_EVENT_MSG_ID_MAX).contains(&header.msg_id)
}

struct CqState {
    local: LocalShadow,
    remote: DeviceCircularBuffer,
}

/// One fully-drained message, queued for a later `POP_CQ`.
pub struct UserMessageNode {
    pub header: CommonHeader,
    pub payload: Vec<u8>,
}

pub struct Cq {
    pub index: usize,
    state: Mutex<CqState>,
    messages: Mutex<VecDeque<UserMessageNode>>,
    common: Arc<VqCommon>,
    event_sink: Box<dyn EventSink>,
}

impl Cq {
    pub fn new(index: usize, payload_len: usize, common: Arc<VqCommon>) -> Self {
        Self::with_event_sink(index, payload_len, common, Box::new(NullEventSink))
    }

    pub fn with_event_sink(
        index: usize,
        payload_len: usize,
        common: Arc<VqCommon>,
        event_sink: Box<dyn EventSink>,
    ) -> Self {
        let remote = DeviceCircularBuffer::new(payload_len);
        let local = LocalShadow::from_device(&remote);
        Self {
            index,
            state: Mutex::new(CqState { local, remote }),
            messages: Mutex::new(VecDeque::new()),
            common,
            event_sink,
        }
    }

    /// Drain every fully-arrived message currently sitting in the device
    /// buffer (spec.md section 4.2 "CQ ISR bottom half"). Stops as soon as a
    /// peek of the header comes back short of a whole message, which is the
    /// steady-state exit condition once the device's producer pauses.
    pub fn drain(&self) -> Result<usize> {
        let mut drained = 0usize;
        loop {
            let mut state = self.state.lock().unwrap();
            let CqState { local, remote } = &mut *state;
            local.head = remote.head();
            if local.used() < CommonHeader::SIZE as u64 {
                break;
            }

            let header_bytes = circbuf::peek(remote, CommonHeader::SIZE, local.tail as usize);
            let header = CommonHeader::from_bytes(&header_bytes)
                .ok_or_else(|| DriverError::BusFault("corrupt completion header".into()))?;
            if header.size == 0 {
                return Err(DriverError::BusFault(
                    "completion header declares zero size".into(),
                ));
            }
            if local.used() < header.size as u64 {
                break;
            }

            let sync = SyncFlags::SYNC_FOR_DEVICE;
            let framed = circbuf::pop(local, remote, header.size as usize, sync)?;
            drop(state);

            let payload = framed[CommonHeader::SIZE..].to_vec();
            if is_device_event(&header) {
                self.event_sink.handle_event(header, &payload);
            } else {
                self.messages
                    .lock()
                    .unwrap()
                    .push_back(UserMessageNode { header, payload });
                self.common.set_cq_bit(self.index, true);
            }
            drained += 1;
        }
        if self.messages.lock().unwrap().is_empty() {
            self.common.set_cq_bit(self.index, false);
        }
        Ok(drained)
    }

    /// `POP_CQ`: remove and return the oldest queued message, or `EAGAIN` if
    /// none is ready yet.
    pub fn pop_user_message(&self) -> Result<UserMessageNode> {
        let mut messages = self.messages.lock().unwrap();
        let node = messages.pop_front().ok_or(DriverError::Again)?;
        if messages.is_empty() {
            self.common.set_cq_bit(self.index, false);
        }
        Ok(node)
    }

    pub fn pending_len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    /// Injects a synthesized response straight into the user-facing queue,
    /// bypassing the shared circular buffer entirely (spec.md section 4.6:
    /// the loopback handler has no real device-side memory to drain from).
    #[cfg(feature = "loopback")]
    pub fn push_loopback_response(&self, header: CommonHeader, payload: Vec<u8>) {
        self.messages.lock().unwrap().push_back(UserMessageNode { header, payload });
        self.common.set_cq_bit(self.index, true);
    }
}
