//! Ioctl dispatch (spec.md section 6): one function per command in the ioctl
//! surface table, each a safe wrapper over a [`Node`]/[`DeviceInstance`]
//! method. Decoding the actual `ioctl()` syscall argument (`copy_from_user`
//! of the request struct) is the external collaborator's job; this module
//! only implements the semantics once the request has been unpacked.

use vqfabric_abi::{DeviceConfig, DramInfo, PushFlags, TraceBufferType};

use crate::device::DriverState;
use crate::dma::UserMemory;
use crate::error::{DriverError, Result};
use crate::mmio;
use crate::node::{Node, NodeState};
use crate::region::NodeKind;
use crate::vq::cq::UserMessageNode;

/// spec.md section 6 "Poll mask construction".
pub fn poll_mask(node: &Node) -> i16 {
    let mut mask = 0i16;
    if !node.is_initialized() {
        mask |= libc::POLLHUP as i16;
    }
    if node.poll_out_ready() {
        mask |= libc::POLLOUT as i16;
    }
    if node.poll_in_ready() {
        mask |= libc::POLLIN as i16;
    }
    mask
}

/// `GET_DEVICE_STATE`: always permitted.
pub fn get_device_state(node: &Node) -> NodeState {
    node.state()
}

/// `GET_PCIBUS_DEVICE_NAME(N)`: copies the bus-function-slot string plus a
/// trailing NUL, returning the length written.
pub fn get_pcibus_device_name(
    bus_name: &str,
    dest_vaddr: u64,
    dest_len: usize,
    user_memory: &dyn UserMemory,
) -> Result<usize> {
    let needed = bus_name.len() + 1;
    if needed > dest_len {
        return Err(DriverError::NoMem(format!(
            "buffer of {dest_len} bytes too small for {needed}-byte bus name"
        )));
    }
    let mut bytes = bus_name.as_bytes().to_vec();
    bytes.push(0);
    user_memory.copy_to_user(dest_vaddr, &bytes)?;
    Ok(needed)
}

/// `GET_USER_DRAM_INFO`: describes the ops host-managed region.
pub fn get_user_dram_info(node: &Node, region_type: u32) -> Result<DramInfo> {
    let region = node.region(region_type)?;
    Ok(DramInfo {
        base: region.host_phys_base,
        size: region.size,
        dma_max_elem_size: region.access.dma_element_size,
        dma_max_elem_count: region.access.dma_element_count,
        align_in_bits: region.access.dma_alignment_bits as u16,
    })
}

/// Mgmt's trace region lives at region type 0; the selector only
/// distinguishes which logical buffer the firmware multiplexes onto it.
fn validate_trace_buffer_type(raw_type: u8) -> Result<TraceBufferType> {
    TraceBufferType::from_u8(raw_type)
        .ok_or_else(|| DriverError::InvalidArgument(format!("unknown trace buffer type {raw_type}")))
}

/// `GET_TRACE_BUFFER_SIZE`.
pub fn get_trace_buffer_size(node: &Node, raw_type: u8) -> Result<u64> {
    validate_trace_buffer_type(raw_type)?;
    Ok(node.region(0)?.size)
}

/// `EXTRACT_TRACE_BUFFER`: bulk-reads the trace region (backed here by
/// `region_window`, the mapped BAR window's bytes) into a staging buffer and
/// copies it out to user space.
pub fn extract_trace_buffer(
    node: &Node,
    raw_type: u8,
    region_window: &[u8],
    dest_vaddr: u64,
    user_memory: &dyn UserMemory,
) -> Result<usize> {
    validate_trace_buffer_type(raw_type)?;
    let region = node.region(0)?;
    let len = region.size as usize;
    if region_window.len() < len {
        return Err(DriverError::BusFault(
            "trace region window smaller than advertised size".into(),
        ));
    }
    let staged = mmio::read(region_window, 0, len);
    user_memory.copy_to_user(dest_vaddr, &staged)?;
    Ok(len)
}

/// `FW_UPDATE`: staged bulk-write to the Mgmt scratch region (region type 1).
pub fn fw_update(node: &Node, region_window: &mut [u8], offset: usize, data: &[u8]) -> Result<()> {
    let region = node.region(1)?;
    let region_len = region.size as usize;
    let overruns = match offset.checked_add(data.len()) {
        Some(end) => end > region_len,
        None => true,
    };
    if overruns {
        return Err(DriverError::InvalidArgument(
            "firmware update write overruns scratch region".into(),
        ));
    }
    if region_window.len() < region_len {
        return Err(DriverError::NoMem(
            "scratch region window smaller than advertised size".into(),
        ));
    }
    mmio::write(region_window, offset, data);
    Ok(())
}

/// `GET_SQ_COUNT`.
pub fn get_sq_count(node: &Node) -> Result<u16> {
    node.sq_count()
}

/// `GET_SQ_MAX_MSG_SIZE`.
pub fn get_sq_max_msg_size(node: &Node) -> Result<u16> {
    node.max_sq_msg_size()
}

/// `GET_DEVICE_CONFIGURATION`.
pub fn get_device_configuration(node: &Node) -> Result<DeviceConfig> {
    node.device_config()
}

/// `GET_SQ_AVAIL_BITMAP`.
pub fn get_sq_avail_bitmap(node: &Node) -> Result<u64> {
    node.sq_avail_bitmap()
}

/// `GET_CQ_AVAIL_BITMAP`.
pub fn get_cq_avail_bitmap(node: &Node) -> Result<u64> {
    node.cq_avail_bitmap()
}

/// `GET_P2PDMA_DEVICE_COMPAT_BITMAP`.
pub fn get_p2pdma_device_compat_bitmap(driver: &DriverState, devnum: u8) -> u64 {
    driver.p2p.get_compat_bitmap(devnum)
}

/// `SET_SQ_THRESHOLD`.
pub fn set_sq_threshold(node: &Node, sq_index: u16, bytes_needed: u16) -> Result<()> {
    node.set_sq_threshold(sq_index as usize, bytes_needed as u64)
}

/// `POP_CQ`.
pub fn pop_cq(node: &Node, cq_index: usize, user_memory: &dyn UserMemory) -> Result<UserMessageNode> {
    node.pop_cq(cq_index, user_memory)
}

/// spec.md section 6 "PUSH_SQ flag exclusions".
fn validate_push_flags(kind: NodeKind, flags: PushFlags) -> Result<()> {
    if flags.intersects(PushFlags::DMA | PushFlags::P2PDMA) && flags.contains(PushFlags::HIGH_PRIORITY) {
        return Err(DriverError::InvalidArgument(
            "DMA/P2PDMA and HIGH_PRIORITY are mutually exclusive".into(),
        ));
    }
    if kind == NodeKind::Ops && flags.intersects(PushFlags::MM_RESET | PushFlags::ETSOC_RESET) {
        return Err(DriverError::InvalidArgument("reset flags are Mgmt-only".into()));
    }
    if kind == NodeKind::Mgmt && flags.intersects(PushFlags::DMA | PushFlags::HIGH_PRIORITY) {
        return Err(DriverError::InvalidArgument("DMA/HIGH_PRIORITY are Ops-only".into()));
    }
    Ok(())
}

/// `PUSH_SQ`. `mgmt` must be the pushing node when a reset flag is set;
/// `ops` is only consulted (and armed) for `ETSOC_RESET`, which resets the
/// whole endpoint rather than just the Mgmt side.
pub fn push_sq(
    mgmt_or_ops: &Node,
    ops_peer: Option<&Node>,
    sq_index: usize,
    message: &[u8],
    flags: PushFlags,
) -> Result<()> {
    validate_push_flags(mgmt_or_ops.kind, flags)?;

    let mut armed_peer = false;
    if flags.contains(PushFlags::ETSOC_RESET) {
        let peer = ops_peer
            .ok_or_else(|| DriverError::InvalidArgument("ETSOC_RESET requires the Ops peer".into()))?;
        mgmt_or_ops.begin_reset()?;
        if let Err(err) = peer.begin_reset() {
            mgmt_or_ops.end_reset();
            return Err(err);
        }
        armed_peer = true;
    } else if flags.contains(PushFlags::MM_RESET) {
        mgmt_or_ops.begin_reset()?;
    }

    let result = mgmt_or_ops.push_sq(sq_index, message);
    if result.is_err() && (flags.contains(PushFlags::MM_RESET) || flags.contains(PushFlags::ETSOC_RESET)) {
        if armed_peer {
            ops_peer.expect("armed_peer implies ops_peer is Some").end_reset();
        }
        mgmt_or_ops.end_reset();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::MemoryDirWindow;
    use crate::event::NullEventSink;
    use crate::vq::common::NullDoorbell;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use vqfabric_abi::{CommonHeader, DirHeader, RegionDescriptor, VqDescriptor};

    struct RecordingUserMemory {
        writes: Mutex<HashMap<u64, Vec<u8>>>,
    }

    impl RecordingUserMemory {
        fn new() -> Self {
            Self { writes: Mutex::new(HashMap::new()) }
        }
    }

    impl UserMemory for RecordingUserMemory {
        fn copy_to_user(&self, dest_vaddr: u64, data: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().insert(dest_vaddr, data.to_vec());
            Ok(())
        }
    }

    fn region_bytes(region_type: u32, bar_offset: u64, size: u64) -> Vec<u8> {
        let desc = RegionDescriptor {
            region_type,
            attribute_size: RegionDescriptor::SIZE as u32,
            bar_index: 0,
            io_access: 1,
            dma_element_size: 4096,
            dma_element_count: 1,
            dma_alignment_code: 0,
            bar_offset,
            dev_phys_base: 0x1000,
            size,
            ..Default::default()
        };
        desc.to_bytes().to_vec()
    }

    fn build_mgmt_dir(regions: &[Vec<u8>]) -> Vec<u8> {
        let vq = VqDescriptor {
            bar_index: 0,
            bar_size: 0x10000,
            sq_offset: 0,
            sq_count: 1,
            per_sq_size: 64,
            cq_offset: 0x1000,
            cq_count: 1,
            per_cq_size: 64,
            irq_trigger_offset: 0x2000,
            ..Default::default()
        };
        let mut tail = vq.to_bytes().to_vec();
        for r in regions {
            tail.extend_from_slice(r);
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&tail);
        let header = DirHeader {
            version: 1,
            total_size: (20 + DeviceConfig::SIZE + tail.len()) as u32,
            attribute_size: DeviceConfig::SIZE as u32,
            region_count: regions.len() as u32,
            crc32: hasher.finalize(),
            device_config: DeviceConfig::default(),
        };
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(&tail);
        out
    }

    fn init_mgmt_node() -> Node {
        let node = Node::new(NodeKind::Mgmt, 0);
        let regions = vec![
            region_bytes(0, 0x1000, 0x100),
            region_bytes(1, 0x2000, 0x200),
        ];
        let window = MemoryDirWindow { status: 11, data: build_mgmt_dir(&regions) };
        node.init(&window, 1, 0, &[], Box::new(NullDoorbell), Box::new(NullEventSink)).unwrap();
        node
    }

    #[test]
    fn poll_mask_reports_hup_before_init_and_clears_after() {
        let uninitialized = Node::new(NodeKind::Mgmt, 0);
        assert_ne!(poll_mask(&uninitialized) & libc::POLLHUP as i16, 0);

        let node = init_mgmt_node();
        assert_eq!(poll_mask(&node) & libc::POLLHUP as i16, 0);
        assert_ne!(poll_mask(&node) & libc::POLLOUT as i16, 0);
    }

    #[test]
    fn get_pcibus_device_name_rejects_small_buffer_and_copies_otherwise() {
        let user_memory = RecordingUserMemory::new();
        assert!(matches!(
            get_pcibus_device_name("0000:01:00.0", 0x4000, 4, &user_memory),
            Err(DriverError::NoMem(_))
        ));
        let len = get_pcibus_device_name("0000:01:00.0", 0x4000, 64, &user_memory).unwrap();
        assert_eq!(len, 13);
        assert_eq!(user_memory.writes.lock().unwrap()[&0x4000].last(), Some(&0u8));
    }

    #[test]
    fn get_user_dram_info_reports_region_and_rejects_invalid_type() {
        let node = init_mgmt_node();
        let info = get_user_dram_info(&node, 0).unwrap();
        assert_eq!(info.base, 0x1000);
        assert_eq!(info.size, 0x100);
        assert!(matches!(get_user_dram_info(&node, 9), Err(DriverError::Perm(_))));
    }

    #[test]
    fn trace_buffer_size_rejects_unknown_type_and_reports_region_size() {
        let node = init_mgmt_node();
        assert!(matches!(get_trace_buffer_size(&node, 200), Err(DriverError::InvalidArgument(_))));
        assert_eq!(get_trace_buffer_size(&node, TraceBufferType::ServiceProcessor as u8).unwrap(), 0x100);
    }

    #[test]
    fn extract_trace_buffer_copies_region_bytes_to_user() {
        let node = init_mgmt_node();
        let mut window = vec![0u8; 0x100];
        window[4] = 0xAB;
        let user_memory = RecordingUserMemory::new();
        let n = extract_trace_buffer(&node, 0, &window, 0x5000, &user_memory).unwrap();
        assert_eq!(n, 0x100);
        assert_eq!(user_memory.writes.lock().unwrap()[&0x5000][4], 0xAB);
    }

    #[test]
    fn fw_update_writes_into_scratch_region_and_rejects_overrun() {
        let node = init_mgmt_node();
        let mut window = vec![0u8; 0x200];
        fw_update(&node, &mut window, 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&window[0..4], &[1, 2, 3, 4]);
        assert!(matches!(
            fw_update(&node, &mut window, 0x1f0, &[0u8; 32]),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    fn framed(tag: u16, msg_id: u16, payload: &[u8]) -> Vec<u8> {
        let header = CommonHeader { size: (CommonHeader::SIZE + payload.len()) as u16, tag_id: tag, msg_id };
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn push_sq_rejects_high_priority_with_dma() {
        let node = init_mgmt_node();
        let err = push_sq(&node, None, 0, &framed(0, 0, b"hi"), PushFlags::DMA | PushFlags::HIGH_PRIORITY)
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[test]
    fn push_sq_rejects_dma_on_mgmt_node() {
        let node = init_mgmt_node();
        let err = push_sq(&node, None, 0, &framed(0, 0, b"hi"), PushFlags::DMA).unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[test]
    fn push_sq_rejects_reset_flags_on_ops_node() {
        let node = Node::new(NodeKind::Ops, 1);
        let err = push_sq(&node, None, 0, &framed(0, 0, b"hi"), PushFlags::MM_RESET).unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[test]
    fn etsoc_reset_arms_both_nodes_and_rolls_back_on_push_failure() {
        let mgmt = init_mgmt_node();
        let ops = Node::new(NodeKind::Ops, 1);
        // payload bigger than the SQ's 64-byte ring guarantees SQ.push fails
        // with `Again`, exercising the rollback path.
        let oversized = framed(0, 0, &[0u8; 100]);
        let err = push_sq(&mgmt, Some(&ops), 0, &oversized, PushFlags::ETSOC_RESET).unwrap_err();
        assert!(matches!(err, DriverError::Again));
        assert!(mgmt.begin_reset().is_ok());
        mgmt.end_reset();
        assert!(ops.begin_reset().is_ok());
        ops.end_reset();
    }

    #[test]
    fn get_sq_count_and_bitmap_reflect_initialized_state() {
        let node = init_mgmt_node();
        assert_eq!(get_sq_count(&node).unwrap(), 1);
        assert_eq!(get_sq_max_msg_size(&node).unwrap(), 64);
        assert_ne!(get_sq_avail_bitmap(&node).unwrap(), 0);
        assert_eq!(get_cq_avail_bitmap(&node).unwrap(), 0);
    }
}
