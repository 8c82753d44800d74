//! Wire-level structures shared between the driver core and the device, plus
//! the ioctl command numbers used at the character-device boundary.
//!
//! Nothing in this crate interprets payload bytes beyond the common message
//! header; the DIR layout and ioctl request/response shapes are the only
//! concrete formats the core is required to agree with the device on.

use bitflags::bitflags;

/// Magic number for this driver family's ioctl command space.
pub const IOCTL_MAGIC: u8 = b'Q';

/// Header present at the front of every SQ/CQ message (spec.md section 4.2).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommonHeader {
    /// Byte length of the framed message, including this header.
    pub size: u16,
    pub tag_id: u16,
    pub msg_id: u16,
}

impl CommonHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.size.to_ne_bytes());
        out[2..4].copy_from_slice(&self.tag_id.to_ne_bytes());
        out[4..6].copy_from_slice(&self.msg_id.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            size: u16::from_ne_bytes(bytes[0..2].try_into().ok()?),
            tag_id: u16::from_ne_bytes(bytes[2..4].try_into().ok()?),
            msg_id: u16::from_ne_bytes(bytes[4..6].try_into().ok()?),
        })
    }
}

/// Device-wide configuration block, transported but not interpreted by the
/// core (spec.md section 1: "The core does not interpret command payloads").
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub total_l3_size_kb: u32,
    pub total_l2_size_kb: u32,
    pub total_scp_size_kb: u32,
    pub ddr_bandwidth_mb_s: u32,
    pub minion_boot_freq_mhz: u32,
    pub compute_shire_mask: u32,
    pub form_factor: u8,
    pub tdp_watts: u8,
    pub cache_line_size: u8,
    pub num_l2_cache_banks: u8,
    pub sync_min_shire_id: u8,
    pub arch_revision: u8,
    pub devnum: u8,
    pub _reserved: u8,
}

impl DeviceConfig {
    pub const SIZE: usize = 32;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.total_l3_size_kb.to_ne_bytes());
        out[4..8].copy_from_slice(&self.total_l2_size_kb.to_ne_bytes());
        out[8..12].copy_from_slice(&self.total_scp_size_kb.to_ne_bytes());
        out[12..16].copy_from_slice(&self.ddr_bandwidth_mb_s.to_ne_bytes());
        out[16..20].copy_from_slice(&self.minion_boot_freq_mhz.to_ne_bytes());
        out[20..24].copy_from_slice(&self.compute_shire_mask.to_ne_bytes());
        out[24] = self.form_factor;
        out[25] = self.tdp_watts;
        out[26] = self.cache_line_size;
        out[27] = self.num_l2_cache_banks;
        out[28] = self.sync_min_shire_id;
        out[29] = self.arch_revision;
        out[30] = self.devnum;
        out[31] = self._reserved;
        out
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            total_l3_size_kb: u32::from_ne_bytes(b[0..4].try_into().ok()?),
            total_l2_size_kb: u32::from_ne_bytes(b[4..8].try_into().ok()?),
            total_scp_size_kb: u32::from_ne_bytes(b[8..12].try_into().ok()?),
            ddr_bandwidth_mb_s: u32::from_ne_bytes(b[12..16].try_into().ok()?),
            minion_boot_freq_mhz: u32::from_ne_bytes(b[16..20].try_into().ok()?),
            compute_shire_mask: u32::from_ne_bytes(b[20..24].try_into().ok()?),
            form_factor: b[24],
            tdp_watts: b[25],
            cache_line_size: b[26],
            num_l2_cache_banks: b[27],
            sync_min_shire_id: b[28],
            arch_revision: b[29],
            devnum: b[30],
            _reserved: b[31],
        })
    }
}

/// Fixed header at the front of the Device Information Region.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirHeader {
    pub version: u32,
    pub total_size: u32,
    pub attribute_size: u32,
    pub region_count: u32,
    pub crc32: u32,
    pub device_config: DeviceConfig,
}

impl DirHeader {
    pub const SIZE: usize = 20 + DeviceConfig::SIZE;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.version.to_ne_bytes());
        out[4..8].copy_from_slice(&self.total_size.to_ne_bytes());
        out[8..12].copy_from_slice(&self.attribute_size.to_ne_bytes());
        out[12..16].copy_from_slice(&self.region_count.to_ne_bytes());
        out[16..20].copy_from_slice(&self.crc32.to_ne_bytes());
        out[20..Self::SIZE].copy_from_slice(&self.device_config.to_bytes());
        out
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            version: u32::from_ne_bytes(b[0..4].try_into().ok()?),
            total_size: u32::from_ne_bytes(b[4..8].try_into().ok()?),
            attribute_size: u32::from_ne_bytes(b[8..12].try_into().ok()?),
            region_count: u32::from_ne_bytes(b[12..16].try_into().ok()?),
            crc32: u32::from_ne_bytes(b[16..20].try_into().ok()?),
            device_config: DeviceConfig::from_bytes(&b[20..Self::SIZE])?,
        })
    }
}

/// VQ descriptor advertised inside the DIR (spec.md section 4.3 step 6).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VqDescriptor {
    pub bar_index: u8,
    pub _reserved: [u8; 3],
    pub bar_size: u32,
    pub sq_offset: u32,
    pub sq_count: u16,
    pub per_sq_size: u16,
    pub cq_offset: u32,
    pub cq_count: u16,
    pub per_cq_size: u16,
    pub irq_trigger_offset: u32,
}

impl VqDescriptor {
    pub const SIZE: usize = 28;

    /// spec.md section 4.3 step 6: non-zero SQ/CQ counts and sizes, non-zero
    /// interrupt trigger size.
    pub fn has_compulsory_fields(&self) -> bool {
        self.sq_count != 0
            && self.cq_count != 0
            && self.per_sq_size != 0
            && self.per_cq_size != 0
            && self.irq_trigger_offset != 0
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.bar_index;
        out[1..4].copy_from_slice(&self._reserved);
        out[4..8].copy_from_slice(&self.bar_size.to_ne_bytes());
        out[8..12].copy_from_slice(&self.sq_offset.to_ne_bytes());
        out[12..14].copy_from_slice(&self.sq_count.to_ne_bytes());
        out[14..16].copy_from_slice(&self.per_sq_size.to_ne_bytes());
        out[16..20].copy_from_slice(&self.cq_offset.to_ne_bytes());
        out[20..22].copy_from_slice(&self.cq_count.to_ne_bytes());
        out[22..24].copy_from_slice(&self.per_cq_size.to_ne_bytes());
        out[24..28].copy_from_slice(&self.irq_trigger_offset.to_ne_bytes());
        out
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            bar_index: b[0],
            _reserved: [b[1], b[2], b[3]],
            bar_size: u32::from_ne_bytes(b[4..8].try_into().ok()?),
            sq_offset: u32::from_ne_bytes(b[8..12].try_into().ok()?),
            sq_count: u16::from_ne_bytes(b[12..14].try_into().ok()?),
            per_sq_size: u16::from_ne_bytes(b[14..16].try_into().ok()?),
            cq_offset: u32::from_ne_bytes(b[16..20].try_into().ok()?),
            cq_count: u16::from_ne_bytes(b[20..22].try_into().ok()?),
            per_cq_size: u16::from_ne_bytes(b[22..24].try_into().ok()?),
            irq_trigger_offset: u32::from_ne_bytes(b[24..28].try_into().ok()?),
        })
    }
}

/// One region entry in the DIR's region walk (spec.md section 4.3 step 7).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub region_type: u32,
    pub attribute_size: u32,
    pub bar_index: u8,
    pub io_access: u8,
    pub p2p_access: u8,
    pub privilege: u8,
    pub node_accessibility: u8,
    pub dma_alignment_code: u8,
    pub _reserved: u16,
    pub dma_element_size: u32,
    pub dma_element_count: u16,
    pub _reserved2: u16,
    pub bar_offset: u64,
    pub dev_phys_base: u64,
    pub size: u64,
}

impl RegionDescriptor {
    pub const SIZE: usize = 48;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.region_type.to_ne_bytes());
        out[4..8].copy_from_slice(&self.attribute_size.to_ne_bytes());
        out[8] = self.bar_index;
        out[9] = self.io_access;
        out[10] = self.p2p_access;
        out[11] = self.privilege;
        out[12] = self.node_accessibility;
        out[13] = self.dma_alignment_code;
        out[14..16].copy_from_slice(&self._reserved.to_ne_bytes());
        out[16..20].copy_from_slice(&self.dma_element_size.to_ne_bytes());
        out[20..22].copy_from_slice(&self.dma_element_count.to_ne_bytes());
        out[22..24].copy_from_slice(&self._reserved2.to_ne_bytes());
        out[24..32].copy_from_slice(&self.bar_offset.to_ne_bytes());
        out[32..40].copy_from_slice(&self.dev_phys_base.to_ne_bytes());
        out[40..48].copy_from_slice(&self.size.to_ne_bytes());
        out
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            region_type: u32::from_ne_bytes(b[0..4].try_into().ok()?),
            attribute_size: u32::from_ne_bytes(b[4..8].try_into().ok()?),
            bar_index: b[8],
            io_access: b[9],
            p2p_access: b[10],
            privilege: b[11],
            node_accessibility: b[12],
            dma_alignment_code: b[13],
            _reserved: u16::from_ne_bytes(b[14..16].try_into().ok()?),
            dma_element_size: u32::from_ne_bytes(b[16..20].try_into().ok()?),
            dma_element_count: u16::from_ne_bytes(b[20..22].try_into().ok()?),
            _reserved2: u16::from_ne_bytes(b[22..24].try_into().ok()?),
            bar_offset: u64::from_ne_bytes(b[24..32].try_into().ok()?),
            dev_phys_base: u64::from_ne_bytes(b[32..40].try_into().ok()?),
            size: u64::from_ne_bytes(b[40..48].try_into().ok()?),
        })
    }
}

/// Selector for `GET_TRACE_BUFFER_SIZE` / `EXTRACT_TRACE_BUFFER`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceBufferType {
    ServiceProcessor = 0,
    MasterMinion = 1,
    ComputeMinion = 2,
    ServiceProcessorStats = 3,
    MasterMinionStats = 4,
}

impl TraceBufferType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::ServiceProcessor,
            1 => Self::MasterMinion,
            2 => Self::ComputeMinion,
            3 => Self::ServiceProcessorStats,
            4 => Self::MasterMinionStats,
            _ => return None,
        })
    }
}

bitflags! {
    /// Flags accepted by `PUSH_SQ` (spec.md section 6, PUSH_SQ flag exclusions).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PushFlags: u8 {
        const DMA = 1 << 0;
        const MM_RESET = 1 << 1;
        const HIGH_PRIORITY = 1 << 2;
        const ETSOC_RESET = 1 << 3;
        const P2PDMA = 1 << 4;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DramInfo {
    pub base: u64,
    pub size: u64,
    pub dma_max_elem_size: u32,
    pub dma_max_elem_count: u16,
    pub align_in_bits: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SqThreshold {
    pub sq_index: u16,
    pub bytes_needed: u16,
}

/// Maximum length (incl. NUL) returned by `GET_PCIBUS_DEVICE_NAME`.
pub const PCI_BUS_NAME_MAX: usize = 64;

// Ioctl request codes. Payloads are moved through `*mut c_void`-typed structs
// at the Rust API boundary (see vqfabric-core::ioctl); the codes below just
// need a concrete type to compute the correct size for the ioctl number.
nix::ioctl_read!(ioctl_get_user_dram_info, IOCTL_MAGIC, 1, DramInfo);
nix::ioctl_write_ptr!(ioctl_fw_update, IOCTL_MAGIC, 2, u64);
nix::ioctl_read!(ioctl_get_sq_count, IOCTL_MAGIC, 3, u16);
nix::ioctl_read!(ioctl_get_sq_max_msg_size, IOCTL_MAGIC, 4, u16);
nix::ioctl_read!(ioctl_get_device_configuration, IOCTL_MAGIC, 5, DeviceConfig);
nix::ioctl_write_ptr!(ioctl_push_sq, IOCTL_MAGIC, 6, u64);
nix::ioctl_readwrite!(ioctl_pop_cq, IOCTL_MAGIC, 7, u64);
nix::ioctl_read!(ioctl_get_sq_avail_bitmap, IOCTL_MAGIC, 8, u64);
nix::ioctl_read!(ioctl_get_cq_avail_bitmap, IOCTL_MAGIC, 9, u64);
nix::ioctl_write_ptr!(ioctl_set_sq_threshold, IOCTL_MAGIC, 10, SqThreshold);
nix::ioctl_write_ptr!(ioctl_get_trace_buffer_size, IOCTL_MAGIC, 11, u8);
nix::ioctl_readwrite!(ioctl_extract_trace_buffer, IOCTL_MAGIC, 12, u64);
nix::ioctl_read!(ioctl_get_device_state, IOCTL_MAGIC, 13, u32);
nix::ioctl_read!(ioctl_get_pcibus_device_name, IOCTL_MAGIC, 14, u64);
nix::ioctl_read!(ioctl_get_p2pdma_device_compat_bitmap, IOCTL_MAGIC, 15, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_header_round_trips() {
        let h = CommonHeader { size: 16, tag_id: 7, msg_id: 42 };
        assert_eq!(CommonHeader::from_bytes(&h.to_bytes()), Some(h));
    }

    #[test]
    fn common_header_from_short_buffer_is_none() {
        assert_eq!(CommonHeader::from_bytes(&[0u8; 3]), None);
    }

    #[test]
    fn vq_descriptor_requires_all_compulsory_fields() {
        let mut vq = VqDescriptor {
            sq_count: 1,
            cq_count: 1,
            per_sq_size: 64,
            per_cq_size: 64,
            irq_trigger_offset: 0x100,
            ..Default::default()
        };
        assert!(vq.has_compulsory_fields());
        vq.cq_count = 0;
        assert!(!vq.has_compulsory_fields());
    }

    #[test]
    fn push_flags_exclusions_are_expressible() {
        let f = PushFlags::DMA | PushFlags::P2PDMA;
        assert!(f.contains(PushFlags::DMA));
        assert!(!f.contains(PushFlags::HIGH_PRIORITY));
    }

    #[test]
    fn dir_header_round_trips() {
        let h = DirHeader {
            version: 1,
            total_size: 4096,
            attribute_size: 64,
            region_count: 3,
            crc32: 0xdead_beef,
            device_config: DeviceConfig {
                total_l3_size_kb: 32768,
                devnum: 2,
                ..Default::default()
            },
        };
        assert_eq!(DirHeader::from_bytes(&h.to_bytes()), Some(h));
    }

    #[test]
    fn vq_descriptor_round_trips() {
        let vq = VqDescriptor {
            bar_index: 2,
            sq_count: 4,
            per_sq_size: 256,
            cq_count: 2,
            per_cq_size: 512,
            irq_trigger_offset: 0x800,
            ..Default::default()
        };
        assert_eq!(VqDescriptor::from_bytes(&vq.to_bytes()), Some(vq));
    }

    #[test]
    fn region_descriptor_round_trips() {
        let region = RegionDescriptor {
            region_type: 1,
            attribute_size: 48,
            bar_index: 0,
            io_access: 1,
            p2p_access: 0,
            privilege: 0,
            node_accessibility: 1,
            dma_alignment_code: 2,
            dma_element_size: 4096,
            dma_element_count: 16,
            bar_offset: 0x10000,
            dev_phys_base: 0x8_0000_0000,
            size: 0x20_0000,
            ..Default::default()
        };
        assert_eq!(RegionDescriptor::from_bytes(&region.to_bytes()), Some(region));
    }
}
