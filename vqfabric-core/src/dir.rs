//! Device Information Region parser (spec.md section 4.3): validates and
//! unpacks the self-describing capability block at a fixed DIR window, then
//! walks its region list into a [`RegionTable`](crate::region::RegionTable).

use std::time::Duration;

use vqfabric_abi::{DirHeader, RegionDescriptor, VqDescriptor};

use crate::error::{DriverError, Result};
use crate::mmio;
use crate::region::{
    AccessDescriptor, BarRegionRecord, MappedRegion, NodeKind, RegionTable,
};

/// Backing store for a DIR window: a 16-bit status word plus the raw DIR
/// bytes. Implemented directly over a byte buffer in tests and the loopback
/// build; a real BAR mapping would implement this over `__iomem` reads.
pub trait DirWindow {
    fn status(&self) -> u16;
    fn bytes(&self) -> &[u8];
}

/// Byte-buffer-backed [`DirWindow`], used by tests and the loopback device.
pub struct MemoryDirWindow {
    pub status: u16,
    pub data: Vec<u8>,
}

impl DirWindow for MemoryDirWindow {
    fn status(&self) -> u16 {
        self.status
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Monotonic staged boot status (spec.md's Open Questions note; `et_mgmt_dir.h`
/// / `et_ops_dir.h`'s `*_BOOT_STATUS_*` enums), preserved only to make a stuck
/// discovery diagnosable — readiness itself is still "status >= threshold".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootStage {
    DevNotReady,
    DevIntfNotReady,
    VqReady,
    DevIntfReady,
    MmReady,
    DevReady,
    /// Status word not recognized for this node kind, carried for logging.
    Unknown(u16),
}

impl BootStage {
    pub fn from_status(kind: NodeKind, status: u16) -> Self {
        match (kind, status) {
            (NodeKind::Mgmt, 0) => BootStage::DevNotReady,
            (NodeKind::Mgmt, 1) => BootStage::VqReady,
            (NodeKind::Mgmt, 11) => BootStage::DevReady,
            (NodeKind::Ops, 0) => BootStage::DevIntfNotReady,
            (NodeKind::Ops, 1) => BootStage::DevIntfReady,
            (NodeKind::Ops, 10) => BootStage::MmReady,
            (_, other) => BootStage::Unknown(other),
        }
    }
}

impl std::fmt::Display for BootStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootStage::DevNotReady => write!(f, "dev-not-ready"),
            BootStage::VqReady => write!(f, "vq-ready"),
            BootStage::DevReady => write!(f, "dev-ready"),
            BootStage::DevIntfNotReady => write!(f, "dev-intf-not-ready"),
            BootStage::DevIntfReady => write!(f, "dev-intf-ready"),
            BootStage::MmReady => write!(f, "mm-ready"),
            BootStage::Unknown(status) => write!(f, "unknown({status})"),
        }
    }
}

fn ready_threshold(kind: NodeKind) -> u16 {
    match kind {
        NodeKind::Mgmt => 11, // MGMT_BOOT_STATUS_DEV_READY
        NodeKind::Ops => 10,  // OPS_BOOT_STATUS_MM_READY
    }
}

/// spec.md section 4.3 step 1: poll at 1s granularity up to `timeout_secs`,
/// logging at 10s intervals. Timeout is fatal.
pub fn wait_for_ready(window: &dyn DirWindow, kind: NodeKind, timeout_secs: u64) -> Result<()> {
    let threshold = ready_threshold(kind);
    let mut last_status = 0u16;
    for i in 0..=timeout_secs {
        last_status = window.status();
        if last_status >= threshold {
            log::debug!(
                "{kind:?}: DIR ready, status={last_status} ({})",
                BootStage::from_status(kind, last_status)
            );
            return Ok(());
        }
        if i % 10 == 0 {
            log::debug!(
                "{kind:?}: DIR not ready, status={last_status} ({})",
                BootStage::from_status(kind, last_status)
            );
        }
        if i < timeout_secs {
            std::thread::sleep(Duration::from_secs(1));
        }
    }
    Err(DriverError::BusFault(format!(
        "{kind:?}: DIR discovery timed out, last status={last_status}"
    )))
}

/// Result of a full DIR parse: validated header, VQ descriptor and populated
/// region table, plus the new BAR records the caller must fold into the
/// device-wide overlap-checked list.
pub struct ParsedDir {
    pub header: DirHeader,
    pub vq: VqDescriptor,
    pub regions: RegionTable,
    pub new_bar_records: Vec<BarRegionRecord>,
}

/// spec.md section 4.3 steps 2-8. `existing_bar_records` is the device-wide
/// list (both nodes) checked for overlap before a new region is accepted.
pub fn parse(
    window: &dyn DirWindow,
    kind: NodeKind,
    expected_version: u32,
    existing_bar_records: &[BarRegionRecord],
) -> Result<ParsedDir> {
    let raw_len = window.bytes().len();

    // Step 2: total size, using the corrected predicate from spec.md's Open
    // Questions note (`(!dir_size) || (dir_size > max)`).
    let total_size = u32::from_ne_bytes(
        window.bytes()[4..8]
            .try_into()
            .map_err(|_| DriverError::BusFault("DIR window too small to hold a header".into()))?,
    );
    if total_size == 0 || total_size as usize > raw_len {
        return Err(DriverError::BusFault(format!(
            "DIR total_size {total_size} invalid for window of {raw_len} bytes"
        )));
    }

    // Step 3: bulk read through the byte-serializing accessor.
    let raw = mmio::read(window.bytes(), 0, total_size as usize);

    // Step 4: header.
    const HEADER_FIXED_PREFIX: usize = 20; // version,total_size,attribute_size,region_count,crc32
    if raw.len() < HEADER_FIXED_PREFIX {
        return Err(DriverError::BusFault("DIR shorter than fixed header prefix".into()));
    }
    let attribute_size = u32::from_ne_bytes(raw[8..12].try_into().unwrap()) as usize;
    let known_attr_size = vqfabric_abi::DeviceConfig::SIZE;
    if attribute_size < known_attr_size {
        return Err(DriverError::BusFault(format!(
            "DIR header attribute_size {attribute_size} smaller than known schema {known_attr_size}"
        )));
    }
    if attribute_size > known_attr_size {
        log::warn!(
            "DIR header attribute_size {attribute_size} exceeds known schema {known_attr_size}, ignoring extra bytes"
        );
    }
    let header = DirHeader::from_bytes(&raw[..HEADER_FIXED_PREFIX + known_attr_size])
        .ok_or_else(|| DriverError::BusFault("malformed DIR header".into()))?;
    if header.version != expected_version {
        log::warn!(
            "DIR version mismatch: expected {expected_version}, got {}",
            header.version
        );
    }
    let mut cursor = HEADER_FIXED_PREFIX + attribute_size;

    // Step 5: CRC32 over everything after the header.
    if cursor > raw.len() {
        return Err(DriverError::BusFault("DIR header overruns total_size".into()));
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&raw[cursor..]);
    let computed = hasher.finalize();
    if computed != header.crc32 {
        return Err(DriverError::BusFault(format!(
            "DIR CRC32 mismatch: computed {computed:#x}, advertised {:#x}",
            header.crc32
        )));
    }

    // Step 6: VQ descriptor.
    if cursor + VqDescriptor::SIZE > raw.len() {
        return Err(DriverError::BusFault("DIR truncated before VQ descriptor".into()));
    }
    let vq = VqDescriptor::from_bytes(&raw[cursor..cursor + VqDescriptor::SIZE])
        .ok_or_else(|| DriverError::BusFault("malformed VQ descriptor".into()))?;
    if !vq.has_compulsory_fields() {
        return Err(DriverError::BusFault(
            "VQ descriptor missing compulsory fields".into(),
        ));
    }
    cursor += VqDescriptor::SIZE;

    // Step 7: region walk.
    let mut regions = RegionTable::new(kind);
    let mut new_bar_records = Vec::new();
    let mut all_records: Vec<BarRegionRecord> = existing_bar_records.to_vec();

    for _ in 0..header.region_count {
        if cursor + RegionDescriptor::SIZE > total_size as usize {
            return Err(DriverError::BusFault("region section overruns DIR total_size".into()));
        }
        let desc = RegionDescriptor::from_bytes(&raw[cursor..cursor + RegionDescriptor::SIZE])
            .ok_or_else(|| DriverError::BusFault("malformed region descriptor".into()))?;

        let declared = desc.attribute_size as usize;
        if declared < RegionDescriptor::SIZE {
            return Err(DriverError::BusFault(format!(
                "region type {} attribute_size {declared} smaller than known schema",
                desc.region_type
            )));
        }
        if declared > RegionDescriptor::SIZE {
            log::warn!(
                "region type {} attribute_size {declared} exceeds known schema, ignoring extra bytes",
                desc.region_type
            );
        }
        cursor += declared;

        if desc.region_type >= kind.region_type_count() {
            log::warn!("unknown region type {}, skipping", desc.region_type);
            continue;
        }

        let access = AccessDescriptor::from_descriptor(&desc);
        if desc.size == 0 {
            return Err(DriverError::BusFault(format!(
                "region type {} missing compulsory size field",
                desc.region_type
            )));
        }

        let (io_chosen, p2p_chosen) = match (access.io_access, access.p2p_access) {
            (true, true) => {
                log::warn!(
                    "region type {} advertises both io and p2p access, choosing io",
                    desc.region_type
                );
                (true, false)
            }
            (io, p2p) => (io, p2p),
        };

        if p2p_chosen && desc.size % (2 * 1024 * 1024) != 0 {
            return Err(DriverError::BusFault(format!(
                "p2p region type {} size {} is not 2MiB-aligned",
                desc.region_type, desc.size
            )));
        }

        let record = BarRegionRecord {
            node: kind,
            bar_index: desc.bar_index,
            region_type: desc.region_type,
            start: desc.bar_offset,
            end: desc.bar_offset + desc.size - 1,
        };
        crate::region::check_no_overlap(&all_records, &record)?;
        all_records.push(record);

        let mapped = MappedRegion {
            valid: true,
            size: desc.size,
            dev_phys_base: desc.dev_phys_base,
            host_phys_base: desc.bar_offset,
            io_base: if io_chosen { Some(desc.bar_offset) } else { None },
            access,
            p2p: if p2p_chosen {
                Some(crate::region::P2pSubRecord { pci_bus_addr: 0 })
            } else {
                None
            },
        };
        regions.insert(desc.region_type, mapped)?;
        new_bar_records.push(record);
    }

    // Step 8: compulsory check.
    regions.check_compulsory()?;

    Ok(ParsedDir { header, vq, regions, new_bar_records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vqfabric_abi::DeviceConfig;

    fn region_bytes(region_type: u32, bar_offset: u64, size: u64, io: bool) -> Vec<u8> {
        let desc = RegionDescriptor {
            region_type,
            attribute_size: RegionDescriptor::SIZE as u32,
            bar_index: 0,
            io_access: io as u8,
            p2p_access: (!io) as u8,
            privilege: 0,
            node_accessibility: 1,
            dma_alignment_code: 0,
            dma_element_size: 4096,
            dma_element_count: 1,
            bar_offset,
            dev_phys_base: 0x1000,
            size,
            ..Default::default()
        };
        desc.to_bytes().to_vec()
    }

    fn build_ops_dir(regions: &[Vec<u8>]) -> Vec<u8> {
        let vq = VqDescriptor {
            bar_index: 0,
            bar_size: 0x10000,
            sq_offset: 0,
            sq_count: 2,
            per_sq_size: 256,
            cq_offset: 0x1000,
            cq_count: 2,
            per_cq_size: 256,
            irq_trigger_offset: 0x2000,
            ..Default::default()
        };
        let mut tail = vq.to_bytes().to_vec();
        for r in regions {
            tail.extend_from_slice(r);
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&tail);
        let crc = hasher.finalize();

        let header = DirHeader {
            version: 1,
            total_size: (20 + DeviceConfig::SIZE + tail.len()) as u32,
            attribute_size: DeviceConfig::SIZE as u32,
            region_count: regions.len() as u32,
            crc32: crc,
            device_config: DeviceConfig::default(),
        };
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(&tail);
        out
    }

    #[test]
    fn boot_stage_tracks_status_per_node_kind() {
        assert_eq!(BootStage::from_status(NodeKind::Mgmt, 1), BootStage::VqReady);
        assert_eq!(BootStage::from_status(NodeKind::Mgmt, 11), BootStage::DevReady);
        assert_eq!(BootStage::from_status(NodeKind::Ops, 10), BootStage::MmReady);
        assert_eq!(BootStage::from_status(NodeKind::Ops, 42), BootStage::Unknown(42));
    }

    #[test]
    fn wait_for_ready_succeeds_immediately_when_already_ready() {
        let window = MemoryDirWindow { status: 10, data: vec![0u8; 64] };
        assert!(wait_for_ready(&window, NodeKind::Ops, 0).is_ok());
    }

    #[test]
    fn wait_for_ready_times_out_when_never_ready() {
        let window = MemoryDirWindow { status: 0, data: vec![0u8; 64] };
        assert!(wait_for_ready(&window, NodeKind::Ops, 0).is_err());
    }

    #[test]
    fn parse_accepts_well_formed_single_region_dir() {
        let regions = vec![region_bytes(0, 0x4000, 0x1000, true)];
        let data = build_ops_dir(&regions);
        let window = MemoryDirWindow { status: 10, data };
        let parsed = parse(&window, NodeKind::Ops, 1, &[]).unwrap();
        assert_eq!(parsed.new_bar_records.len(), 1);
        assert!(parsed.regions.get(0).unwrap().valid);
    }

    #[test]
    fn parse_rejects_bad_crc() {
        let regions = vec![region_bytes(0, 0x4000, 0x1000, true)];
        let mut data = build_ops_dir(&regions);
        let len = data.len();
        data[16] ^= 0xFF; // corrupt crc32 field
        let _ = len;
        let window = MemoryDirWindow { status: 10, data };
        assert!(parse(&window, NodeKind::Ops, 1, &[]).is_err());
    }

    #[test]
    fn parse_fails_compulsory_check_when_region_missing() {
        let data = build_ops_dir(&[]);
        let window = MemoryDirWindow { status: 10, data };
        assert!(parse(&window, NodeKind::Ops, 1, &[]).is_err());
    }

    #[test]
    fn parse_rejects_region_overlap_with_existing_records() {
        let regions = vec![region_bytes(0, 0x1800, 0x1000, true)];
        let data = build_ops_dir(&regions);
        let window = MemoryDirWindow { status: 10, data };
        let existing = vec![BarRegionRecord {
            node: NodeKind::Mgmt,
            bar_index: 0,
            region_type: 0,
            start: 0x1000,
            end: 0x1fff,
        }];
        assert!(parse(&window, NodeKind::Ops, 1, &existing).is_err());
    }

    #[test]
    fn parse_rejects_misaligned_p2p_region() {
        let regions = vec![region_bytes(0, 0x4000, 0x1234, false)];
        let data = build_ops_dir(&regions);
        let window = MemoryDirWindow { status: 10, data };
        assert!(parse(&window, NodeKind::Ops, 1, &[]).is_err());
    }
}
