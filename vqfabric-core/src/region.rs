//! Region Map (spec.md section 3 "BAR Region Record" / "Mapped Region",
//! section 4.3 step 7): the typed table of BAR sub-ranges a DIR advertises,
//! plus the cross-node overlap check.

use vqfabric_abi::RegionDescriptor;

use crate::error::{DriverError, Result};

/// Which personality a region (or node) belongs to; drives the compulsory
/// region-type set and the region-type count (spec.md section 4.3 step 7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Mgmt,
    Ops,
}

impl NodeKind {
    /// Number of region types this node's DIR schema defines
    /// (`et_mgmt_dir.h`/`et_ops_dir.h`'s `*_DDR_REGION_MAP_NUM`).
    pub fn region_type_count(self) -> u32 {
        match self {
            NodeKind::Mgmt => 2, // TraceBuffer, ManagementScratch
            NodeKind::Ops => 1,  // UserDram
        }
    }

    /// Region types that must be present and valid after the region walk
    /// (spec.md section 4.3 step 8).
    pub fn compulsory_types(self) -> &'static [u32] {
        match self {
            NodeKind::Mgmt => &[0, 1],
            NodeKind::Ops => &[0],
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AccessDescriptor {
    pub io_access: bool,
    pub p2p_access: bool,
    pub privilege: u8,
    pub node_accessibility: u8,
    pub dma_alignment_bits: u32,
    pub dma_element_size: u32,
    pub dma_element_count: u16,
}

impl AccessDescriptor {
    pub fn from_descriptor(desc: &RegionDescriptor) -> Self {
        // dma_alignment_code is a 2-bit code selecting one of four power-of-two
        // alignments; 0 => 12 bits (4 KiB) up to 3 => 21 bits (2 MiB).
        let dma_alignment_bits = 12 + 3 * (desc.dma_alignment_code as u32 & 0x3);
        Self {
            io_access: desc.io_access != 0,
            p2p_access: desc.p2p_access != 0,
            privilege: desc.privilege,
            node_accessibility: desc.node_accessibility,
            dma_alignment_bits,
            dma_element_size: desc.dma_element_size,
            dma_element_count: desc.dma_element_count,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct P2pSubRecord {
    pub pci_bus_addr: u64,
}

/// One (node, region type) slot in the Region Table (spec.md section 3
/// "Mapped Region").
#[derive(Clone, Debug)]
pub struct MappedRegion {
    pub valid: bool,
    pub size: u64,
    pub dev_phys_base: u64,
    pub host_phys_base: u64,
    /// Offset of this region's IO-mapped window within its BAR, or `None`
    /// when the region was chosen for P2P export instead of IO mapping.
    pub io_base: Option<u64>,
    pub access: AccessDescriptor,
    pub p2p: Option<P2pSubRecord>,
}

/// spec.md section 3 "BAR Region Record": used by the device-wide overlap
/// check across both nodes.
#[derive(Clone, Copy, Debug)]
pub struct BarRegionRecord {
    pub node: NodeKind,
    pub bar_index: u8,
    pub region_type: u32,
    pub start: u64,
    pub end: u64,
}

impl BarRegionRecord {
    fn overlaps(&self, other: &BarRegionRecord) -> bool {
        self.bar_index == other.bar_index && self.start <= other.end && other.start <= self.end
    }
}

/// Returns `Err` naming the conflicting region if `candidate` overlaps any
/// existing entry (spec.md section 3 invariant: no two BAR regions overlap,
/// across both nodes).
pub fn check_no_overlap(existing: &[BarRegionRecord], candidate: &BarRegionRecord) -> Result<()> {
    if let Some(conflict) = existing.iter().find(|r| r.overlaps(candidate)) {
        return Err(DriverError::BusFault(format!(
            "region type {} on bar {} [{:#x},{:#x}] overlaps existing region type {} [{:#x},{:#x}]",
            candidate.region_type,
            candidate.bar_index,
            candidate.start,
            candidate.end,
            conflict.region_type,
            conflict.start,
            conflict.end
        )));
    }
    Ok(())
}

/// Fixed-size array of `MappedRegion`s indexed by region type, one per Node
/// (spec.md section 3 "Node: Region Table").
pub struct RegionTable {
    kind: NodeKind,
    slots: Vec<Option<MappedRegion>>,
}

impl RegionTable {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            slots: vec![None; kind.region_type_count() as usize],
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Inserts a validated region, rejecting a duplicate type
    /// (spec.md section 4.3 step 7).
    pub fn insert(&mut self, region_type: u32, region: MappedRegion) -> Result<()> {
        let slot = self.slots.get_mut(region_type as usize).ok_or_else(|| {
            DriverError::InvalidArgument(format!("region type {region_type} out of range"))
        })?;
        if slot.is_some() {
            return Err(DriverError::InvalidArgument(format!(
                "duplicate region type {region_type}"
            )));
        }
        *slot = Some(region);
        Ok(())
    }

    pub fn get(&self, region_type: u32) -> Option<&MappedRegion> {
        self.slots.get(region_type as usize).and_then(|s| s.as_ref())
    }

    /// spec.md section 4.3 step 8: every compulsory region type must be
    /// present and marked valid.
    pub fn check_compulsory(&self) -> Result<()> {
        for &t in self.kind.compulsory_types() {
            match self.get(t) {
                Some(region) if region.valid => {}
                _ => {
                    return Err(DriverError::BusFault(format!(
                        "compulsory region type {t} missing or invalid"
                    )))
                }
            }
        }
        Ok(())
    }
}
