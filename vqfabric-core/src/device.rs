//! Device Instance (spec.md section 3) and the module-global singletons it
//! shares with every other device: the device-number pool and the P2PDMA
//! registry (spec.md section 9 "Global state": "a top-level state struct
//! created once and passed to every entry point by shared reference").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bitflags::bitflags;

use crate::config::{DeviceInstanceConfig, ResetConfig};
use crate::dir::DirWindow;
use crate::error::{DriverError, Result};
use crate::event::EventSink;
use crate::node::Node;
use crate::p2p::{P2pDistance, P2pRegion, P2pRegistry, MAX_DEVS};
use crate::region::NodeKind;
use crate::vq::common::Doorbell;

/// Device-number pool (spec.md section 5 "Shared resources"): one bit per
/// device number, lowest clear bit wins on allocation.
pub struct DevBitmap {
    bits: AtomicU64,
}

impl DevBitmap {
    pub fn new() -> Self {
        Self { bits: AtomicU64::new(0) }
    }

    pub fn alloc(&self) -> Result<u8> {
        loop {
            let current = self.bits.load(Ordering::Acquire);
            if current == u64::MAX {
                return Err(DriverError::NoDev);
            }
            let devnum = (!current).trailing_zeros() as u8;
            let updated = current | (1u64 << devnum);
            if self
                .bits
                .compare_exchange(current, updated, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(devnum);
            }
        }
    }

    pub fn free(&self, devnum: u8) {
        self.bits.fetch_and(!(1u64 << devnum), Ordering::AcqRel);
    }

    /// Every currently-allocated device number except `exclude`, used as the
    /// P2PDMA registry's "other initialized devices" set.
    pub fn others(&self, exclude: u8) -> Vec<u8> {
        let current = self.bits.load(Ordering::Acquire);
        (0..MAX_DEVS as u8).filter(|&d| d != exclude && current & (1u64 << d) != 0).collect()
    }
}

impl Default for DevBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// Top-level singleton: create once at module init, share by reference with
/// every `DeviceInstance`.
#[derive(Default)]
pub struct DriverState {
    pub dev_bitmap: DevBitmap,
    pub p2p: P2pRegistry,
}

impl DriverState {
    pub fn new() -> Self {
        Self::default()
    }
}

bitflags! {
    /// spec.md section 3 "telemetry groups registered flags": which sysfs
    /// attribute groups have been published for this device.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TelemetryGroups: u8 {
        const MGMT_VQ_STATS = 1 << 0;
        const OPS_VQ_STATS = 1 << 1;
        const MEM_STATS = 1 << 2;
        const ERR_STATS = 1 << 3;
    }
}

/// spec.md section 3 "Device Instance".
pub struct DeviceInstance {
    pub devnum: u8,
    pub config: DeviceInstanceConfig,
    pub reset_config: ResetConfig,
    pub mgmt: Node,
    pub ops: Node,
    bar_records: Mutex<Vec<crate::region::BarRegionRecord>>,
    telemetry_registered: Mutex<TelemetryGroups>,
}

impl DeviceInstance {
    /// Allocates a device number from `driver`'s pool (fatal `NODEV` if the
    /// pool is exhausted, spec.md section 7).
    pub fn new(driver: &DriverState, config: DeviceInstanceConfig, reset_config: ResetConfig) -> Result<Self> {
        let devnum = driver.dev_bitmap.alloc()?;
        Ok(Self {
            devnum,
            config,
            reset_config,
            mgmt: Node::new(NodeKind::Mgmt, devnum as u32 * 2),
            ops: Node::new(NodeKind::Ops, devnum as u32 * 2 + 1),
            bar_records: Mutex::new(Vec::new()),
            telemetry_registered: Mutex::new(TelemetryGroups::empty()),
        })
    }

    /// Tears down both nodes and reclaims the device number.
    pub fn destroy(self, driver: &DriverState) {
        self.mgmt.teardown();
        self.ops.teardown();
        driver.dev_bitmap.free(self.devnum);
    }

    pub fn bus_name(&self) -> &str {
        &self.config.bus_name
    }

    /// spec.md section 4.3: parses the Mgmt DIR, checking its regions against
    /// the device-wide BAR record list before folding in the new ones.
    pub fn init_mgmt(
        &self,
        window: &dyn DirWindow,
        doorbell: Box<dyn Doorbell>,
        event_sink: Box<dyn EventSink>,
    ) -> Result<()> {
        self.init_node(&self.mgmt, window, doorbell, event_sink)
    }

    /// Same as [`init_mgmt`](Self::init_mgmt) for the Ops node; a region
    /// overlapping an already-initialized Mgmt region fails here without
    /// disturbing Mgmt (spec.md section 8 scenario 4).
    pub fn init_ops(
        &self,
        window: &dyn DirWindow,
        doorbell: Box<dyn Doorbell>,
        event_sink: Box<dyn EventSink>,
    ) -> Result<()> {
        self.init_node(&self.ops, window, doorbell, event_sink)
    }

    fn init_node(
        &self,
        node: &Node,
        window: &dyn DirWindow,
        doorbell: Box<dyn Doorbell>,
        event_sink: Box<dyn EventSink>,
    ) -> Result<()> {
        let mut records = self.bar_records.lock().unwrap();
        let new_records = node.init(
            window,
            self.config.expected_dir_version,
            self.config.discovery_timeout_secs,
            &records,
            doorbell,
            event_sink,
        )?;
        records.extend(new_records);
        Ok(())
    }

    fn p2p_peers(&self, driver: &DriverState) -> Vec<u8> {
        driver.dev_bitmap.others(self.devnum)
    }

    /// spec.md section 4.4 `add_resource`, scoped to this device's current
    /// peer set.
    pub fn p2p_add_resource(
        &self,
        driver: &DriverState,
        region: P2pRegion,
        distance: &dyn P2pDistance,
    ) -> Result<()> {
        let peers = self.p2p_peers(driver);
        driver.p2p.add_resource(self.devnum, region, &peers, distance)
    }

    /// spec.md section 4.4 `release_resource`.
    pub fn p2p_release_resource(&self, driver: &DriverState, region_type: u32) -> Result<()> {
        let peers = self.p2p_peers(driver);
        driver.p2p.release_resource(self.devnum, region_type, &peers)
    }

    /// spec.md section 4.4 `move_data`'s address-translation sub-step.
    pub fn p2p_translate(&self, driver: &DriverState, peer_devnum: u8, peer_phys_addr: u64) -> Result<u64> {
        driver.p2p.translate(self.devnum, peer_devnum, peer_phys_addr)
    }

    pub fn register_telemetry(&self, groups: TelemetryGroups) {
        *self.telemetry_registered.lock().unwrap() |= groups;
    }

    pub fn telemetry_registered(&self) -> TelemetryGroups {
        *self.telemetry_registered.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceInstanceConfigBuilder, ResetConfigBuilder};
    use crate::dir::MemoryDirWindow;
    use crate::event::NullEventSink;
    use crate::node::NodeState;
    use crate::vq::common::NullDoorbell;
    use vqfabric_abi::{DeviceConfig, DirHeader, RegionDescriptor, VqDescriptor};

    fn config(bus_name: &str) -> DeviceInstanceConfig {
        DeviceInstanceConfigBuilder::default()
            .bus_name(bus_name.to_string())
            .discovery_timeout_secs(0u64)
            .build()
            .unwrap()
    }

    fn reset_config() -> ResetConfig {
        ResetConfigBuilder::default().max_estimated_downtime_ms(500).build().unwrap()
    }

    #[test]
    fn dev_bitmap_allocates_lowest_clear_bit_and_frees() {
        let bitmap = DevBitmap::new();
        let a = bitmap.alloc().unwrap();
        let b = bitmap.alloc().unwrap();
        assert_eq!((a, b), (0, 1));
        bitmap.free(a);
        let c = bitmap.alloc().unwrap();
        assert_eq!(c, 0);
        assert_eq!(bitmap.others(1), vec![0]);
    }

    fn region_bytes(region_type: u32, bar_offset: u64, size: u64) -> Vec<u8> {
        let desc = RegionDescriptor {
            region_type,
            attribute_size: RegionDescriptor::SIZE as u32,
            bar_index: 0,
            io_access: 1,
            p2p_access: 0,
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

    fn build_dir(regions: &[Vec<u8>]) -> Vec<u8> {
        let vq = VqDescriptor {
            bar_index: 0,
            bar_size: 0x10000,
            sq_offset: 0,
            sq_count: 1,
            per_sq_size: 256,
            cq_offset: 0x1000,
            cq_count: 1,
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

    #[test]
    fn ops_region_overlapping_mgmt_fails_without_disturbing_mgmt() {
        let driver = DriverState::new();
        let device = DeviceInstance::new(&driver, config("0000:01:00.0"), reset_config()).unwrap();

        let mgmt_regions = vec![region_bytes(0, 0x1000, 0x1000), region_bytes(1, 0x5000, 0x1000)];
        let mgmt_window = MemoryDirWindow { status: 11, data: build_dir(&mgmt_regions) };
        device
            .init_mgmt(&mgmt_window, Box::new(NullDoorbell), Box::new(NullEventSink))
            .unwrap();

        let ops_regions = vec![region_bytes(0, 0x1800, 0x1000)];
        let ops_window = MemoryDirWindow { status: 10, data: build_dir(&ops_regions) };
        assert!(device
            .init_ops(&ops_window, Box::new(NullDoorbell), Box::new(NullEventSink))
            .is_err());

        assert!(matches!(device.mgmt.state(), NodeState::Ready { .. }));
        assert_eq!(device.ops.state(), NodeState::NotReady);
    }

    #[test]
    fn p2p_peers_excludes_self_and_reflects_other_allocations() {
        let driver = DriverState::new();
        let a = DeviceInstance::new(&driver, config("0000:01:00.0"), reset_config()).unwrap();
        let b = DeviceInstance::new(&driver, config("0000:02:00.0"), reset_config()).unwrap();
        assert_eq!(a.p2p_peers(&driver), vec![b.devnum]);
        assert_eq!(b.p2p_peers(&driver), vec![a.devnum]);
    }

    #[test]
    fn telemetry_groups_accumulate() {
        let driver = DriverState::new();
        let device = DeviceInstance::new(&driver, config("0000:01:00.0"), reset_config()).unwrap();
        device.register_telemetry(TelemetryGroups::MGMT_VQ_STATS);
        device.register_telemetry(TelemetryGroups::ERR_STATS);
        assert!(device.telemetry_registered().contains(TelemetryGroups::MGMT_VQ_STATS));
        assert!(device.telemetry_registered().contains(TelemetryGroups::ERR_STATS));
        assert!(!device.telemetry_registered().contains(TelemetryGroups::MEM_STATS));
    }
}
