//! P2PDMA Registry (spec.md section 4.4): a module-global table indexed by
//! device number, holding each device's P2P region list and a pairwise
//! compatibility bitmap maintained under strict lock ordering.
//!
//! Grounded on `et_p2pdma.c`: PCI topology distance queries and the actual
//! P2P memory allocator are external to this core, so both are taken as
//! injected collaborators rather than hard-coded calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::error::{DriverError, Result};

pub const MAX_DEVS: usize = 64;

/// Decides whether two devices are P2P-DMA-reachable (`pci_p2pdma_distance`
/// in the original). Injected so the registry doesn't depend on real PCI
/// topology.
pub trait P2pDistance: Send + Sync {
    fn compatible(&self, a: u8, b: u8) -> bool;
}

pub struct AlwaysCompatible;
impl P2pDistance for AlwaysCompatible {
    fn compatible(&self, _a: u8, _b: u8) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug)]
pub struct P2pRegion {
    pub region_type: u32,
    pub dev_phys_base: u64,
    pub size: u64,
    pub pci_bus_addr: u64,
}

struct DeviceP2p {
    present: bool,
    regions: Vec<P2pRegion>,
}

pub struct P2pRegistry {
    devices: Vec<RwLock<DeviceP2p>>,
    compat_bitmaps: Vec<AtomicU64>,
}

impl Default for P2pRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl P2pRegistry {
    pub fn new() -> Self {
        let mut devices = Vec::with_capacity(MAX_DEVS);
        let mut compat_bitmaps = Vec::with_capacity(MAX_DEVS);
        for _ in 0..MAX_DEVS {
            devices.push(RwLock::new(DeviceP2p { present: false, regions: Vec::new() }));
            compat_bitmaps.push(AtomicU64::new(0));
        }
        Self { devices, compat_bitmaps }
    }

    pub fn get_compat_bitmap(&self, devnum: u8) -> u64 {
        self.compat_bitmaps[devnum as usize].load(Ordering::Acquire)
    }

    fn set_bit(&self, devnum: u8, peer: u8, value: bool) {
        let bitmap = &self.compat_bitmaps[devnum as usize];
        if value {
            bitmap.fetch_or(1u64 << peer, Ordering::AcqRel);
        } else {
            bitmap.fetch_and(!(1u64 << peer), Ordering::AcqRel);
        }
    }

    /// spec.md section 4.4 `add_resource`. `other_devnums` is the set of
    /// currently-initialized device numbers excluding `this_dev`.
    pub fn add_resource(
        &self,
        this_dev: u8,
        region: P2pRegion,
        other_devnums: &[u8],
        distance: &dyn P2pDistance,
    ) -> Result<()> {
        let first_map = {
            let mut this = self.devices[this_dev as usize].write().unwrap();
            let first_map = this.regions.is_empty();
            this.regions.push(region);
            if first_map {
                this.present = true;
            }
            first_map
        };
        if !first_map {
            return Ok(());
        }
        self.compat_bitmaps[this_dev as usize].store(0, Ordering::Release);

        for &peer in other_devnums {
            if peer == this_dev {
                continue;
            }
            let (lo, hi) = if this_dev < peer { (this_dev, peer) } else { (peer, this_dev) };
            let _lo_guard = self.devices[lo as usize].write().unwrap();
            let _hi_guard = if hi != lo {
                Some(self.devices[hi as usize].write().unwrap())
            } else {
                None
            };
            let this_present = self.devices[this_dev as usize].read().unwrap().present;
            let peer_present = self.devices[peer as usize].read().unwrap().present;
            if this_present && peer_present {
                if distance.compatible(this_dev, peer) {
                    self.set_bit(this_dev, peer, true);
                    self.set_bit(peer, this_dev, true);
                } else {
                    log::warn!("peer-to-peer DMA not supported between dev{this_dev} and dev{peer}");
                }
            }
        }
        Ok(())
    }

    /// spec.md section 4.4 `release_resource`.
    pub fn release_resource(
        &self,
        this_dev: u8,
        region_type: u32,
        other_devnums: &[u8],
    ) -> Result<()> {
        let now_empty = {
            let mut this = self.devices[this_dev as usize].write().unwrap();
            let before = this.regions.len();
            this.regions.retain(|r| r.region_type != region_type);
            if this.regions.len() == before {
                return Err(DriverError::InvalidArgument(format!(
                    "no p2p region of type {region_type} registered for dev{this_dev}"
                )));
            }
            let empty = this.regions.is_empty();
            if empty {
                this.present = false;
            }
            empty
        };
        if !now_empty {
            return Ok(());
        }
        self.compat_bitmaps[this_dev as usize].store(0, Ordering::Release);

        for &peer in other_devnums {
            if peer == this_dev {
                continue;
            }
            let peer_present = self.devices[peer as usize].write().unwrap().present;
            if peer_present {
                self.set_bit(peer, this_dev, false);
            }
        }
        Ok(())
    }

    /// spec.md section 4.4 `move_data`: translate each peer device-physical
    /// address to a PCI bus address, verifying compatibility first.
    pub fn translate(&self, this_dev: u8, peer_devnum: u8, peer_phys_addr: u64) -> Result<u64> {
        if self.get_compat_bitmap(this_dev) & (1u64 << peer_devnum) == 0 {
            return Err(DriverError::OpNotSupp(format!(
                "dev{this_dev} not p2p-compatible with dev{peer_devnum}"
            )));
        }
        let peer = self.devices[peer_devnum as usize].read().unwrap();
        if !peer.present {
            return Err(DriverError::OpNotSupp(format!("dev{peer_devnum} has no p2p regions")));
        }
        let region = peer
            .regions
            .iter()
            .find(|r| peer_phys_addr >= r.dev_phys_base && peer_phys_addr < r.dev_phys_base + r.size)
            .ok_or_else(|| {
                DriverError::OpNotSupp(format!(
                    "address {peer_phys_addr:#x} not inside any dev{peer_devnum} p2p region"
                ))
            })?;
        Ok(region.pci_bus_addr + (peer_phys_addr - region.dev_phys_base))
    }
}
