//! Host-side core of the VQ Fabric driver: the pieces that sit between a
//! user process and a PCIe-attached accelerator's management and
//! operational nodes, independent of the actual character-device/ioctl glue
//! and of any specific transport.
//!
//! Layout mirrors the stack a request travels through:
//! - [`circbuf`] / [`mmio`]: the shared-memory primitives (circular buffer
//!   sync protocol, MMIO byte-serializer).
//! - [`dir`] / [`region`]: Device Information Region parsing into a typed
//!   Region Table.
//! - [`vq`]: Submission/Completion Queue pairs built on the circular buffer.
//! - [`dma`] / [`p2p`]: DMA tag correlation and the P2PDMA registry.
//! - [`node`]: the Mgmt/Ops personality tying Region Table, VQ Set and DMA
//!   state together behind an Open/Reset Gate.
//! - [`device`]: the Device Instance and the module-global device-number and
//!   P2PDMA singletons every node shares.
//! - [`reset`]: the serialized teardown/settle/reinit workqueue.
//! - [`ioctl`]: the safe dispatch layer the character-device surface calls
//!   into.
//! - [`loopback`] (feature `loopback`): a synthetic command handler standing
//!   in for firmware on test hardware.
//! - [`event`] / [`telemetry`]: the device-event sink contract and the rate
//!   /error counters it and sysfs publish.
//! - [`config`]: `derive_builder`-generated configuration for a Device
//!   Instance and its reset behavior.
//! - [`error`]: the semantic error taxonomy shared by every module above.

#[macro_use]
extern crate derive_builder;

pub mod circbuf;
pub mod config;
pub mod device;
pub mod dir;
pub mod dma;
pub mod error;
pub mod event;
pub mod ioctl;
#[cfg(feature = "loopback")]
pub mod loopback;
pub mod mmio;
pub mod node;
pub mod p2p;
pub mod region;
pub mod reset;
pub mod telemetry;
pub mod vq;

pub use device::{DeviceInstance, DriverState};
pub use error::{DriverError, Result};
pub use node::{Node, NodeState};
