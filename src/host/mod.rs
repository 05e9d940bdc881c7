//! Host framework abstraction
//!
//! Everything the driver needs from the surrounding kernel (driver core,
//! component framework, DRM core, DMA layer) goes through the [`Host`] trait.
//! The driver never keeps host state of its own beyond the values these calls
//! return.
//!
//! [`sim::SimHost`] is an in-memory implementation used by the simulator and
//! the integration tests.

pub mod sim;

use crate::driver::DriverInfo;
use crate::error::DriverResult;
use crate::of::{DeviceNode, OfMatchTable};
use serde::{Deserialize, Serialize};

/// A platform device as seen by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformDevice {
    /// Device name
    pub name: String,
    /// Instance id, `-1` for a single unnumbered instance
    pub id: i32,
    /// Device-tree node the device was created from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub of_node: Option<DeviceNode>,
}

impl PlatformDevice {
    /// Device created from a device-tree node, named `<unit-address>.<name>`
    /// like the driver core does, or plain `<name>` without a unit address
    pub fn from_node(node: DeviceNode) -> Self {
        let name = match node.unit_address() {
            Some(addr) => format!("{}.{}", addr, node.name()),
            None => node.name().to_string(),
        };
        Self {
            name,
            id: -1,
            of_node: Some(node),
        }
    }

    /// Device registered by name only, without a node
    pub fn simple(name: impl Into<String>, id: i32) -> Self {
        Self {
            name: name.into(),
            id,
            of_node: None,
        }
    }

    /// Name as shown by the driver core (`name.id`, or `name` for id `-1`)
    pub fn dev_name(&self) -> String {
        if self.id < 0 {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, self.id)
        }
    }
}

/// Components a master waits for before it can bind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentMatch {
    nodes: Vec<DeviceNode>,
}

impl ComponentMatch {
    /// Empty match list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component identified by its node; duplicates are ignored
    pub fn add(&mut self, node: &DeviceNode) {
        if !self.nodes.iter().any(|n| n.same_node(node)) {
            self.nodes.push(node.clone());
        }
    }

    /// Whether `node` is one of the components
    pub fn contains(&self, node: &DeviceNode) -> bool {
        self.nodes.iter().any(|n| n.same_node(node))
    }

    /// Component nodes, in the order they were added
    pub fn nodes(&self) -> &[DeviceNode] {
        &self.nodes
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no component was added
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Result of adding a component master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterState {
    /// Every component is present; the master may bind now
    Ready,
    /// Some components are missing; the host reports readiness later
    Waiting,
}

/// DMA mask covering the low `bits` address bits
pub fn dma_bit_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Services provided by the host framework
///
/// Failures are negative errno values wrapped in [`crate::DriverError`];
/// the driver propagates them unchanged.
#[cfg_attr(test, mockall::automock)]
pub trait Host {
    /// Register the platform driver with the driver core
    fn platform_driver_register(&self, name: &str, of_match: &OfMatchTable) -> DriverResult<()>;

    /// Unregister a platform driver; never fails
    fn platform_driver_unregister(&self, name: &str);

    /// Register a bare platform device by name
    fn platform_device_register_simple(&self, name: &str, id: i32) -> DriverResult<PlatformDevice>;

    /// Unregister a platform device; never fails
    fn platform_device_unregister(&self, pdev: &PlatformDevice);

    /// Add `master` with its component list to the component framework
    fn component_master_add_with_match(
        &self,
        master: &PlatformDevice,
        components: &ComponentMatch,
    ) -> DriverResult<MasterState>;

    /// Remove the master association of `master`
    fn component_master_del(&self, master: &PlatformDevice);

    /// Destroy the platform devices created for the children of `parent`
    fn of_platform_depopulate(&self, parent: &PlatformDevice);

    /// Set the coherent DMA mask of `pdev`
    fn dma_set_coherent_mask(&self, pdev: &PlatformDevice, mask: u64) -> DriverResult<()>;

    /// Register a DRM device for `pdev`; returns its minor number
    fn drm_dev_register(&self, info: &DriverInfo, pdev: &PlatformDevice) -> DriverResult<u32>;

    /// Unregister the DRM device with the given minor
    fn drm_dev_unregister(&self, minor: u32);

    /// Generic legacy mmap handler
    fn drm_legacy_mmap(&self, minor: u32, offset: u64, len: u64) -> DriverResult<()>;

    /// Generic poll handler; returns the ready event mask
    fn drm_poll(&self, minor: u32) -> u32;
}

impl<T: Host + ?Sized> Host for &T {
    fn platform_driver_register(&self, name: &str, of_match: &OfMatchTable) -> DriverResult<()> {
        (**self).platform_driver_register(name, of_match)
    }

    fn platform_driver_unregister(&self, name: &str) {
        (**self).platform_driver_unregister(name)
    }

    fn platform_device_register_simple(&self, name: &str, id: i32) -> DriverResult<PlatformDevice> {
        (**self).platform_device_register_simple(name, id)
    }

    fn platform_device_unregister(&self, pdev: &PlatformDevice) {
        (**self).platform_device_unregister(pdev)
    }

    fn component_master_add_with_match(
        &self,
        master: &PlatformDevice,
        components: &ComponentMatch,
    ) -> DriverResult<MasterState> {
        (**self).component_master_add_with_match(master, components)
    }

    fn component_master_del(&self, master: &PlatformDevice) {
        (**self).component_master_del(master)
    }

    fn of_platform_depopulate(&self, parent: &PlatformDevice) {
        (**self).of_platform_depopulate(parent)
    }

    fn dma_set_coherent_mask(&self, pdev: &PlatformDevice, mask: u64) -> DriverResult<()> {
        (**self).dma_set_coherent_mask(pdev, mask)
    }

    fn drm_dev_register(&self, info: &DriverInfo, pdev: &PlatformDevice) -> DriverResult<u32> {
        (**self).drm_dev_register(info, pdev)
    }

    fn drm_dev_unregister(&self, minor: u32) {
        (**self).drm_dev_unregister(minor)
    }

    fn drm_legacy_mmap(&self, minor: u32, offset: u64, len: u64) -> DriverResult<()> {
        (**self).drm_legacy_mmap(minor, offset, len)
    }

    fn drm_poll(&self, minor: u32) -> u32 {
        (**self).drm_poll(minor)
    }
}
