//! Driver-side callback interfaces and descriptors
//!
//! The host framework drives the driver through three callback sets:
//!
//! - [`PlatformDriver`]: `probe`/`remove` plus power management hooks,
//!   invoked by the driver core for matching platform devices
//! - [`ComponentMaster`]: `bind`/`unbind`, invoked once every component of a
//!   master is present
//! - [`DrmDriver`]: device `load`/`unload` and per-file `open`/`close` hooks,
//!   invoked by the DRM core
//!
//! [`mali::MaliDriver`] implements all three.

pub mod device;
pub mod drm;
pub mod file;
pub mod fops;
pub mod mali;

use crate::error::DriverResult;
use crate::host::{Host, PlatformDevice};
use crate::of::OfMatchTable;
use bitflags::bitflags;
use chrono::NaiveDate;
use serde::Serialize;

pub use device::{DevicePrivate, MaliObject, Pool};
pub use drm::DrmDevice;
pub use file::{DrmFile, FileId, FilePrivate};
pub use fops::{FileOperations, MALI_DRIVER_FOPS};
pub use mali::{MaliDriver, MaliMaster};

/// Driver metadata reported to the DRM core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriverInfo {
    /// Driver major version
    pub major: i32,
    /// Driver minor version
    pub minor: i32,
    /// Driver patchlevel version
    pub patchlevel: i32,
    /// Driver name
    pub name: &'static str,
    /// Driver description
    pub desc: &'static str,
    /// Driver date, `YYYYMMDD`
    pub date: &'static str,
}

impl DriverInfo {
    /// `major.minor.patchlevel`
    pub fn version(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patchlevel)
    }

    /// Driver date as a calendar date, if well formed
    pub fn release_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.date, "%Y%m%d").ok()
    }
}

/// Driver metadata
pub const INFO: DriverInfo = DriverInfo {
    major: 0,
    minor: 1,
    patchlevel: 0,
    name: "mali_drm",
    desc: "DRM module for Mali-200, Mali-400",
    date: "20100520",
};

bitflags! {
    /// DRM driver feature flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct DriverFeatures: u32 {
        /// Driver uses AGP
        const USE_AGP = 0x1;
        /// Driver supports DMA
        const HAVE_DMA = 0x20;
        /// Driver handles an interrupt
        const HAVE_IRQ = 0x40;
        /// Driver uses the GEM memory manager
        const GEM = 0x1000;
        /// Driver supports mode setting
        const MODESET = 0x2000;
        /// Driver supports PRIME buffer sharing
        const PRIME = 0x4000;
        /// Driver supports render nodes
        const RENDER = 0x8000;
    }
}

bitflags! {
    /// Permission flags of a driver ioctl
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct IoctlFlags: u32 {
        /// Caller must be authenticated
        const AUTH = 0x1;
        /// Caller must be the DRM master
        const MASTER = 0x2;
        /// Caller must be privileged
        const ROOT_ONLY = 0x4;
        /// Runs without the global DRM lock
        const UNLOCKED = 0x10;
        /// Allowed on render nodes
        const RENDER_ALLOW = 0x20;
    }
}

/// One entry of a driver ioctl table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IoctlDesc {
    /// Index relative to the driver command base
    pub nr: u32,
    /// Name used in logs
    pub name: &'static str,
    /// Permission flags
    pub flags: IoctlFlags,
}

/// Everything the DRM core knows about the driver
#[derive(Debug, Clone, Copy)]
pub struct DriverDescriptor {
    /// Name, version and date
    pub info: DriverInfo,
    /// Feature flags
    pub features: DriverFeatures,
    /// Ioctl table, sparse by `nr`
    pub ioctls: &'static [IoctlDesc],
    /// Upper bound of valid `nr` values; 0 until the module is initialised
    pub num_ioctls: usize,
    /// File operations of the device node
    pub fops: &'static FileOperations,
}

impl DriverDescriptor {
    /// Descriptor over `ioctls`, not yet wired
    pub fn new(ioctls: &'static [IoctlDesc]) -> Self {
        Self {
            info: INFO,
            features: DriverFeatures::PRIME,
            ioctls,
            num_ioctls: 0,
            fops: &MALI_DRIVER_FOPS,
        }
    }

    /// Count of the ioctl table: one past the highest `nr`
    pub fn max_ioctl(&self) -> usize {
        self.ioctls
            .iter()
            .map(|desc| desc.nr as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// Entry for `nr`, if below `num_ioctls` and present in the table
    pub fn ioctl(&self, nr: u32) -> Option<&'static IoctlDesc> {
        if nr as usize >= self.num_ioctls {
            return None;
        }
        self.ioctls.iter().find(|desc| desc.nr == nr)
    }
}

/// Power management transition passed to [`PlatformDriver::suspend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PmMessage {
    /// System suspend
    Suspend,
    /// Freeze before hibernation
    Freeze,
    /// Hibernation
    Hibernate,
}

/// Platform driver callbacks
pub trait PlatformDriver {
    /// State kept for each probed device, handed back to `remove`
    type Data;

    /// Driver name
    fn name(&self) -> &'static str;

    /// Device-tree ids served by the driver
    fn of_match_table(&self) -> &'static OfMatchTable;

    /// Take over a matching device
    fn probe(&mut self, host: &dyn Host, pdev: &PlatformDevice) -> DriverResult<Self::Data>;

    /// Release a device; never fails
    fn remove(&mut self, host: &dyn Host, pdev: &PlatformDevice, data: Self::Data);

    /// Power down for `state`
    fn suspend(&mut self, _pdev: &PlatformDevice, _state: PmMessage) -> DriverResult<()> {
        Ok(())
    }

    /// Power back up
    fn resume(&mut self, _pdev: &PlatformDevice) -> DriverResult<()> {
        Ok(())
    }
}

/// Component master callbacks
pub trait ComponentMaster {
    /// Object built when the master binds
    type Bound;

    /// All components are present: build the aggregate device
    fn bind(&mut self, host: &dyn Host, master: &PlatformDevice) -> DriverResult<Self::Bound>;

    /// Tear the aggregate device down; never fails
    fn unbind(&mut self, host: &dyn Host, bound: Self::Bound);
}

/// DRM driver callbacks
///
/// Ownership of the private structures moves through these calls: `load` and
/// `open` hand a value to the DRM core, `unload` and `postclose` take it back.
pub trait DrmDriver {
    /// Per-device private structure
    type DevicePrivate;
    /// Per-file private structure
    type FilePrivate;

    /// Descriptor registered with the DRM core
    fn descriptor(&self) -> &DriverDescriptor;

    /// Build the per-device structure
    ///
    /// `platformdev` is the device the DRM device was created for; a driver
    /// may fill it in when it is absent.
    fn load(
        &mut self,
        host: &dyn Host,
        platformdev: &mut Option<PlatformDevice>,
        chipset: u64,
    ) -> DriverResult<Self::DevicePrivate>;

    /// Release the per-device structure; never fails
    fn unload(&mut self, host: &dyn Host, dev: Self::DevicePrivate);

    /// Build the per-file structure of a new client
    fn open(&mut self, dev: &mut Self::DevicePrivate, file: FileId) -> DriverResult<Self::FilePrivate>;

    /// Client is closing; drop whatever it still holds
    fn preclose(&mut self, dev: &mut Self::DevicePrivate, file: &mut Self::FilePrivate);

    /// Release the per-file structure; never fails
    fn postclose(&mut self, dev: &mut Self::DevicePrivate, file: Self::FilePrivate);

    /// The last client closed the device
    fn lastclose(&mut self, dev: &mut Self::DevicePrivate);

    /// Wait for the GPU to go idle
    fn dma_quiescent(&mut self, dev: &mut Self::DevicePrivate) -> DriverResult<()>;

    /// Run driver ioctl `nr`; permissions are already checked
    fn ioctl(
        &mut self,
        dev: &mut Self::DevicePrivate,
        file: &mut Self::FilePrivate,
        nr: u32,
        data: &mut [u8],
    ) -> DriverResult<i32>;
}
