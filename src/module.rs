//! Module init/exit and host entry points
//!
//! [`init`] wires the ioctl table and registers the platform driver. The
//! returned [`Registration`] owns the driver context, the host and every
//! probed master; the host calls back into the driver through its methods.
//! Taking `&mut self` on each of them is how the host's serialization of
//! callbacks shows up in the types.

use crate::driver::fops::noop_llseek;
use crate::driver::mali::DRIVER_NAME;
use crate::driver::{DrmDevice, FileId, MaliDriver, MaliMaster, PlatformDriver, PmMessage, INFO};
use crate::error::{DriverError, DriverResult};
use crate::gpu::GpuOps;
use crate::host::{Host, PlatformDevice};
use crate::of::MALI_DT_IDS;
use log::{debug, error, info, warn};
use serde::Serialize;

/// Module author
pub const MODULE_AUTHOR: &str = "ARM Ltd.";
/// Module license
pub const MODULE_LICENSE: &str = "GPL and additional rights";

/// Metadata the module loader reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    /// Module name
    pub name: &'static str,
    /// One-line description
    pub description: &'static str,
    /// Author
    pub author: &'static str,
    /// License
    pub license: &'static str,
    /// Driver version
    pub version: String,
    /// Driver date, `YYYYMMDD`
    pub date: &'static str,
    /// Device-tree compatible strings
    pub compatible: Vec<&'static str>,
    /// Autoload aliases
    pub aliases: Vec<String>,
}

impl ModuleInfo {
    /// Metadata of this module
    pub fn current() -> Self {
        Self {
            name: INFO.name,
            description: INFO.desc,
            author: MODULE_AUTHOR,
            license: MODULE_LICENSE,
            version: INFO.version(),
            date: INFO.date,
            compatible: MALI_DT_IDS
                .ids()
                .iter()
                .map(|id| match id {
                    crate::of::DeviceId::Compatible(c) => *c,
                })
                .collect(),
            aliases: MALI_DT_IDS.modaliases(),
        }
    }
}

/// What happened to a device offered to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// The device is not for this driver; probe was not called
    NotMatched,
    /// Probed and bound; the DRM device has this minor
    Bound {
        /// Minor number of the DRM device
        minor: u32,
    },
    /// Probed; binding waits for missing components
    Deferred,
}

/// Register the platform driver
///
/// Wires `num_ioctls` into the driver descriptor first. The host's result is
/// returned unchanged.
pub fn init<H: Host, G: GpuOps>(host: H, mut driver: MaliDriver<G>) -> DriverResult<Registration<H, G>> {
    driver.wire_ioctls();
    host.platform_driver_register(driver.name(), driver.of_match_table())
        .map_err(|e| {
            error!("mali: registering platform driver failed: {}", e);
            e
        })?;
    info!("mali: {} {} registered", INFO.name, INFO.version());

    Ok(Registration {
        host,
        driver,
        masters: Vec::new(),
        registered: true,
    })
}

/// A registered platform driver and everything it owns
///
/// Dropping the registration has the same effect as [`Registration::exit`].
#[derive(Debug)]
pub struct Registration<H: Host, G: GpuOps> {
    host: H,
    driver: MaliDriver<G>,
    masters: Vec<MaliMaster<G>>,
    registered: bool,
}

impl<H: Host, G: GpuOps> Registration<H, G> {
    /// Unregister the platform driver
    ///
    /// Every probed device is removed first, then the driver is unregistered,
    /// then the default platform device, if `load` registered one.
    pub fn exit(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;

        while let Some(master) = self.masters.pop() {
            let pdev = master.platform_device().clone();
            self.driver.remove(&self.host, &pdev, master);
        }
        self.host.platform_driver_unregister(DRIVER_NAME);
        if let Some(pdev) = self.driver.take_default_platform_device() {
            self.host.platform_device_unregister(&pdev);
        }
        info!("mali: {} unregistered", INFO.name);
    }

    /// Host the driver is registered with
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Driver context
    pub fn driver(&self) -> &MaliDriver<G> {
        &self.driver
    }

    /// Driver context, mutably
    pub fn driver_mut(&mut self) -> &mut MaliDriver<G> {
        &mut self.driver
    }

    /// Probed masters, in probe order
    pub fn masters(&self) -> &[MaliMaster<G>] {
        &self.masters
    }

    /// Minors of the bound DRM devices
    pub fn minors(&self) -> Vec<u32> {
        self.masters
            .iter()
            .filter_map(|m| m.drm().map(|d| d.minor()))
            .collect()
    }

    /// DRM device with `minor`
    pub fn device(&self, minor: u32) -> Option<&DrmDevice<MaliDriver<G>>> {
        self.masters
            .iter()
            .filter_map(|m| m.drm())
            .find(|d| d.minor() == minor)
    }

    /// A platform device appeared: probe it if it matches
    pub fn device_added(&mut self, pdev: PlatformDevice) -> DriverResult<ProbeOutcome> {
        let matched = pdev
            .of_node
            .as_ref()
            .and_then(|node| self.driver.of_match_table().match_node(node))
            .is_some();
        if !matched {
            debug!("mali: {} does not match", pdev.dev_name());
            return Ok(ProbeOutcome::NotMatched);
        }
        if self.find_master(&pdev.dev_name()).is_some() {
            return Err(DriverError::Busy(format!("{} already probed", pdev.dev_name())));
        }

        let master = self.driver.probe(&self.host, &pdev)?;
        let outcome = match master.drm() {
            Some(drm) => ProbeOutcome::Bound { minor: drm.minor() },
            None => ProbeOutcome::Deferred,
        };
        self.masters.push(master);
        Ok(outcome)
    }

    /// A probed platform device went away
    pub fn device_removed(&mut self, dev_name: &str) -> DriverResult<()> {
        let index = self
            .find_master(dev_name)
            .ok_or_else(|| DriverError::NoDevice(dev_name.to_string()))?;
        let master = self.masters.remove(index);
        let pdev = master.platform_device().clone();
        self.driver.remove(&self.host, &pdev, master);
        Ok(())
    }

    /// Every component of master `dev_name` is present: bind it
    pub fn components_ready(&mut self, dev_name: &str) -> DriverResult<u32> {
        let index = self
            .find_master(dev_name)
            .ok_or_else(|| DriverError::NoDevice(dev_name.to_string()))?;
        let master = &mut self.masters[index];
        master.bind(&mut self.driver, &self.host)?;
        master
            .drm()
            .map(|d| d.minor())
            .ok_or_else(|| DriverError::NoDevice(dev_name.to_string()))
    }

    /// System is going to sleep
    pub fn suspend(&mut self, state: PmMessage) -> DriverResult<()> {
        for master in &self.masters {
            self.driver.suspend(master.platform_device(), state)?;
        }
        Ok(())
    }

    /// System woke up
    pub fn resume(&mut self) -> DriverResult<()> {
        for master in &self.masters {
            self.driver.resume(master.platform_device())?;
        }
        Ok(())
    }

    /// Open the device node of `minor`
    pub fn open(&mut self, minor: u32, privileged: bool) -> DriverResult<FileId> {
        let drm = drm_mut(&mut self.masters, minor)?;
        drm.open(&mut self.driver, privileged)
    }

    /// Close client `file` of `minor`
    pub fn release(&mut self, minor: u32, file: FileId) -> DriverResult<()> {
        let drm = drm_mut(&mut self.masters, minor)?;
        drm.release(&mut self.driver, file)
    }

    /// Unified ioctl entry point
    pub fn ioctl(&mut self, minor: u32, file: FileId, cmd: u32, data: &mut [u8]) -> DriverResult<i32> {
        let drm = drm_mut(&mut self.masters, minor)?;
        drm.ioctl(&mut self.driver, file, cmd, data)
    }

    /// 32-bit compatibility ioctl entry point
    ///
    /// Driver arguments have the same layout for 32 and 64-bit callers.
    #[cfg(feature = "compat")]
    pub fn compat_ioctl(&mut self, minor: u32, file: FileId, cmd: u32, data: &mut [u8]) -> DriverResult<i32> {
        self.ioctl(minor, file, cmd, data)
    }

    /// Memory map through the generic legacy handler
    pub fn mmap(&mut self, minor: u32, file: FileId, offset: u64, len: u64) -> DriverResult<()> {
        let drm = drm_mut(&mut self.masters, minor)?;
        drm.mmap(&self.host, file, offset, len)
    }

    /// Poll through the generic handler
    pub fn poll(&mut self, minor: u32, file: FileId) -> DriverResult<u32> {
        let drm = drm_mut(&mut self.masters, minor)?;
        drm.poll(&self.host, file)
    }

    /// Seek; the position never moves
    pub fn llseek(&mut self, minor: u32, file: FileId, pos: i64, offset: i64, whence: i32) -> DriverResult<i64> {
        let drm = drm_mut(&mut self.masters, minor)?;
        if drm.file(file).is_none() {
            return Err(DriverError::InvalidArgument(format!("{} is not open", file)));
        }
        Ok(noop_llseek(pos, offset, whence))
    }

    /// Grant authentication to client `file`
    pub fn authenticate(&mut self, minor: u32, file: FileId) -> DriverResult<()> {
        drm_mut(&mut self.masters, minor)?.authenticate(file)
    }

    /// Wait for the GPU behind `minor` to go idle
    pub fn dma_quiescent(&mut self, minor: u32) -> DriverResult<()> {
        let drm = drm_mut(&mut self.masters, minor)?;
        drm.quiesce(&mut self.driver)
    }

    fn find_master(&self, dev_name: &str) -> Option<usize> {
        self.masters
            .iter()
            .position(|m| m.platform_device().dev_name() == dev_name)
    }
}

impl<H: Host, G: GpuOps> Drop for Registration<H, G> {
    fn drop(&mut self) {
        if self.registered {
            warn!("mali: registration dropped without exit");
            self.teardown();
        }
    }
}

fn drm_mut<G: GpuOps>(masters: &mut [MaliMaster<G>], minor: u32) -> DriverResult<&mut DrmDevice<MaliDriver<G>>> {
    masters
        .iter_mut()
        .filter_map(|m| m.drm_mut())
        .find(|d| d.minor() == minor)
        .ok_or_else(|| DriverError::NoDevice(format!("minor {}", minor)))
}
