//! DRM device object
//!
//! `DrmDevice` is the driver's view of one registered DRM device: the
//! private structure returned by [`DrmDriver::load`], the open files, and the
//! generic handling the DRM core wraps around the driver hooks (file
//! bookkeeping, ioctl range and permission checks).

use super::file::{DrmFile, FileId};
use super::fops::{ioc_nr, DRM_COMMAND_BASE, DRM_COMMAND_END};
use super::{DrmDriver, IoctlFlags};
use crate::error::{DriverError, DriverResult};
use crate::host::{Host, PlatformDevice};
use log::{debug, error, info};
use std::collections::BTreeMap;

/// A registered DRM device
pub struct DrmDevice<D: DrmDriver> {
    minor: u32,
    platformdev: Option<PlatformDevice>,
    private: D::DevicePrivate,
    files: BTreeMap<FileId, DrmFile<D::FilePrivate>>,
    next_file: u32,
}

impl<D: DrmDriver> DrmDevice<D> {
    /// Create, load and register a DRM device for `pdev`
    ///
    /// If registration with the host fails, the loaded private structure is
    /// unloaded again before the error is returned.
    pub fn platform_init(driver: &mut D, host: &dyn Host, pdev: &PlatformDevice) -> DriverResult<Self> {
        let mut platformdev = Some(pdev.clone());
        let private = driver.load(host, &mut platformdev, 0)?;

        let minor = match host.drm_dev_register(&driver.descriptor().info, pdev) {
            Ok(minor) => minor,
            Err(e) => {
                error!("DRM: registering {} failed: {}", pdev.dev_name(), e);
                driver.unload(host, private);
                return Err(e);
            }
        };

        info!(
            "DRM: initialized {} {} on minor {}",
            driver.descriptor().info.name,
            driver.descriptor().info.version(),
            minor
        );

        Ok(Self {
            minor,
            platformdev,
            private,
            files: BTreeMap::new(),
            next_file: 0,
        })
    }

    /// Close remaining files, unregister and unload
    pub fn put(mut self, driver: &mut D, host: &dyn Host) {
        let open: Vec<FileId> = self.files.keys().copied().collect();
        for id in open {
            if let Some(file) = self.files.remove(&id) {
                self.close_file(driver, file);
            }
        }
        driver.lastclose(&mut self.private);
        if let Err(e) = driver.dma_quiescent(&mut self.private) {
            error!("DRM: minor {} did not go idle: {}", self.minor, e);
        }
        host.drm_dev_unregister(self.minor);
        driver.unload(host, self.private);
    }

    /// Minor number assigned by the host
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Platform device backing this DRM device
    pub fn platform_device(&self) -> Option<&PlatformDevice> {
        self.platformdev.as_ref()
    }

    /// Driver-private structure
    pub fn private(&self) -> &D::DevicePrivate {
        &self.private
    }

    /// Number of open files
    pub fn open_count(&self) -> usize {
        self.files.len()
    }

    /// Open file `id`
    pub fn file(&self, id: FileId) -> Option<&DrmFile<D::FilePrivate>> {
        self.files.get(&id)
    }

    /// Open a new client
    ///
    /// A client opening while no master is open becomes master and is
    /// authenticated. If the driver's open hook fails, no file is created.
    pub fn open(&mut self, driver: &mut D, privileged: bool) -> DriverResult<FileId> {
        let id = FileId(self.next_file);
        let private = driver.open(&mut self.private, id)?;
        self.next_file += 1;

        let is_master = self.files.values().all(|f| !f.is_master);
        debug!("DRM: open {} on minor {} (master: {})", id, self.minor, is_master);
        self.files.insert(
            id,
            DrmFile {
                id,
                is_master,
                authenticated: is_master,
                privileged,
                private,
            },
        );
        Ok(id)
    }

    /// Close client `id`
    pub fn release(&mut self, driver: &mut D, id: FileId) -> DriverResult<()> {
        let file = self
            .files
            .remove(&id)
            .ok_or_else(|| DriverError::InvalidArgument(format!("{} is not open", id)))?;
        self.close_file(driver, file);
        if self.files.is_empty() {
            driver.lastclose(&mut self.private);
        }
        Ok(())
    }

    fn close_file(&mut self, driver: &mut D, mut file: DrmFile<D::FilePrivate>) {
        debug!("DRM: close {} on minor {}", file.id, self.minor);
        driver.preclose(&mut self.private, &mut file.private);
        driver.postclose(&mut self.private, file.private);
    }

    /// Mark client `id` as authenticated
    pub fn authenticate(&mut self, id: FileId) -> DriverResult<()> {
        let file = self.file_mut(id)?;
        file.authenticated = true;
        Ok(())
    }

    /// Dispatch ioctl `cmd` from client `id`
    pub fn ioctl(&mut self, driver: &mut D, id: FileId, cmd: u32, data: &mut [u8]) -> DriverResult<i32> {
        let nr = ioc_nr(cmd);
        if !(DRM_COMMAND_BASE..DRM_COMMAND_END).contains(&nr) {
            return Err(DriverError::InvalidArgument(format!("ioctl 0x{:08x} is not a driver ioctl", cmd)));
        }
        let index = nr - DRM_COMMAND_BASE;
        let desc = driver
            .descriptor()
            .ioctl(index)
            .ok_or_else(|| DriverError::InvalidArgument(format!("no driver ioctl 0x{:02x}", index)))?;

        let minor = self.minor;
        let file = self
            .files
            .get_mut(&id)
            .ok_or_else(|| DriverError::InvalidArgument(format!("{} is not open", id)))?;

        let denied = (desc.flags.contains(IoctlFlags::ROOT_ONLY) && !file.privileged)
            || (desc.flags.contains(IoctlFlags::AUTH) && !file.authenticated)
            || (desc.flags.contains(IoctlFlags::MASTER) && !file.is_master);
        if denied {
            debug!("DRM: {} denied {} on minor {}", desc.name, id, minor);
            return Err(DriverError::PermissionDenied(format!("{} by {}", desc.name, id)));
        }

        debug!("DRM: {} from {} on minor {}", desc.name, id, minor);
        driver.ioctl(&mut self.private, &mut file.private, index, data)
    }

    /// Wait for the GPU to go idle
    pub fn quiesce(&mut self, driver: &mut D) -> DriverResult<()> {
        driver.dma_quiescent(&mut self.private)
    }

    /// Map `len` bytes at `offset` for client `id`
    pub fn mmap(&self, host: &dyn Host, id: FileId, offset: u64, len: u64) -> DriverResult<()> {
        self.files
            .get(&id)
            .ok_or_else(|| DriverError::InvalidArgument(format!("{} is not open", id)))?;
        host.drm_legacy_mmap(self.minor, offset, len)
    }

    /// Ready events for client `id`
    pub fn poll(&self, host: &dyn Host, id: FileId) -> DriverResult<u32> {
        self.files
            .get(&id)
            .ok_or_else(|| DriverError::InvalidArgument(format!("{} is not open", id)))?;
        Ok(host.drm_poll(self.minor))
    }

    fn file_mut(&mut self, id: FileId) -> DriverResult<&mut DrmFile<D::FilePrivate>> {
        self.files
            .get_mut(&id)
            .ok_or_else(|| DriverError::InvalidArgument(format!("{} is not open", id)))
    }
}

impl<D: DrmDriver> std::fmt::Debug for DrmDevice<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmDevice")
            .field("minor", &self.minor)
            .field("platformdev", &self.platformdev)
            .field("open_files", &self.files.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fops::drm_iowr;
    use crate::driver::{DriverDescriptor, IoctlDesc};
    use crate::host::MockHost;

    static TABLE: &[IoctlDesc] = &[
        IoctlDesc { nr: 0x00, name: "OPEN_FOR_ALL", flags: IoctlFlags::empty() },
        IoctlDesc { nr: 0x01, name: "AUTH_ONLY", flags: IoctlFlags::AUTH },
        IoctlDesc { nr: 0x03, name: "MASTER_ROOT", flags: IoctlFlags::MASTER.union(IoctlFlags::ROOT_ONLY) },
    ];

    /// Counts hook invocations; private structures are plain counters
    struct CountingDriver {
        desc: DriverDescriptor,
        loads: usize,
        unloads: usize,
        opens: usize,
        preclose: usize,
        postclose: usize,
        lastclose: usize,
        fail_open: bool,
    }

    impl CountingDriver {
        fn new() -> Self {
            let mut desc = DriverDescriptor::new(TABLE);
            desc.num_ioctls = desc.max_ioctl();
            Self {
                desc,
                loads: 0,
                unloads: 0,
                opens: 0,
                preclose: 0,
                postclose: 0,
                lastclose: 0,
                fail_open: false,
            }
        }
    }

    impl DrmDriver for CountingDriver {
        type DevicePrivate = u32;
        type FilePrivate = FileId;

        fn descriptor(&self) -> &DriverDescriptor {
            &self.desc
        }

        fn load(&mut self, _host: &dyn Host, _pdev: &mut Option<PlatformDevice>, chipset: u64) -> DriverResult<u32> {
            self.loads += 1;
            Ok(chipset as u32)
        }

        fn unload(&mut self, _host: &dyn Host, _dev: u32) {
            self.unloads += 1;
        }

        fn open(&mut self, _dev: &mut u32, file: FileId) -> DriverResult<FileId> {
            if self.fail_open {
                return Err(DriverError::OutOfMemory("file_priv"));
            }
            self.opens += 1;
            Ok(file)
        }

        fn preclose(&mut self, _dev: &mut u32, _file: &mut FileId) {
            self.preclose += 1;
        }

        fn postclose(&mut self, _dev: &mut u32, _file: FileId) {
            self.postclose += 1;
        }

        fn lastclose(&mut self, _dev: &mut u32) {
            self.lastclose += 1;
        }

        fn dma_quiescent(&mut self, _dev: &mut u32) -> DriverResult<()> {
            Ok(())
        }

        fn ioctl(&mut self, dev: &mut u32, _file: &mut FileId, nr: u32, _data: &mut [u8]) -> DriverResult<i32> {
            *dev += 1;
            Ok(nr as i32)
        }
    }

    fn pdev() -> PlatformDevice {
        PlatformDevice::simple("gpu", -1)
    }

    fn registered(driver: &mut CountingDriver) -> DrmDevice<CountingDriver> {
        let mut host = MockHost::new();
        host.expect_drm_dev_register().times(1).returning(|_, _| Ok(4));
        DrmDevice::platform_init(driver, &host, &pdev()).unwrap()
    }

    #[test]
    fn test_register_failure_unloads() {
        let mut driver = CountingDriver::new();
        let mut host = MockHost::new();
        host.expect_drm_dev_register()
            .times(1)
            .returning(|_, _| Err(DriverError::Host { call: "drm_dev_register", errno: -libc::EIO }));

        let err = DrmDevice::platform_init(&mut driver, &host, &pdev()).unwrap_err();
        assert_eq!(err.to_errno(), -libc::EIO);
        assert_eq!((driver.loads, driver.unloads), (1, 1));
    }

    #[test]
    fn test_first_opener_is_master() {
        let mut driver = CountingDriver::new();
        let mut dev = registered(&mut driver);
        assert_eq!(dev.minor(), 4);

        let a = dev.open(&mut driver, false).unwrap();
        let b = dev.open(&mut driver, false).unwrap();
        assert!(dev.file(a).unwrap().is_master);
        assert!(dev.file(a).unwrap().authenticated);
        assert!(!dev.file(b).unwrap().is_master);
        assert!(!dev.file(b).unwrap().authenticated);

        // Master moves to the next opener only once the old one is gone.
        dev.release(&mut driver, a).unwrap();
        let c = dev.open(&mut driver, false).unwrap();
        assert!(dev.file(c).unwrap().is_master);
    }

    #[test]
    fn test_failed_open_creates_no_file() {
        let mut driver = CountingDriver::new();
        let mut dev = registered(&mut driver);
        driver.fail_open = true;
        let err = dev.open(&mut driver, false).unwrap_err();
        assert_eq!(err.to_errno(), -libc::ENOMEM);
        assert_eq!(dev.open_count(), 0);

        driver.fail_open = false;
        assert_eq!(dev.open(&mut driver, false).unwrap(), FileId(0));
    }

    #[test]
    fn test_lastclose_runs_once_when_last_file_closes() {
        let mut driver = CountingDriver::new();
        let mut dev = registered(&mut driver);
        let a = dev.open(&mut driver, false).unwrap();
        let b = dev.open(&mut driver, false).unwrap();

        dev.release(&mut driver, a).unwrap();
        assert_eq!(driver.lastclose, 0);
        dev.release(&mut driver, b).unwrap();
        assert_eq!((driver.preclose, driver.postclose, driver.lastclose), (2, 2, 1));

        assert!(dev.release(&mut driver, b).is_err());
        assert_eq!(driver.postclose, 2);
    }

    #[test]
    fn test_ioctl_permissions() {
        let mut driver = CountingDriver::new();
        let mut dev = registered(&mut driver);
        let master = dev.open(&mut driver, false).unwrap();
        let client = dev.open(&mut driver, false).unwrap();

        let mut data = [0u8; 8];
        assert_eq!(dev.ioctl(&mut driver, client, drm_iowr(0x00, 8), &mut data).unwrap(), 0);

        let err = dev.ioctl(&mut driver, client, drm_iowr(0x01, 8), &mut data).unwrap_err();
        assert_eq!(err.to_errno(), -libc::EACCES);
        dev.authenticate(client).unwrap();
        assert_eq!(dev.ioctl(&mut driver, client, drm_iowr(0x01, 8), &mut data).unwrap(), 1);

        // Master but not privileged.
        let err = dev.ioctl(&mut driver, master, drm_iowr(0x03, 8), &mut data).unwrap_err();
        assert_eq!(err.to_errno(), -libc::EACCES);
    }

    #[test]
    fn test_ioctl_out_of_range() {
        let mut driver = CountingDriver::new();
        let mut dev = registered(&mut driver);
        let file = dev.open(&mut driver, true).unwrap();
        let mut data = [0u8; 4];

        // Hole in the table, past the table, and a core ioctl number.
        for cmd in [drm_iowr(0x02, 4), drm_iowr(0x04, 4), 0xc004_6400] {
            let err = dev.ioctl(&mut driver, file, cmd, &mut data).unwrap_err();
            assert_eq!(err.to_errno(), -libc::EINVAL);
        }
        assert_eq!(*dev.private(), 0);
    }

    #[test]
    fn test_put_closes_files_and_unloads() {
        let mut driver = CountingDriver::new();
        let mut dev = registered(&mut driver);
        dev.open(&mut driver, false).unwrap();
        dev.open(&mut driver, false).unwrap();

        let mut host = MockHost::new();
        host.expect_drm_dev_unregister().withf(|minor| *minor == 4).times(1).return_const(());
        dev.put(&mut driver, &host);

        assert_eq!(driver.postclose, 2);
        assert_eq!(driver.lastclose, 1);
        assert_eq!(driver.unloads, 1);
    }
}
