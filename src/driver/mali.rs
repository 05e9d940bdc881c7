//! Mali platform driver
//!
//! `MaliDriver` is the driver context: descriptor, allocation tracker, GPU
//! hooks and the default platform device registered by the first `load`
//! without one. It implements the platform, component master and DRM
//! callback sets.

use super::device::DevicePrivate;
use super::drm::DrmDevice;
use super::file::{FileId, FilePrivate};
use super::{ComponentMaster, DriverDescriptor, DrmDriver, PlatformDriver};
use crate::alloc::AllocTracker;
use crate::error::{DriverError, DriverResult};
use crate::gpu::GpuOps;
use crate::host::{dma_bit_mask, ComponentMatch, Host, MasterState, PlatformDevice};
use crate::of::{OfMatchTable, MALI_DT_IDS};
use log::{debug, error, info};

/// Name of the platform driver and of the default platform device
pub const DRIVER_NAME: &str = "mali_drm";

/// Coherent DMA addressing width of the GPU
pub const DMA_BITS: u32 = 32;

/// Driver context
#[derive(Debug)]
pub struct MaliDriver<G> {
    gpu: G,
    descriptor: DriverDescriptor,
    alloc: AllocTracker,
    default_pdev: Option<PlatformDevice>,
}

impl<G: GpuOps> MaliDriver<G> {
    /// Driver over `gpu`; the ioctl table is not wired yet
    pub fn new(gpu: G, alloc: AllocTracker) -> Self {
        let descriptor = DriverDescriptor::new(gpu.ioctls());
        Self {
            gpu,
            descriptor,
            alloc,
            default_pdev: None,
        }
    }

    /// Make the ioctl table reachable: set `num_ioctls` to the table count
    pub fn wire_ioctls(&mut self) {
        self.descriptor.num_ioctls = self.descriptor.max_ioctl();
    }

    /// GPU hooks
    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    /// GPU hooks, mutably
    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }

    /// Tracker every private structure is allocated from
    pub fn allocator(&self) -> &AllocTracker {
        &self.alloc
    }

    /// Platform device registered by `load`, if any
    pub fn default_platform_device(&self) -> Option<&PlatformDevice> {
        self.default_pdev.as_ref()
    }

    /// Hand the default platform device over, e.g. to unregister it
    pub fn take_default_platform_device(&mut self) -> Option<PlatformDevice> {
        self.default_pdev.take()
    }
}

impl<G: GpuOps> DrmDriver for MaliDriver<G> {
    type DevicePrivate = DevicePrivate;
    type FilePrivate = FilePrivate;

    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    fn load(
        &mut self,
        host: &dyn Host,
        platformdev: &mut Option<PlatformDevice>,
        chipset: u64,
    ) -> DriverResult<DevicePrivate> {
        let dev_priv = DevicePrivate::new(&self.alloc, chipset).map_err(|e| {
            error!("mali: cannot allocate device private: {}", e);
            e
        })?;

        if platformdev.is_none() {
            let pdev = match &self.default_pdev {
                Some(pdev) => pdev.clone(),
                None => {
                    let pdev = host
                        .platform_device_register_simple(DRIVER_NAME, 0)
                        .map_err(|e| {
                            error!("mali: cannot register default device: {}", e);
                            e
                        })?;
                    info!("mali: registered default device {}", pdev.dev_name());
                    self.default_pdev = Some(pdev.clone());
                    pdev
                }
            };
            *platformdev = Some(pdev);
        }

        debug!("mali: loaded chipset {}", chipset);
        Ok(dev_priv)
    }

    fn unload(&mut self, _host: &dyn Host, dev: DevicePrivate) {
        debug!("mali: unloading chipset {} ({} objects)", dev.chipset(), dev.objects().len());
    }

    fn open(&mut self, _dev: &mut DevicePrivate, file: FileId) -> DriverResult<FilePrivate> {
        FilePrivate::new(&self.alloc, file).map_err(|e| {
            error!("mali: cannot allocate private data for {}: {}", file, e);
            e
        })
    }

    fn preclose(&mut self, dev: &mut DevicePrivate, file: &mut FilePrivate) {
        self.gpu.reclaim_buffers_locked(dev, file);
    }

    fn postclose(&mut self, _dev: &mut DevicePrivate, file: FilePrivate) {
        drop(file);
    }

    fn lastclose(&mut self, dev: &mut DevicePrivate) {
        self.gpu.lastclose(dev);
    }

    fn dma_quiescent(&mut self, dev: &mut DevicePrivate) -> DriverResult<()> {
        self.gpu.idle(dev)
    }

    fn ioctl(
        &mut self,
        dev: &mut DevicePrivate,
        file: &mut FilePrivate,
        nr: u32,
        data: &mut [u8],
    ) -> DriverResult<i32> {
        self.gpu.ioctl(dev, file, nr, data)
    }
}

impl<G: GpuOps> ComponentMaster for MaliDriver<G> {
    type Bound = DrmDevice<Self>;

    fn bind(&mut self, host: &dyn Host, master: &PlatformDevice) -> DriverResult<DrmDevice<Self>> {
        DrmDevice::platform_init(self, host, master)
    }

    fn unbind(&mut self, host: &dyn Host, bound: DrmDevice<Self>) {
        bound.put(self, host);
    }
}

/// State of one probed master device
#[derive(Debug)]
pub struct MaliMaster<G: GpuOps> {
    pdev: PlatformDevice,
    drm: Option<DrmDevice<MaliDriver<G>>>,
}

impl<G: GpuOps> MaliMaster<G> {
    /// Platform device this master was probed for
    pub fn platform_device(&self) -> &PlatformDevice {
        &self.pdev
    }

    /// DRM device, once the master is bound
    pub fn drm(&self) -> Option<&DrmDevice<MaliDriver<G>>> {
        self.drm.as_ref()
    }

    /// DRM device, mutably
    pub fn drm_mut(&mut self) -> Option<&mut DrmDevice<MaliDriver<G>>> {
        self.drm.as_mut()
    }

    /// Whether the DRM device exists
    pub fn is_bound(&self) -> bool {
        self.drm.is_some()
    }

    /// Bind now that every component is present
    ///
    /// Binding an already bound master does nothing.
    pub fn bind(&mut self, driver: &mut MaliDriver<G>, host: &dyn Host) -> DriverResult<()> {
        if self.drm.is_none() {
            self.drm = Some(driver.bind(host, &self.pdev)?);
        }
        Ok(())
    }
}

impl<G: GpuOps> PlatformDriver for MaliDriver<G> {
    type Data = MaliMaster<G>;

    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn of_match_table(&self) -> &'static OfMatchTable {
        &MALI_DT_IDS
    }

    fn probe(&mut self, host: &dyn Host, pdev: &PlatformDevice) -> DriverResult<MaliMaster<G>> {
        let node = pdev
            .of_node
            .as_ref()
            .ok_or_else(|| DriverError::InvalidArgument(format!("{} has no device-tree node", pdev.dev_name())))?;

        let mut components = ComponentMatch::new();
        for child in node.available_children() {
            components.add(child);
        }
        if components.is_empty() {
            error!("mali: {} has no available components", pdev.dev_name());
            return Err(DriverError::NoDevice(format!("no components under {}", node.path)));
        }

        let state = host.component_master_add_with_match(pdev, &components)?;
        let mut master = MaliMaster {
            pdev: pdev.clone(),
            drm: None,
        };
        if state == MasterState::Ready {
            if let Err(e) = master.bind(self, host) {
                host.component_master_del(pdev);
                return Err(e);
            }
        }

        if let Err(e) = host.dma_set_coherent_mask(pdev, dma_bit_mask(DMA_BITS)) {
            error!("mali: cannot set DMA mask on {}: {}", pdev.dev_name(), e);
            self.remove(host, pdev, master);
            return Err(e);
        }

        info!(
            "mali: probed {} with {} components ({:?})",
            pdev.dev_name(),
            components.len(),
            state
        );
        Ok(master)
    }

    fn remove(&mut self, host: &dyn Host, pdev: &PlatformDevice, master: MaliMaster<G>) {
        if let Some(drm) = master.drm {
            self.unbind(host, drm);
        }
        host.component_master_del(pdev);
        host.of_platform_depopulate(pdev);
        debug!("mali: removed {}", pdev.dev_name());
    }
}
